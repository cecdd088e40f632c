//! Wire format constants and primitive field codecs.
//!
//! Frame layout (all multi-byte integers Big Endian):
//! ```text
//! ┌───────┬──────────┬────────────┬──────┬───────┬─────────┬─────┬─────┬─────────┬───────┬────────────┬─────────┐
//! │ Magic │ Total    │ Header len │ Type │ MsgId │ Session │ Ser │ Cmp │ Timeout │ Attrs │ Attr [...] │ Payload │
//! │ 0..n  │ int32    │ int16      │ byte │ int32 │ int32   │ byte│ byte│ int32   │ byte  │ k,t,value  │         │
//! └───────┴──────────┴────────────┴──────┴───────┴─────────┴─────┴─────┴─────────┴───────┴────────────┴─────────┘
//! ```
//!
//! `Total` counts from its own first byte to the end of the payload, and
//! `Header len` counts from its own first byte through the last attribute, so
//! `payload = total - header_len - 4`.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

use super::header::{AttrValue, Attributes};

/// Default magic bytes preceding the length field.
pub const MAGIC_CODE: [u8; 2] = [0xDA, 0xCE];

/// Size of the total-length field.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Fixed part of the header section, from the header-length field to the
/// attribute count inclusive.
pub const FIXED_HEADER_SIZE: usize = 2 + 1 + 4 + 4 + 1 + 1 + 4 + 1;

/// Offset of the compression selector inside the header section.
pub const COMPRESSION_OFFSET: usize = 2 + 1 + 4 + 4 + 1;

/// Smallest frame the length field may announce.
pub const MIN_FRAME_SIZE: u32 = (LENGTH_FIELD_SIZE + FIXED_HEADER_SIZE) as u32;

/// Default maximum frame size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Payloads at or below this many bytes are sent uncompressed.
///
/// Peers using the same default produce identical frames.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

/// Maximum number of attributes in one header (count is a single byte).
pub const MAX_ATTRIBUTES: usize = u8::MAX as usize;

/// Attribute value type tags.
pub mod attr_type {
    /// 32-bit signed integer.
    pub const INT32: u8 = 1;
    /// UTF-8 string prefixed by a uint16 byte length.
    pub const STRING: u8 = 2;
    /// 8-bit signed integer.
    pub const INT8: u8 = 3;
    /// 16-bit signed integer.
    pub const INT16: u8 = 4;
}

/// Ensure `n` more bytes are readable.
#[inline]
fn need(remaining: usize, n: usize, field: &str) -> Result<(), CodecError> {
    if remaining < n {
        return Err(CodecError::format(format!(
            "truncated frame while reading {}: need {} bytes, have {}",
            field, n, remaining
        )));
    }
    Ok(())
}

/// Read a single byte.
pub fn read_u8(buf: &mut impl Buf, field: &str) -> Result<u8, CodecError> {
    need(buf.remaining(), 1, field)?;
    Ok(buf.get_u8())
}

/// Read a big-endian uint16.
pub fn read_u16(buf: &mut impl Buf, field: &str) -> Result<u16, CodecError> {
    need(buf.remaining(), 2, field)?;
    Ok(buf.get_u16())
}

/// Read a big-endian uint32.
pub fn read_u32(buf: &mut impl Buf, field: &str) -> Result<u32, CodecError> {
    need(buf.remaining(), 4, field)?;
    Ok(buf.get_u32())
}

/// Read a big-endian int32.
pub fn read_i32(buf: &mut impl Buf, field: &str) -> Result<i32, CodecError> {
    need(buf.remaining(), 4, field)?;
    Ok(buf.get_i32())
}

/// Encode an attribute map: count byte followed by `[key][type][value]`.
///
/// Entries are written in ascending key order so equal maps produce equal bytes.
pub fn encode_attributes(attributes: &Attributes, dst: &mut BytesMut) -> Result<(), CodecError> {
    let entries = attributes.snapshot();
    if entries.len() > MAX_ATTRIBUTES {
        return Err(CodecError::format(format!(
            "too many attributes: {} (max {})",
            entries.len(),
            MAX_ATTRIBUTES
        )));
    }

    dst.put_u8(entries.len() as u8);
    for (key, value) in &entries {
        dst.put_u8(*key);
        dst.put_u8(value.type_tag());
        match value {
            AttrValue::Int32(v) => dst.put_i32(*v),
            AttrValue::Int8(v) => dst.put_i8(*v),
            AttrValue::Int16(v) => dst.put_i16(*v),
            AttrValue::Str(s) => {
                let len = u16::try_from(s.len()).map_err(|_| {
                    CodecError::format(format!(
                        "attribute {} string too long: {} bytes",
                        key,
                        s.len()
                    ))
                })?;
                dst.put_u16(len);
                dst.put_slice(s.as_bytes());
            }
        }
    }
    Ok(())
}

/// Decode attributes into `attributes`, returning how many were read.
///
/// Entries read before a failure stay in the map so the error header shows
/// how far decoding got.
pub fn decode_attributes(
    buf: &mut impl Buf,
    attributes: &Attributes,
) -> Result<usize, CodecError> {
    let count = read_u8(buf, "attribute count")? as usize;
    for _ in 0..count {
        let key = read_u8(buf, "attribute key")?;
        let tag = read_u8(buf, "attribute type")?;
        let value = match tag {
            attr_type::INT32 => AttrValue::Int32(read_i32(buf, "int32 attribute")?),
            attr_type::INT8 => AttrValue::Int8(read_u8(buf, "int8 attribute")? as i8),
            attr_type::INT16 => AttrValue::Int16(read_u16(buf, "int16 attribute")? as i16),
            attr_type::STRING => {
                let len = read_u16(buf, "string attribute length")? as usize;
                need(buf.remaining(), len, "string attribute")?;
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                let s = String::from_utf8(raw).map_err(|e| {
                    CodecError::format(format!("attribute {} is not valid UTF-8: {}", key, e))
                })?;
                AttrValue::Str(s)
            }
            other => {
                return Err(CodecError::format(format!(
                    "unknown attribute value type {} for key {}",
                    other, key
                )))
            }
        };
        attributes.insert(key, value);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_header_size() {
        assert_eq!(FIXED_HEADER_SIZE, 18);
        assert_eq!(COMPRESSION_OFFSET, 12);
        assert_eq!(MIN_FRAME_SIZE, 22);
    }

    #[test]
    fn test_attribute_wire_layout() {
        let attrs = Attributes::new();
        attrs.insert(1, "tenant-A");
        attrs.insert(2, 7i32);

        let mut buf = BytesMut::new();
        encode_attributes(&attrs, &mut buf).unwrap();

        let expected: Vec<u8> = [
            &[2u8][..],                         // count
            &[1, attr_type::STRING, 0, 8][..],  // key 1, string, len 8
            &b"tenant-A"[..],
            &[2, attr_type::INT32, 0, 0, 0, 7][..],
        ]
        .concat();
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_attribute_widths_preserved() {
        let attrs = Attributes::new();
        attrs.insert(1, 100_000i32);
        attrs.insert(2, -3i8);
        attrs.insert(3, 1234i16);
        attrs.insert(4, "x");

        let mut buf = BytesMut::new();
        encode_attributes(&attrs, &mut buf).unwrap();

        let decoded = Attributes::new();
        let count = decode_attributes(&mut buf.freeze(), &decoded).unwrap();

        assert_eq!(count, 4);
        assert_eq!(decoded.get(1), Some(AttrValue::Int32(100_000)));
        assert_eq!(decoded.get(2), Some(AttrValue::Int8(-3)));
        assert_eq!(decoded.get(3), Some(AttrValue::Int16(1234)));
        assert_eq!(decoded.get(4), Some(AttrValue::Str("x".to_string())));
    }

    #[test]
    fn test_unknown_attribute_type_rejected() {
        let raw: &[u8] = &[1, 9, 5, 0, 0];
        let decoded = Attributes::new();
        let err = decode_attributes(&mut &raw[..], &decoded).unwrap_err();
        assert!(err.is_format());
        assert!(err.message().contains("unknown attribute value type 5"));
    }

    #[test]
    fn test_truncated_attribute() {
        let raw: &[u8] = &[1, 1, attr_type::INT32, 0, 0];
        let decoded = Attributes::new();
        let err = decode_attributes(&mut &raw[..], &decoded).unwrap_err();
        assert!(err.message().contains("truncated"));
    }

    #[test]
    fn test_read_helpers_big_endian() {
        let raw: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF, 0xFF, 0xFE];
        let mut buf = raw;
        assert_eq!(read_u32(&mut buf, "a").unwrap(), 0x01020304);
        assert_eq!(read_i32(&mut buf, "b").unwrap(), -2);
        assert!(read_u8(&mut buf, "c").is_err());
    }
}
