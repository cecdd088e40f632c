//! Frame codec: (header, payload) to bytes and back.
//!
//! Encoding writes the fixed header with placeholders for the total length,
//! header length and compression selector, then back-patches all three once
//! the attributes and body are known. Decoding consumes frames produced by
//! [`FrameBuffer`](super::FrameBuffer), which start at the length field.
//!
//! Every error carries the header as far as it was known so the connection
//! can still answer the right `msg_id`.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame_buffer::FrameBuffer;
use super::header::Header;
use super::message::Message;
use super::message_type::MsgType;
use super::payload::Payload;
use super::session::SessionManager;
use super::wire_format::{
    decode_attributes, encode_attributes, read_i32, read_u16, read_u32, read_u8,
    LENGTH_FIELD_SIZE, MIN_FRAME_SIZE,
};
use crate::codec::{compress_adaptive, compression_id, decompress_bounded, PluginRegistry};
use crate::config::CodecConfig;
use crate::error::CodecError;

/// Maps header selectors between a wire dialect and local codes.
///
/// Every method defaults to the identity.
pub trait HeaderConverter: Send + Sync {
    fn msg_type(&self, code: u8) -> u8 {
        code
    }

    fn serialization(&self, id: u8) -> u8 {
        id
    }

    fn compression(&self, id: u8) -> u8 {
        id
    }
}

/// Whole-message rewrite applied before encode or after decode.
pub type MessageConverter = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// Protocol adaptation hooks.
///
/// Outbound hooks run before framing; the inbound header hook runs before the
/// message type is classified and the inbound message hook runs last.
#[derive(Clone, Default)]
pub struct Converter {
    pub outbound_header: Option<Arc<dyn HeaderConverter>>,
    pub inbound_header: Option<Arc<dyn HeaderConverter>>,
    pub outbound_message: Option<MessageConverter>,
    pub inbound_message: Option<MessageConverter>,
}

impl fmt::Debug for Converter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Converter")
            .field("outbound_header", &self.outbound_header.is_some())
            .field("inbound_header", &self.inbound_header.is_some())
            .field("outbound_message", &self.outbound_message.is_some())
            .field("inbound_message", &self.inbound_message.is_some())
            .finish()
    }
}

/// Wire selectors after the outbound header converter.
struct WireSelectors {
    msg_type: u8,
    serialization: u8,
    compression: u8,
    no_compression: u8,
}

impl WireSelectors {
    fn new(header: &Header, converter: Option<&dyn HeaderConverter>) -> Self {
        match converter {
            Some(c) => Self {
                msg_type: c.msg_type(header.msg_type),
                serialization: c.serialization(header.serialization),
                compression: c.compression(header.compression),
                no_compression: c.compression(compression_id::NONE),
            },
            None => Self {
                msg_type: header.msg_type,
                serialization: header.serialization,
                compression: header.compression,
                no_compression: compression_id::NONE,
            },
        }
    }
}

/// Encoder/decoder for one connection's frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    plugins: Arc<PluginRegistry>,
    config: CodecConfig,
    converter: Converter,
    sessions: Option<Arc<SessionManager>>,
}

impl FrameCodec {
    pub fn new(plugins: Arc<PluginRegistry>, config: CodecConfig) -> Self {
        Self {
            plugins,
            config,
            converter: Converter::default(),
            sessions: None,
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = converter;
        self
    }

    /// Resolve decoded `session_id`s against this table.
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn sessions(&self) -> Option<&Arc<SessionManager>> {
        self.sessions.as_ref()
    }

    /// A frame decoder matching this codec's magic and size limit.
    pub fn frame_buffer(&self) -> FrameBuffer {
        FrameBuffer::with_config(&self.config.magic, self.config.max_frame_size)
    }

    /// Encode `message` into a standalone buffer.
    pub fn encode_to_bytes(&self, message: Message) -> Result<(Header, Bytes), CodecError> {
        let mut dst = BytesMut::with_capacity(256);
        let header = self.encode(message, &mut dst)?;
        Ok((header, dst.freeze()))
    }

    /// Append one frame for `message` to `dst`.
    ///
    /// Returns the header as written: lengths filled in and `compression`
    /// reset to none when the body stayed below the threshold.
    pub fn encode(&self, message: Message, dst: &mut BytesMut) -> Result<Header, CodecError> {
        let message = match &self.converter.outbound_message {
            Some(convert) => convert(message),
            None => message,
        };
        let mut header = message.header().clone();

        let start = dst.len();
        match self.encode_into(&mut header, message.payload(), dst) {
            Ok(()) => Ok(header),
            Err(e) => {
                dst.truncate(start);
                Err(e.with_header(&header))
            }
        }
    }

    fn encode_into(
        &self,
        header: &mut Header,
        payload: Option<&Payload>,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let wire = WireSelectors::new(header, self.converter.outbound_header.as_deref());

        dst.put_slice(&self.config.magic);
        let length_pos = dst.len();
        dst.put_u32(0);

        let header_pos = dst.len();
        dst.put_u16(0);
        dst.put_u8(wire.msg_type);
        dst.put_u32(header.msg_id);
        dst.put_i32(header.session_id);
        dst.put_u8(wire.serialization);
        let compression_pos = dst.len();
        dst.put_u8(wire.compression);
        dst.put_i32(header.timeout);
        encode_attributes(header.attributes(), dst)?;

        let header_length = u16::try_from(dst.len() - header_pos).map_err(|_| {
            CodecError::format(format!(
                "header section of {} bytes exceeds 65535",
                dst.len() - header_pos
            ))
        })?;
        dst[header_pos..header_pos + 2].copy_from_slice(&header_length.to_be_bytes());

        let body = self.serialize_body(header, payload)?;
        let compressed = self.write_body(header, &body, dst)?;
        if !compressed {
            dst[compression_pos] = wire.no_compression;
            header.compression = compression_id::NONE;
        }

        let total = dst.len() - length_pos;
        if total > self.config.max_frame_size as usize {
            return Err(CodecError::format(format!(
                "frame of {} bytes exceeds maximum {}",
                total, self.config.max_frame_size
            )));
        }
        dst[length_pos..length_pos + LENGTH_FIELD_SIZE]
            .copy_from_slice(&(total as u32).to_be_bytes());

        header.set_lengths(total as u32, header_length);
        Ok(())
    }

    fn serialize_body(
        &self,
        header: &Header,
        payload: Option<&Payload>,
    ) -> Result<Vec<u8>, CodecError> {
        match payload {
            None => Ok(Vec::new()),
            Some(Payload::Raw(raw)) => Ok(raw.to_vec()),
            Some(payload) => {
                let plugin = self.plugins.serialization(header.serialization).ok_or_else(|| {
                    CodecError::format(format!(
                        "unknown serialization id {}",
                        header.serialization
                    ))
                })?;
                let mut body = Vec::with_capacity(128);
                plugin.serialize(payload, &mut body)?;
                Ok(body)
            }
        }
    }

    /// Append the body, compressed when selected and large enough.
    fn write_body(
        &self,
        header: &Header,
        body: &[u8],
        dst: &mut BytesMut,
    ) -> Result<bool, CodecError> {
        if header.compression == compression_id::NONE {
            dst.put_slice(body);
            return Ok(false);
        }

        let plugin = self.plugins.compression(header.compression).ok_or_else(|| {
            CodecError::format(format!("unknown compression id {}", header.compression))
        })?;

        let mut out = Vec::with_capacity(body.len());
        let compressed = compress_adaptive(
            plugin.as_ref(),
            self.config.compress_threshold,
            body,
            &mut out,
        )
        .map_err(CodecError::io)?;
        dst.put_slice(&out);
        Ok(compressed)
    }

    /// Decode one frame starting at its length field.
    ///
    /// Returns `Ok(None)` for an empty input.
    pub fn decode(&self, frame: Bytes) -> Result<Option<Message>, CodecError> {
        if frame.is_empty() {
            return Ok(None);
        }

        let mut header = Header::with_raw_type(0, 0);
        let message = self
            .decode_frame(frame, &mut header)
            .map_err(|e| e.with_header(&header))?;

        Ok(Some(match &self.converter.inbound_message {
            Some(convert) => convert(message),
            None => message,
        }))
    }

    fn decode_frame(&self, mut buf: Bytes, header: &mut Header) -> Result<Message, CodecError> {
        let frame_len = buf.len();
        let total = read_u32(&mut buf, "total length")? as usize;
        if total < MIN_FRAME_SIZE as usize {
            return Err(CodecError::format(format!(
                "frame length {} below minimum {}",
                total, MIN_FRAME_SIZE
            )));
        }
        if total > frame_len {
            return Err(CodecError::format(format!(
                "truncated frame: length field says {} bytes, have {}",
                total, frame_len
            )));
        }
        buf.truncate(total - LENGTH_FIELD_SIZE);

        let header_length = read_u16(&mut buf, "header length")?;
        header.msg_type = read_u8(&mut buf, "message type")?;
        header.msg_id = read_u32(&mut buf, "message id")?;
        header.session_id = read_i32(&mut buf, "session id")?;
        header.serialization = read_u8(&mut buf, "serialization id")?;
        header.compression = read_u8(&mut buf, "compression id")?;
        header.timeout = read_i32(&mut buf, "timeout")?;
        header.set_header_length(header_length);
        decode_attributes(&mut buf, header.attributes())?;

        let consumed = total - LENGTH_FIELD_SIZE - buf.remaining();
        if consumed != header_length as usize {
            return Err(CodecError::format(format!(
                "header length field says {} bytes, attributes end at {}",
                header_length, consumed
            )));
        }
        header.set_lengths(total as u32, header_length);

        if let Some(convert) = &self.converter.inbound_header {
            header.msg_type = convert.msg_type(header.msg_type);
            header.serialization = convert.serialization(header.serialization);
            header.compression = convert.compression(header.compression);
        }

        let msg_type = MsgType::try_from(header.msg_type)?;

        if let Some(sessions) = &self.sessions {
            header.bind_session(sessions);
        }

        let payload = if buf.has_remaining() {
            Some(self.decode_body(header, msg_type, buf)?)
        } else {
            None
        };

        Message::from_header(header.clone(), payload)
    }

    fn decode_body(
        &self,
        header: &Header,
        msg_type: MsgType,
        body: Bytes,
    ) -> Result<Payload, CodecError> {
        let body = if header.compression == compression_id::NONE {
            body
        } else {
            let plugin = self.plugins.compression(header.compression).ok_or_else(|| {
                CodecError::format(format!("unknown compression id {}", header.compression))
            })?;
            let limit = self.config.max_frame_size as usize;
            Bytes::from(decompress_bounded(plugin.as_ref(), &body, limit).map_err(CodecError::io)?)
        };

        let Some(kind) = msg_type.payload_kind() else {
            return Ok(Payload::Raw(body));
        };

        let plugin = self.plugins.serialization(header.serialization).ok_or_else(|| {
            CodecError::format(format!("unknown serialization id {}", header.serialization))
        })?;
        plugin.deserialize(&body, kind)
    }
}
