//! Compression plugins backed by `flate2`.
//!
//! Compression is adaptive: bodies at or below the threshold are written
//! uncompressed and the frame's compression selector is patched to
//! [`compression_id::NONE`](super::compression_id::NONE).

use std::io::{self, Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression as Level;

use super::compression_id;

/// A compression algorithm selected by numeric id.
pub trait Compression: Send + Sync {
    /// Wire id carried in the header.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    /// Compress `src` completely.
    fn compress(&self, src: &[u8]) -> io::Result<Vec<u8>>;

    /// Wrap `src` in a decompressing reader.
    fn decoder<'a>(&self, src: &'a [u8]) -> Box<dyn Read + 'a>;
}

macro_rules! flate_plugin {
    ($(#[$doc:meta])* $name:ident, $id:expr, $label:literal, $encoder:ident, $decoder:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            level: Level,
        }

        impl $name {
            pub fn with_level(level: u32) -> Self {
                Self {
                    level: Level::new(level),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    level: Level::default(),
                }
            }
        }

        impl Compression for $name {
            fn id(&self) -> u8 {
                $id
            }

            fn name(&self) -> &'static str {
                $label
            }

            fn compress(&self, src: &[u8]) -> io::Result<Vec<u8>> {
                let mut encoder = $encoder::new(Vec::with_capacity(src.len() / 2), self.level);
                encoder.write_all(src)?;
                encoder.finish()
            }

            fn decoder<'a>(&self, src: &'a [u8]) -> Box<dyn Read + 'a> {
                Box::new($decoder::new(src))
            }
        }
    };
}

flate_plugin!(
    /// Raw deflate stream (id 1).
    DeflateCompression,
    compression_id::DEFLATE,
    "deflate",
    DeflateEncoder,
    DeflateDecoder
);

flate_plugin!(
    /// Gzip container (id 2).
    GzipCompression,
    compression_id::GZIP,
    "gzip",
    GzEncoder,
    GzDecoder
);

flate_plugin!(
    /// Zlib container (id 3).
    ZlibCompression,
    compression_id::ZLIB,
    "zlib",
    ZlibEncoder,
    ZlibDecoder
);

/// Write `src` to `dst`, compressed only when it is larger than `threshold`.
///
/// Returns whether the output was compressed.
pub fn compress_adaptive(
    plugin: &dyn Compression,
    threshold: usize,
    src: &[u8],
    dst: &mut Vec<u8>,
) -> io::Result<bool> {
    if src.len() <= threshold {
        dst.extend_from_slice(src);
        return Ok(false);
    }
    dst.extend_from_slice(&plugin.compress(src)?);
    Ok(true)
}

/// Decompress `src`, failing once more than `limit` bytes come out.
pub fn decompress_bounded(plugin: &dyn Compression, src: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len().saturating_mul(2).min(limit));
    plugin
        .decoder(src)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} body inflates past {} bytes", plugin.name(), limit),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 7) as u8).collect()
    }

    #[test]
    fn test_plugins_round_trip() {
        let plugins: [&dyn Compression; 3] = [
            &DeflateCompression::default(),
            &GzipCompression::default(),
            &ZlibCompression::default(),
        ];
        let data = sample(4096);
        for plugin in plugins {
            let packed = plugin.compress(&data).unwrap();
            assert!(packed.len() < data.len(), "{} did not shrink", plugin.name());
            let unpacked = decompress_bounded(plugin, &packed, 1 << 20).unwrap();
            assert_eq!(unpacked, data);
        }
    }

    #[test]
    fn test_adaptive_threshold() {
        let plugin = GzipCompression::default();

        let mut small = Vec::new();
        assert!(!compress_adaptive(&plugin, 1024, &sample(1024), &mut small).unwrap());
        assert_eq!(small, sample(1024));

        let mut large = Vec::new();
        assert!(compress_adaptive(&plugin, 1024, &sample(1025), &mut large).unwrap());
        assert_ne!(large, sample(1025));
    }

    #[test]
    fn test_decompress_limit() {
        let plugin = ZlibCompression::with_level(9);
        let packed = plugin.compress(&vec![0u8; 10_000]).unwrap();
        let err = decompress_bounded(&plugin, &packed, 1000).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_corrupt_input() {
        let plugin = GzipCompression::default();
        assert!(decompress_bounded(&plugin, b"definitely not gzip", 1024).is_err());
    }
}
