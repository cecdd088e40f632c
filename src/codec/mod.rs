//! Codec plugins - payload serialization and body compression.
//!
//! Plugins are selected per message by the numeric ids carried in the
//! header and resolved through a [`PluginRegistry`]:
//!
//! - [`MsgPackSerialization`] - MessagePack using `rmp-serde` (struct-as-map)
//! - [`JsonSerialization`] - JSON using `serde_json`
//! - [`DeflateCompression`], [`GzipCompression`], [`ZlibCompression`] - `flate2`
//!
//! # Design
//!
//! Plugins are trait objects so a registry can be extended at startup with
//! dialect-specific formats. Unknown ids resolve to `None`; the frame codec
//! turns that into a format error rather than guessing.
//!
//! # Example
//!
//! ```
//! use rpcwire::codec::{serialization_id, PluginRegistry};
//!
//! let registry = PluginRegistry::with_defaults();
//! let msgpack = registry.serialization(serialization_id::MSGPACK).unwrap();
//! assert_eq!(msgpack.name(), "msgpack");
//! assert!(registry.serialization(200).is_none());
//! ```

mod compression;
mod json;
mod msgpack;
mod registry;
mod serialization;

pub use compression::{
    compress_adaptive, decompress_bounded, Compression, DeflateCompression, GzipCompression,
    ZlibCompression,
};
pub use json::JsonSerialization;
pub use msgpack::MsgPackSerialization;
pub use registry::PluginRegistry;
pub use serialization::Serialization;

/// Serialization plugin ids.
pub mod serialization_id {
    /// MessagePack.
    pub const MSGPACK: u8 = 3;
    /// JSON.
    pub const JSON: u8 = 9;
}

/// Compression plugin ids.
pub mod compression_id {
    /// Uncompressed body.
    pub const NONE: u8 = 0;
    pub const DEFLATE: u8 = 1;
    pub const GZIP: u8 = 2;
    pub const ZLIB: u8 = 3;
}
