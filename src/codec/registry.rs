//! Plugin lookup by numeric id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::compression::{Compression, DeflateCompression, GzipCompression, ZlibCompression};
use super::json::JsonSerialization;
use super::msgpack::MsgPackSerialization;
use super::serialization::Serialization;

/// Serialization and compression plugins known to a codec.
///
/// Populated before the first connection opens; lookups return `None` for
/// unknown ids and never fall back to a default.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    serializations: HashMap<u8, Arc<dyn Serialization>>,
    compressions: HashMap<u8, Arc<dyn Compression>>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with MsgPack, JSON, deflate, gzip and zlib.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register_serialization(MsgPackSerialization)
            .register_serialization(JsonSerialization)
            .register_compression(DeflateCompression::default())
            .register_compression(GzipCompression::default())
            .register_compression(ZlibCompression::default());
        registry
    }

    /// Add or replace a serialization plugin under its own id.
    pub fn register_serialization<S>(&mut self, plugin: S) -> &mut Self
    where
        S: Serialization + 'static,
    {
        self.serializations.insert(plugin.id(), Arc::new(plugin));
        self
    }

    /// Add or replace a compression plugin under its own id.
    pub fn register_compression<C>(&mut self, plugin: C) -> &mut Self
    where
        C: Compression + 'static,
    {
        self.compressions.insert(plugin.id(), Arc::new(plugin));
        self
    }

    pub fn serialization(&self, id: u8) -> Option<Arc<dyn Serialization>> {
        self.serializations.get(&id).cloned()
    }

    pub fn compression(&self, id: u8) -> Option<Arc<dyn Compression>> {
        self.compressions.get(&id).cloned()
    }

    /// Registered serialization ids, ascending.
    pub fn serialization_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.serializations.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered compression ids, ascending.
    pub fn compression_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.compressions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("serializations", &self.serialization_ids())
            .field("compressions", &self.compression_ids())
            .finish()
    }
}
