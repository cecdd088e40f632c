//! Transport and codec configuration.
//!
//! Both structs deserialize with `#[serde(default)]`, so a config loader only
//! needs to supply the fields it wants to change. Durations are milliseconds.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::{compression_id, serialization_id};
use crate::protocol::{DEFAULT_COMPRESS_THRESHOLD, DEFAULT_MAX_FRAME_SIZE, MAGIC_CODE};
use crate::writer::WriterConfig;

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Default time a graceful close waits for in-flight requests.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 3_000;

/// Default size of the inbound handler pool.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Frame codec settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Bytes preceding every frame, may be empty.
    pub magic: Vec<u8>,
    /// Bodies up to this size are never compressed.
    pub compress_threshold: usize,
    /// Largest total length accepted from a peer.
    pub max_frame_size: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            magic: MAGIC_CODE.to_vec(),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl CodecConfig {
    pub fn with_magic(mut self, magic: impl Into<Vec<u8>>) -> Self {
        self.magic = magic.into();
        self
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max;
        self
    }
}

/// Per-connection transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Applied when a request header carries no positive timeout.
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound on how long a graceful close drains in-flight requests.
    pub drain_timeout_ms: u64,
    /// Idle interval after which a client sends a heartbeat. Off when `None`.
    pub heartbeat_interval_ms: Option<u64>,
    /// Inbound requests handled concurrently; extra requests are rejected.
    pub max_concurrent_handlers: usize,
    /// Serialization id stamped on outbound messages without one.
    pub serialization: u8,
    /// Compression id requested for outbound messages.
    pub compression: u8,
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout_ms: u64,
    pub codec: CodecConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let writer = WriterConfig::default();
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            heartbeat_interval_ms: None,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            serialization: serialization_id::MSGPACK,
            compression: compression_id::NONE,
            max_pending_frames: writer.max_pending_frames,
            channel_capacity: writer.channel_capacity,
            backpressure_timeout_ms: writer.backpressure_timeout.as_millis() as u64,
            codec: CodecConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = max;
        self
    }

    pub fn with_serialization(mut self, id: u8) -> Self {
        self.serialization = id;
        self
    }

    pub fn with_compression(mut self, id: u8) -> Self {
        self.compression = id;
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms.map(Duration::from_millis)
    }

    /// Writer task settings derived from this config.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.serialization, serialization_id::MSGPACK);
        assert_eq!(config.compression, compression_id::NONE);
        assert_eq!(config.codec.magic, vec![0xDA, 0xCE]);
        assert_eq!(config.codec.compress_threshold, 1024);
        assert!(config.heartbeat_interval().is_none());
        assert_eq!(config.writer_config().max_pending_frames, config.max_pending_frames);
    }

    #[test]
    fn test_partial_deserialize() {
        let config: TransportConfig = serde_json::from_str(
            r#"{"request_timeout_ms": 250, "codec": {"compress_threshold": 64}}"#,
        )
        .unwrap();
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.codec.compress_threshold, 64);
        assert_eq!(config.codec.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn test_setters() {
        let config = TransportConfig::default()
            .with_request_timeout(Duration::from_millis(10))
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_compression(compression_id::GZIP)
            .with_codec(CodecConfig::default().with_magic(Vec::new()));
        assert_eq!(config.request_timeout_ms, 10);
        assert_eq!(config.heartbeat_interval_ms, Some(30_000));
        assert_eq!(config.compression, 2);
        assert!(config.codec.magic.is_empty());
    }
}
