//! Error types for rpcwire.
//!
//! Codec failures are reported through [`CodecError`], which always carries
//! the best-known [`Header`] so the connection layer can still route an error
//! response using the original `msg_id`/`session_id`.

use std::fmt;

use thiserror::Error;

use crate::protocol::Header;

/// Category of a codec failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    /// Malformed frame: bad magic, unknown message type, unknown attribute
    /// type, unknown plugin id, truncated or inconsistent lengths.
    Format,
    /// Payload could not be serialized or deserialized.
    Serialization,
    /// Stream or compression I/O failure.
    Io,
}

impl fmt::Display for CodecErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecErrorKind::Format => f.write_str("format"),
            CodecErrorKind::Serialization => f.write_str("serialization"),
            CodecErrorKind::Io => f.write_str("io"),
        }
    }
}

/// Error raised while encoding or decoding a frame.
#[derive(Debug, Error)]
#[error("codec {kind} error: {message}")]
pub struct CodecError {
    kind: CodecErrorKind,
    message: String,
    header: Option<Box<Header>>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CodecError {
    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self {
            kind: CodecErrorKind::Format,
            message: message.into(),
            header: None,
            source: None,
        }
    }

    /// Create a serialization error wrapping the underlying serde failure.
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: CodecErrorKind::Serialization,
            message: message.into(),
            header: None,
            source: Some(Box::new(source)),
        }
    }

    /// Create an I/O error.
    pub fn io(source: std::io::Error) -> Self {
        Self {
            kind: CodecErrorKind::Io,
            message: source.to_string(),
            header: None,
            source: Some(Box::new(source)),
        }
    }

    /// Attach the header known at the time of failure.
    ///
    /// An already attached header is kept: it is the one closest to the failure.
    pub fn with_header(mut self, header: &Header) -> Self {
        if self.header.is_none() {
            self.header = Some(Box::new(header.clone()));
        }
        self
    }

    /// Failure category.
    #[inline]
    pub fn kind(&self) -> CodecErrorKind {
        self.kind
    }

    /// Human readable detail without the category prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Header as far as it was decoded (or the header being encoded).
    pub fn header(&self) -> Option<&Header> {
        self.header.as_deref()
    }

    /// Check if this is a format violation.
    #[inline]
    pub fn is_format(&self) -> bool {
        self.kind == CodecErrorKind::Format
    }
}

/// Main error type for all rpcwire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encode/decode failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// No response arrived before the deadline.
    #[error("request {msg_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Correlation id of the expired call.
        msg_id: u32,
        /// Effective timeout that elapsed.
        timeout_ms: u64,
    },

    /// Connection closed while the operation was in progress.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connect or bind failure.
    #[error("Connect error: {0}")]
    Connect(String),

    /// A pending call with this id is already registered.
    #[error("message id {0} is already pending")]
    DuplicateId(u32),

    /// Pending call was cancelled by the caller.
    #[error("request {0} cancelled")]
    Cancelled(u32),

    /// Illegal lifecycle transition.
    #[error("invalid state transition: {0}")]
    State(String),

    /// No handler registered for an inbound request type.
    #[error("Handler not found for message type: {0}")]
    HandlerNotFound(u8),

    /// Peer answered with an error response.
    #[error("remote error: {0}")]
    Remote(String),

    /// Protocol misuse (unexpected payload shape, wrong message polarity).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl RpcError {
    /// Check if this error is a timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Check if this error reports a lost connection.
    #[inline]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
