//! Protocol module - header model, message types, and the frame codec.
//!
//! This module implements the binary protocol:
//! - Header with typed extension attributes
//! - Closed message type registry with request/response pairs
//! - Typed payload shapes and request/response messages
//! - Session table consulted while decoding
//! - Frame buffer for accumulating partial reads
//! - Frame codec applying serialization and compression plugins

mod codec;
mod frame_buffer;
mod header;
mod message;
mod message_type;
mod payload;
mod session;
mod wire_format;

pub use codec::{Converter, FrameCodec, HeaderConverter, MessageConverter};
pub use frame_buffer::FrameBuffer;
pub use header::{AttrValue, Attributes, Header};
pub use message::{DefaultResponseFactory, Message, RequestMessage, ResponseFactory, ResponseMessage};
pub use message_type::MsgType;
pub use payload::{
    AuthResult, Authentication, Invocation, Negotiation, OfflineNotice, Payload, PayloadKind,
    ResponsePayload, SessionPayload,
};
pub use session::{Session, SessionManager};
pub use wire_format::{
    attr_type, COMPRESSION_OFFSET, DEFAULT_COMPRESS_THRESHOLD, DEFAULT_MAX_FRAME_SIZE,
    FIXED_HEADER_SIZE, LENGTH_FIELD_SIZE, MAGIC_CODE, MAX_ATTRIBUTES, MIN_FRAME_SIZE,
};
