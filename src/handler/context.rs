//! Request context for handlers.
//!
//! Provides methods for responding to a request:
//! - `respond` - send a response with a payload
//! - `respond_empty` - send a bodiless response (acks, heartbeats)
//! - `respond_result` - send a successful invocation outcome
//! - `error` - send an error outcome
//!
//! Every response header is built by the request's response factory, so it
//! carries the request's `msg_id`, `session_id` and serialization.
//!
//! # Example
//!
//! ```ignore
//! async fn echo(request: RequestMessage, ctx: RequestContext) -> Result<()> {
//!     let args = request.payload.and_then(|p| p.as_invocation().map(|i| i.args.clone()));
//!     ctx.respond_result(serde_json::json!(args)).await
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::PluginRegistry;
use crate::config::CodecConfig;
use crate::error::Result;
use crate::protocol::{
    FrameCodec, Header, Message, Payload, RequestMessage, ResponseFactory, ResponseMessage,
    ResponsePayload, SessionManager,
};
use crate::writer::{OutboundFrame, WriterHandle};

/// Context passed to request handlers.
///
/// `RequestContext` is `Clone` and can be moved into spawned tasks; every
/// clone answers the same request.
#[derive(Clone)]
pub struct RequestContext {
    header: Header,
    responder: Arc<dyn ResponseFactory>,
    remote_addr: Option<SocketAddr>,
    codec: Arc<FrameCodec>,
    sessions: Arc<SessionManager>,
    /// Writer handle for sending responses.
    writer: Option<WriterHandle>,
}

impl RequestContext {
    /// Create a context without a writer (responses are discarded).
    pub fn new(request: &RequestMessage) -> Self {
        let codec = FrameCodec::new(
            Arc::new(PluginRegistry::with_defaults()),
            CodecConfig::default(),
        );
        Self::attach(
            request,
            Arc::new(codec),
            Arc::new(SessionManager::new()),
            None,
        )
    }

    /// Create a context bound to a connection.
    pub fn attach(
        request: &RequestMessage,
        codec: Arc<FrameCodec>,
        sessions: Arc<SessionManager>,
        writer: Option<WriterHandle>,
    ) -> Self {
        Self {
            header: request.header.clone(),
            responder: Arc::clone(request.responder()),
            remote_addr: request.remote_addr,
            codec,
            sessions,
            writer,
        }
    }

    /// Header of the request being answered.
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn msg_id(&self) -> u32 {
        self.header.msg_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Session table of the connection.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn codec(&self) -> &Arc<FrameCodec> {
        &self.codec
    }

    /// Send a response with the given payload.
    pub async fn respond(&self, payload: impl Into<Payload>) -> Result<()> {
        let response = self.responder.create(&self.header, Some(payload.into()));
        self.send_response(response).await
    }

    /// Send a response without a body.
    pub async fn respond_empty(&self) -> Result<()> {
        let response = self.responder.create(&self.header, None);
        self.send_response(response).await
    }

    /// Send a successful invocation outcome.
    pub async fn respond_result(&self, value: impl Into<serde_json::Value>) -> Result<()> {
        self.respond(ResponsePayload::ok(value)).await
    }

    /// Send an error outcome.
    pub async fn error(&self, message: &str) -> Result<()> {
        self.respond(ResponsePayload::error(message)).await
    }

    /// Encode and queue a prepared response.
    pub async fn send_response(&self, response: ResponseMessage) -> Result<()> {
        let writer = match &self.writer {
            Some(w) => w,
            None => {
                // No writer configured (testing mode)
                return Ok(());
            }
        };

        let (_, bytes) = self.codec.encode_to_bytes(Message::Response(response))?;
        writer.send(OutboundFrame::new(bytes)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialization_id;
    use crate::protocol::{Invocation, MsgType};
    use crate::writer::spawn_writer_task_default;
    use tokio::io::{duplex, AsyncReadExt};

    fn request(id: u32) -> RequestMessage {
        RequestMessage::new(
            Header::new(MsgType::BizReq, id)
                .with_session_id(2)
                .with_serialization(serialization_id::MSGPACK),
            Some(Payload::Invocation(Invocation::new("svc", "m"))),
        )
    }

    #[test]
    fn test_context_creation() {
        let ctx = RequestContext::new(&request(42));
        assert_eq!(ctx.msg_id(), 42);
        assert_eq!(ctx.header().session_id, 2);
        assert!(ctx.remote_addr().is_none());
    }

    #[tokio::test]
    async fn test_all_response_methods_without_writer() {
        let ctx = RequestContext::new(&request(1));

        assert!(ctx.respond(ResponsePayload::ok(1)).await.is_ok());
        assert!(ctx.respond_empty().await.is_ok());
        assert!(ctx.respond_result("done").await.is_ok());
        assert!(ctx.error("error message").await.is_ok());
    }

    #[tokio::test]
    async fn test_response_is_correlated() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);

        let req = request(42);
        let codec = Arc::new(FrameCodec::new(
            Arc::new(PluginRegistry::with_defaults()),
            CodecConfig::default(),
        ));
        let ctx = RequestContext::attach(
            &req,
            Arc::clone(&codec),
            Arc::new(SessionManager::new()),
            Some(writer),
        );

        ctx.error("bad input").await.unwrap();

        let mut buffer = codec.frame_buffer();
        let mut frames = Vec::new();
        let mut chunk = [0u8; 256];
        while frames.is_empty() {
            let n = server.read(&mut chunk).await.unwrap();
            frames.extend(buffer.push(&chunk[..n]).unwrap());
        }

        let msg = codec.decode(frames.remove(0)).unwrap().unwrap();
        assert_eq!(msg.msg_type(), Some(MsgType::BizResp));
        assert_eq!(msg.msg_id(), 42);
        assert_eq!(msg.header().session_id, 2);
        let outcome = msg.payload().and_then(Payload::as_response).unwrap();
        assert_eq!(outcome.exception.as_deref(), Some("bad input"));
    }

    #[test]
    fn test_context_is_clone() {
        let ctx = RequestContext::new(&request(9));
        let ctx2 = ctx.clone();
        assert_eq!(ctx.msg_id(), ctx2.msg_id());
        assert!(Arc::ptr_eq(ctx.sessions(), ctx2.sessions()));
    }
}
