//! Built-in handlers for the control message types.
//!
//! [`HandlerRegistry::with_builtins`] installs:
//! - heartbeat: bodiless ack
//! - negotiation: picks the first serialization and compression both sides support
//! - session: binds a session id to plugin defaults in the connection's session table
//! - offline: logs the notice and acks
//! - authentication: delegates to an [`Authenticator`]
//!
//! Business and callback requests have no built-in handler.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::registry::{BoxFuture, Handler, HandlerRegistry, HandlerResult};
use super::RequestContext;
use crate::codec::{compression_id, PluginRegistry};
use crate::protocol::{
    AuthResult, Authentication, MsgType, Negotiation, Payload, RequestMessage, Session,
};

/// Decides whether a peer's credentials are accepted.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, request: &Authentication, peer: Option<SocketAddr>) -> AuthResult;
}

/// Accepts every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _request: &Authentication, _peer: Option<SocketAddr>) -> AuthResult {
        AuthResult {
            success: true,
            message: None,
        }
    }
}

impl<F> Authenticator for F
where
    F: Fn(&Authentication, Option<SocketAddr>) -> AuthResult + Send + Sync + 'static,
{
    fn authenticate(&self, request: &Authentication, peer: Option<SocketAddr>) -> AuthResult {
        self(request, peer)
    }
}

impl HandlerRegistry {
    /// Registry preloaded with the control handlers, accepting every peer.
    pub fn with_builtins(plugins: Arc<PluginRegistry>) -> Self {
        Self::with_authenticator(plugins, AllowAll)
    }

    /// Registry preloaded with the control handlers and a custom authenticator.
    pub fn with_authenticator(plugins: Arc<PluginRegistry>, authenticator: impl Authenticator) -> Self {
        let mut registry = Self::new();
        registry
            .register(MsgType::HeartbeatReq, |_req, ctx| async move {
                ctx.respond_empty().await
            })
            .register_handler(MsgType::NegotiationReq, NegotiationHandler { plugins })
            .register(MsgType::SessionReq, handle_session)
            .register(MsgType::OfflineReq, handle_offline)
            .register_handler(
                MsgType::AuthReq,
                AuthHandler {
                    authenticator: Arc::new(authenticator),
                },
            );
        registry
    }
}

struct NegotiationHandler {
    plugins: Arc<PluginRegistry>,
}

impl NegotiationHandler {
    fn choose(&self, offer: &Negotiation) -> Negotiation {
        let serialization = offer
            .serializations
            .iter()
            .copied()
            .find(|id| self.plugins.serialization(*id).is_some());

        let compression = offer
            .compressions
            .iter()
            .copied()
            .find(|id| *id == compression_id::NONE || self.plugins.compression(*id).is_some())
            .unwrap_or(compression_id::NONE);

        Negotiation {
            serializations: self.plugins.serialization_ids(),
            compressions: self.plugins.compression_ids(),
            serialization,
            compression: Some(compression),
            attributes: Default::default(),
        }
    }
}

impl Handler for NegotiationHandler {
    fn call(&self, request: RequestMessage, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let offer = match request.payload {
            Some(Payload::Negotiation(n)) => n,
            _ => Negotiation::default(),
        };
        let chosen = self.choose(&offer);

        match chosen.serialization {
            Some(id) => debug!(serialization = id, compression = ?chosen.compression, "negotiated plugins"),
            None => warn!(offered = ?offer.serializations, "no common serialization"),
        }

        Box::pin(async move { ctx.respond(chosen).await })
    }
}

async fn handle_session(request: RequestMessage, ctx: RequestContext) -> HandlerResult {
    let id = request.header.session_id;
    match request.payload {
        Some(Payload::Session(s)) if id > 0 => {
            ctx.sessions().add(Session::new(id, s.serialization, s.compression));
            debug!(session_id = id, serialization = s.serialization, compression = s.compression, "session opened");
        }
        _ => warn!(session_id = id, "ignoring session request without a positive id or body"),
    }
    ctx.respond_empty().await
}

async fn handle_offline(request: RequestMessage, ctx: RequestContext) -> HandlerResult {
    let reason = match &request.payload {
        Some(Payload::Offline(notice)) => notice.reason.clone(),
        _ => None,
    };
    info!(peer = ?ctx.remote_addr(), reason = ?reason, "peer going offline");
    ctx.respond_empty().await
}

struct AuthHandler {
    authenticator: Arc<dyn Authenticator>,
}

impl Handler for AuthHandler {
    fn call(&self, request: RequestMessage, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let result = match &request.payload {
            Some(Payload::Authentication(auth)) => {
                self.authenticator.authenticate(auth, ctx.remote_addr())
            }
            _ => AuthResult {
                success: false,
                message: Some("missing credentials".to_string()),
            },
        };

        if !result.success {
            warn!(peer = ?ctx.remote_addr(), "authentication rejected");
        }

        Box::pin(async move { ctx.respond(result).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialization_id;
    use crate::config::CodecConfig;
    use crate::protocol::{FrameCodec, Header, Message, SessionManager, SessionPayload};
    use crate::writer::spawn_writer_task_default;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn codec() -> Arc<FrameCodec> {
        Arc::new(FrameCodec::new(
            Arc::new(PluginRegistry::with_defaults()),
            CodecConfig::default(),
        ))
    }

    /// Dispatch `request` through the builtins and decode the single reply.
    async fn roundtrip(
        registry: &HandlerRegistry,
        sessions: Arc<SessionManager>,
        request: RequestMessage,
    ) -> Message {
        let (client, mut server): (DuplexStream, DuplexStream) = duplex(8192);
        let (writer, _task) = spawn_writer_task_default(client);
        let codec = codec();

        let ctx = RequestContext::attach(&request, Arc::clone(&codec), sessions, Some(writer));
        registry.dispatch(request, ctx).await.unwrap();

        let mut buffer = codec.frame_buffer();
        let mut chunk = [0u8; 1024];
        loop {
            let n = server.read(&mut chunk).await.unwrap();
            let mut frames = buffer.push(&chunk[..n]).unwrap();
            if !frames.is_empty() {
                return codec.decode(frames.remove(0)).unwrap().unwrap();
            }
        }
    }

    fn header(msg_type: MsgType, id: u32) -> Header {
        Header::new(msg_type, id).with_serialization(serialization_id::MSGPACK)
    }

    #[tokio::test]
    async fn test_heartbeat_ack() {
        let registry = HandlerRegistry::with_builtins(Arc::new(PluginRegistry::with_defaults()));
        let reply = roundtrip(
            &registry,
            Arc::new(SessionManager::new()),
            RequestMessage::new(header(MsgType::HeartbeatReq, 11), None),
        )
        .await;

        assert_eq!(reply.msg_type(), Some(MsgType::HeartbeatResp));
        assert_eq!(reply.msg_id(), 11);
        assert!(reply.payload().is_none());
    }

    #[tokio::test]
    async fn test_negotiation_picks_first_supported() {
        let registry = HandlerRegistry::with_builtins(Arc::new(PluginRegistry::with_defaults()));
        let offer = Negotiation {
            serializations: vec![42, serialization_id::JSON, serialization_id::MSGPACK],
            compressions: vec![77, compression_id::GZIP],
            ..Default::default()
        };
        let reply = roundtrip(
            &registry,
            Arc::new(SessionManager::new()),
            RequestMessage::new(header(MsgType::NegotiationReq, 3), Some(offer.into())),
        )
        .await;

        match reply.payload() {
            Some(Payload::Negotiation(n)) => {
                assert_eq!(n.serialization, Some(serialization_id::JSON));
                assert_eq!(n.compression, Some(compression_id::GZIP));
                assert!(n.serializations.contains(&serialization_id::MSGPACK));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_negotiation_without_overlap() {
        let handler = NegotiationHandler {
            plugins: Arc::new(PluginRegistry::with_defaults()),
        };
        let chosen = handler.choose(&Negotiation {
            serializations: vec![100],
            compressions: vec![100],
            ..Default::default()
        });
        assert_eq!(chosen.serialization, None);
        assert_eq!(chosen.compression, Some(compression_id::NONE));
    }

    #[tokio::test]
    async fn test_session_binds_defaults() {
        let registry = HandlerRegistry::with_builtins(Arc::new(PluginRegistry::with_defaults()));
        let sessions = Arc::new(SessionManager::new());
        let body = SessionPayload {
            serialization: serialization_id::JSON,
            compression: compression_id::ZLIB,
            ..Default::default()
        };

        let reply = roundtrip(
            &registry,
            Arc::clone(&sessions),
            RequestMessage::new(header(MsgType::SessionReq, 5).with_session_id(9), Some(body.into())),
        )
        .await;

        assert_eq!(reply.msg_type(), Some(MsgType::SessionResp));
        let session = sessions.get(9).unwrap();
        assert_eq!(session.serialization(), serialization_id::JSON);
        assert_eq!(session.compression(), compression_id::ZLIB);
    }

    #[tokio::test]
    async fn test_session_requires_positive_id() {
        let registry = HandlerRegistry::with_builtins(Arc::new(PluginRegistry::with_defaults()));
        let sessions = Arc::new(SessionManager::new());

        roundtrip(
            &registry,
            Arc::clone(&sessions),
            RequestMessage::new(
                header(MsgType::SessionReq, 5),
                Some(SessionPayload::default().into()),
            ),
        )
        .await;

        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_custom_authenticator() {
        let registry = HandlerRegistry::with_authenticator(
            Arc::new(PluginRegistry::with_defaults()),
            |auth: &Authentication, _peer: Option<SocketAddr>| AuthResult {
                success: auth.credential == b"secret",
                message: None,
            },
        );

        let auth = Authentication {
            principal: "svc".into(),
            credential: b"wrong".to_vec(),
            ..Default::default()
        };
        let reply = roundtrip(
            &registry,
            Arc::new(SessionManager::new()),
            RequestMessage::new(header(MsgType::AuthReq, 8), Some(auth.into())),
        )
        .await;

        assert_eq!(reply.msg_type(), Some(MsgType::AuthResp));
        match reply.payload() {
            Some(Payload::AuthResult(r)) => assert!(!r.success),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_builtins_leave_business_types_open() {
        let registry = HandlerRegistry::with_builtins(Arc::new(PluginRegistry::with_defaults()));
        assert!(registry.contains(MsgType::HeartbeatReq));
        assert!(registry.contains(MsgType::AuthReq));
        assert!(!registry.contains(MsgType::BizReq));
        assert!(!registry.contains(MsgType::CallbackReq));
    }
}
