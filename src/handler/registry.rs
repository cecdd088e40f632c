//! Handler registry for dispatching requests by message type.
//!
//! Each request type (`HeartbeatReq`, `BizReq`, ...) has at most one handler.
//! Registering a type again replaces the previous handler.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::handler::HandlerRegistry;
//! use rpcwire::protocol::MsgType;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register(MsgType::HeartbeatReq, |_req, ctx| async move {
//!     ctx.respond_empty().await
//! });
//!
//! registry.register_invocations(MsgType::BizReq, |inv, _ctx| async move {
//!     Ok(serde_json::json!(inv.args))
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use super::RequestContext;
use crate::error::{Result, RpcError};
use crate::protocol::{Invocation, MsgType, Payload, RequestMessage, ResponsePayload};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for request handlers.
pub trait Handler: Send + Sync + 'static {
    /// Handle a decoded request.
    fn call(&self, request: RequestMessage, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper turning an async closure into a [`Handler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(RequestMessage, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(RequestMessage, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(RequestMessage, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, request: RequestMessage, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(request, ctx))
    }
}

/// Wrapper that extracts the [`Invocation`] before calling the handler.
///
/// The handler's value is sent back as a successful outcome, its error as
/// an error outcome. A request without an invocation body is answered with
/// an error outcome and never reaches the handler.
pub struct InvocationHandler<F, Fut>
where
    F: Fn(Invocation, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> InvocationHandler<F, Fut>
where
    F: Fn(Invocation, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for InvocationHandler<F, Fut>
where
    F: Fn(Invocation, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn call(&self, request: RequestMessage, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let invocation = match request.payload {
            Some(Payload::Invocation(inv)) => inv,
            _ => {
                return Box::pin(async move { ctx.error("request carries no invocation").await });
            }
        };

        let fut = (self.handler)(invocation, ctx.clone());
        Box::pin(async move {
            let outcome = match fut.await {
                Ok(value) => ResponsePayload::ok(value),
                Err(e) => ResponsePayload::error(e.to_string()),
            };
            ctx.respond(outcome).await
        })
    }
}

/// Registry mapping request types to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MsgType, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for `msg_type`.
    pub fn register<F, Fut>(&mut self, msg_type: MsgType, handler: F) -> &mut Self
    where
        F: Fn(RequestMessage, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(msg_type, FnHandler::new(handler))
    }

    /// Register an invocation handler for `msg_type`.
    pub fn register_invocations<F, Fut>(&mut self, msg_type: MsgType, handler: F) -> &mut Self
    where
        F: Fn(Invocation, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.register_handler(msg_type, InvocationHandler::new(handler))
    }

    /// Register a handler object for `msg_type`.
    pub fn register_handler<H: Handler>(&mut self, msg_type: MsgType, handler: H) -> &mut Self {
        if !msg_type.is_request() {
            debug!(msg_type = %msg_type, "registering handler for a response type");
        }
        self.handlers.insert(msg_type, Arc::new(handler));
        self
    }

    /// Add every handler of `other`, replacing handlers for the same types.
    pub fn merge(&mut self, other: HandlerRegistry) -> &mut Self {
        self.handlers.extend(other.handlers);
        self
    }

    /// Get a handler by message type.
    pub fn get(&self, msg_type: MsgType) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&msg_type).cloned()
    }

    pub fn contains(&self, msg_type: MsgType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch a request to the handler for its message type.
    pub async fn dispatch(&self, request: RequestMessage, ctx: RequestContext) -> Result<()> {
        let code = request.header.msg_type;
        let handler = request
            .header
            .message_type()
            .and_then(|t| self.get(t))
            .ok_or(RpcError::HandlerNotFound(code))?;

        handler.call(request, ctx).await
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().map(|t| t.name()).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Header;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(msg_type: MsgType, payload: Option<Payload>) -> RequestMessage {
        RequestMessage::new(Header::new(msg_type, 1), payload)
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = HandlerRegistry::new();
        registry.register(MsgType::HeartbeatReq, |_req, _ctx| async { Ok(()) });
        registry.register(MsgType::HeartbeatReq, |_req, _ctx| async { Ok(()) });

        assert!(registry.contains(MsgType::HeartbeatReq));
        assert!(!registry.contains(MsgType::BizReq));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut registry = HandlerRegistry::new();
        registry.register(MsgType::BizReq, move |req, _ctx| {
            let seen = Arc::clone(&seen);
            async move {
                assert_eq!(req.header.msg_id, 1);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let req = request(MsgType::BizReq, None);
        let ctx = RequestContext::new(&req);
        registry.dispatch(req, ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_not_found() {
        let registry = HandlerRegistry::new();
        let req = request(MsgType::CallbackReq, None);
        let ctx = RequestContext::new(&req);

        let err = registry.dispatch(req, ctx).await.unwrap_err();
        assert!(matches!(err, RpcError::HandlerNotFound(8)));
    }

    #[tokio::test]
    async fn test_invocation_handler_receives_arguments() {
        let mut registry = HandlerRegistry::new();
        registry.register_invocations(MsgType::BizReq, |inv, _ctx| async move {
            assert_eq!(inv.method, "add");
            let sum: i64 = inv.args.iter().filter_map(|a| a.as_i64()).sum();
            Ok(serde_json::json!(sum))
        });

        let inv = Invocation::new("calc", "add").with_arg(2).with_arg(3);
        let req = request(MsgType::BizReq, Some(inv.into()));
        let ctx = RequestContext::new(&req);
        registry.dispatch(req, ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_invocation_handler_without_body() {
        let called = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&called);

        let mut registry = HandlerRegistry::new();
        registry.register_invocations(MsgType::BizReq, move |_inv, _ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(serde_json::Value::Null) }
        });

        let req = request(MsgType::BizReq, None);
        let ctx = RequestContext::new(&req);
        registry.dispatch(req, ctx).await.unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }
}
