//! Server builder and listener façade.
//!
//! A [`Server`] is a reference-counted TCP endpoint: every logical consumer
//! holds a [`Server`] obtained from [`ServerBuilder::bind`] or
//! [`Server::share`] and closes it when done. The listener is unbound when
//! the last holder closes.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::Server;
//!
//! let server = Server::builder("127.0.0.1:7000")
//!     .on_invoke(|inv, _ctx| async move { Ok(serde_json::json!(inv.args)) })
//!     .before_close(|| async { deregister().await })
//!     .bind()
//!     .await?;
//!
//! server.close(true).await;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::codec::{Compression, PluginRegistry, Serialization};
use crate::config::TransportConfig;
use crate::error::Result;
use crate::handler::{
    AllowAll, Authenticator, BoxFuture, HandlerRegistry, HandlerResult, RequestContext,
};
use crate::protocol::{Converter, FrameCodec, Invocation, MsgType, RequestMessage};
use crate::transport::{
    Channel, ConnState, ServerHandle, SharedEndpoint, StateMachine, TcpBinder,
};

type Hook = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Builder for configuring and binding a server.
pub struct ServerBuilder {
    addr: String,
    config: TransportConfig,
    plugins: PluginRegistry,
    handlers: HandlerRegistry,
    converter: Option<Converter>,
    authenticator: Box<dyn FnOnce(Arc<PluginRegistry>) -> HandlerRegistry + Send>,
    before_close: Option<Hook>,
    after_close: Option<Hook>,
    on_last_close: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ServerBuilder {
    /// Create a new server builder listening on `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            config: TransportConfig::default(),
            plugins: PluginRegistry::with_defaults(),
            handlers: HandlerRegistry::new(),
            converter: None,
            authenticator: Box::new(|plugins| HandlerRegistry::with_authenticator(plugins, AllowAll)),
            before_close: None,
            after_close: None,
            on_last_close: None,
        }
    }

    /// Replace the transport configuration applied to every connection.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Maximum requests handled concurrently per connection.
    ///
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config = self.config.with_max_concurrent_handlers(limit);
        self
    }

    pub fn register_serialization(mut self, plugin: impl Serialization + 'static) -> Self {
        self.plugins.register_serialization(plugin);
        self
    }

    pub fn register_compression(mut self, plugin: impl Compression + 'static) -> Self {
        self.plugins.register_compression(plugin);
        self
    }

    /// Install a wire dialect converter.
    pub fn converter(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Handle business invocations.
    pub fn on_invoke<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Invocation, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.handlers.register_invocations(MsgType::BizReq, handler);
        self
    }

    /// Handle any request type, replacing the built-in handler if there is one.
    pub fn handle<F, Fut>(mut self, msg_type: MsgType, handler: F) -> Self
    where
        F: Fn(RequestMessage, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(msg_type, handler);
        self
    }

    /// Decide which peers pass authentication. Default: everyone.
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator =
            Box::new(move |plugins| HandlerRegistry::with_authenticator(plugins, authenticator));
        self
    }

    /// Run `hook` before the listener is unbound (e.g. deregister from discovery).
    pub fn before_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_close = Some(Box::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(hook())
        }));
        self
    }

    /// Run `hook` after the listener is unbound.
    pub fn after_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_close = Some(Box::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(hook())
        }));
        self
    }

    /// Run `callback` each time the last holder closes the server.
    pub fn on_last_close<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_last_close = Some(Box::new(callback));
        self
    }

    /// Bind the listener and start accepting connections.
    pub async fn bind(self) -> Result<Server> {
        let plugins = Arc::new(self.plugins);

        let mut handlers = (self.authenticator)(Arc::clone(&plugins));
        handlers.merge(self.handlers);

        let mut codec = FrameCodec::new(plugins, self.config.codec.clone());
        if let Some(converter) = self.converter {
            codec = codec.with_converter(converter);
        }

        let binder = TcpBinder::new(self.addr, codec, Arc::new(handlers), self.config);
        let mut machine = StateMachine::new(binder);
        if let Some(hook) = self.before_close {
            machine = machine.with_before_close(move || hook());
        }
        if let Some(hook) = self.after_close {
            machine = machine.with_after_close(move || hook());
        }

        let mut endpoint = SharedEndpoint::new(machine);
        if let Some(callback) = self.on_last_close {
            endpoint = endpoint.with_pre_close(callback);
        }

        let endpoint = Arc::new(endpoint);
        let handle = endpoint.open().await?;
        Ok(Server { endpoint, handle })
    }
}

/// A bound server held by one logical consumer.
#[derive(Clone)]
pub struct Server {
    endpoint: Arc<SharedEndpoint<TcpBinder>>,
    handle: ServerHandle,
}

impl Server {
    /// Create a new server builder.
    pub fn builder(addr: impl Into<String>) -> ServerBuilder {
        ServerBuilder::new(addr)
    }

    /// Take another reference for a new logical consumer.
    ///
    /// The returned server must be closed like the original.
    pub async fn share(&self) -> Result<Server> {
        let handle = self.endpoint.open().await?;
        Ok(Server {
            endpoint: Arc::clone(&self.endpoint),
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Snapshot of the open connections.
    pub fn channels(&self) -> Vec<Channel> {
        self.handle.channels()
    }

    pub fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    pub fn state(&self) -> ConnState {
        self.endpoint.state()
    }

    /// Holders that have not closed yet.
    pub fn ref_count(&self) -> usize {
        self.endpoint.ref_count()
    }

    /// Release this holder; the last release unbinds the listener.
    pub async fn close(&self, graceful: bool) {
        self.endpoint.close(graceful).await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.handle.local_addr())
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .finish()
    }
}
