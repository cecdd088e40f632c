//! Client builder and connection façade.
//!
//! The [`ClientBuilder`] configures plugins, transport settings and callback
//! handlers, then connects. The [`Client`] manages the lifecycle:
//! 1. Dial the server through the lifecycle state machine
//! 2. Serve callback and control requests the server sends back
//! 3. Optionally send heartbeats when the connection sits idle
//! 4. Announce going offline and drain on graceful close
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::{Client, Invocation};
//!
//! #[tokio::main]
//! async fn main() -> rpcwire::Result<()> {
//!     let client = Client::builder("127.0.0.1:7000").connect().await?;
//!
//!     let sum = client
//!         .invoke(Invocation::new("calc", "add").with_arg(2).with_arg(3))
//!         .await?;
//!     println!("{sum}");
//!
//!     client.close(true).await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{Compression, PluginRegistry, Serialization};
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::handler::{HandlerRegistry, HandlerResult, RequestContext};
use crate::protocol::{
    AuthResult, Authentication, Converter, FrameCodec, Header, Invocation, Message, MsgType,
    Negotiation, OfflineNotice, Payload, RequestMessage, Session,
};
use crate::transport::{Channel, ConnState, StateMachine, TcpConnector};

/// Builder for configuring and connecting a client.
pub struct ClientBuilder {
    addr: String,
    config: TransportConfig,
    plugins: PluginRegistry,
    handlers: HandlerRegistry,
    converter: Option<Converter>,
}

impl ClientBuilder {
    /// Create a new client builder for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            config: TransportConfig::default(),
            plugins: PluginRegistry::with_defaults(),
            handlers: HandlerRegistry::new(),
            converter: None,
        }
    }

    /// Replace the transport configuration.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Default per-request timeout.
    ///
    /// Default: 5 seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_request_timeout(timeout);
        self
    }

    /// Send a heartbeat after the connection has been idle this long.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_heartbeat_interval(interval);
        self
    }

    /// Serialization id stamped on outbound messages.
    pub fn serialization(mut self, id: u8) -> Self {
        self.config = self.config.with_serialization(id);
        self
    }

    /// Compression id requested for outbound messages.
    pub fn compression(mut self, id: u8) -> Self {
        self.config = self.config.with_compression(id);
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

    /// Handle callback invocations sent by the server.
    pub fn on_callback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Invocation, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.handlers.register_invocations(MsgType::CallbackReq, handler);
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

    /// Connect to the server.
    pub async fn connect(self) -> Result<Client> {
        let plugins = Arc::new(self.plugins);

        let mut handlers = HandlerRegistry::with_builtins(Arc::clone(&plugins));
        handlers.merge(self.handlers);

        let mut codec = FrameCodec::new(plugins, self.config.codec.clone());
        if let Some(converter) = self.converter {
            codec = codec.with_converter(converter);
        }

        let heartbeat_interval = self.config.heartbeat_interval();
        let connector = TcpConnector::new(self.addr, codec, Arc::new(handlers), self.config);
        let machine = Arc::new(StateMachine::new(connector));
        let channel = machine.open().await?;
        tokio::spawn(watch_connection(Arc::clone(&machine), channel.clone()));

        let heartbeat = heartbeat_interval.map(|interval| {
            tokio::spawn(heartbeat_loop(channel.clone(), interval))
        });

        Ok(Client {
            machine,
            channel,
            heartbeat,
        })
    }
}

/// A connected client.
pub struct Client {
    machine: Arc<StateMachine<TcpConnector>>,
    channel: Channel,
    heartbeat: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a new client builder.
    pub fn builder(addr: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(addr)
    }

    /// Underlying channel, for sends the façade does not cover.
    ///
    /// Once [`state`](Self::state) leaves `Opened` the channel is dead.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn state(&self) -> ConnState {
        self.machine.state()
    }

    /// Invoke a remote method and wait for its result.
    ///
    /// An error outcome from the server becomes [`RpcError::Remote`].
    pub async fn invoke(&self, invocation: Invocation) -> Result<serde_json::Value> {
        self.invoke_with_timeout(invocation, None).await
    }

    pub async fn invoke_with_timeout(
        &self,
        invocation: Invocation,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let request = Message::request(Header::new(MsgType::BizReq, 0), Payload::from(invocation));
        let reply = self.channel.request(request, timeout).await?;

        match reply.into_payload() {
            Some(Payload::Response(outcome)) => match outcome.exception {
                Some(message) => Err(RpcError::Remote(message)),
                None => Ok(outcome.result.unwrap_or(serde_json::Value::Null)),
            },
            Some(other) => Err(RpcError::Protocol(format!(
                "unexpected reply payload {:?}",
                other.kind()
            ))),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Invoke a remote method without waiting for its result.
    ///
    /// Resolves once the request has been written.
    pub async fn notify(&self, invocation: Invocation) -> Result<()> {
        let request = Message::request(Header::new(MsgType::BizReq, 0), Payload::from(invocation));
        self.channel.oneway(request).await?.await
    }

    /// Round-trip a heartbeat and return the elapsed time.
    pub async fn heartbeat(&self) -> Result<Duration> {
        let start = Instant::now();
        let request = Message::request(Header::new(MsgType::HeartbeatReq, 0), None);
        self.channel.request(request, None).await?;
        Ok(start.elapsed())
    }

    /// Offer plugins in preference order and return the server's choice.
    pub async fn negotiate(&self, offer: Negotiation) -> Result<Negotiation> {
        let request = Message::request(Header::new(MsgType::NegotiationReq, 0), Payload::from(offer));
        match self.channel.request(request, None).await?.into_payload() {
            Some(Payload::Negotiation(chosen)) => Ok(chosen),
            other => Err(RpcError::Protocol(format!(
                "unexpected negotiation reply {:?}",
                other.as_ref().and_then(Payload::kind)
            ))),
        }
    }

    /// Open a session on both ends with fixed plugin defaults.
    ///
    /// Messages sent with this `session_id` and no explicit serialization
    /// use the session's ids afterwards.
    pub async fn open_session(&self, session: Session) -> Result<Arc<Session>> {
        if session.id() <= 0 {
            return Err(RpcError::Protocol(format!(
                "session id must be positive, got {}",
                session.id()
            )));
        }
        let body = crate::protocol::SessionPayload {
            serialization: session.serialization(),
            compression: session.compression(),
            attributes: Default::default(),
        };
        let header = Header::new(MsgType::SessionReq, 0)
            .with_session_id(session.id())
            .with_serialization(self.channel.config().serialization);
        self.channel
            .request(Message::request(header, Payload::from(body)), None)
            .await?;

        Ok(self.channel.sessions().add(session))
    }

    /// Present credentials to the server.
    pub async fn authenticate(&self, credentials: Authentication) -> Result<AuthResult> {
        let request = Message::request(Header::new(MsgType::AuthReq, 0), Payload::from(credentials));
        match self.channel.request(request, None).await?.into_payload() {
            Some(Payload::AuthResult(result)) => Ok(result),
            other => Err(RpcError::Protocol(format!(
                "unexpected authentication reply {:?}",
                other.as_ref().and_then(Payload::kind)
            ))),
        }
    }

    /// Close the connection.
    ///
    /// A graceful close tells the server this client is going offline and
    /// drains in-flight requests first.
    pub async fn close(&self, graceful: bool) {
        if let Some(task) = &self.heartbeat {
            task.abort();
        }

        if graceful && self.machine.is_open() {
            let notice = OfflineNotice {
                reason: Some("client closing".to_string()),
            };
            let request = Message::request(Header::new(MsgType::OfflineReq, 0), Payload::from(notice));
            match self.channel.oneway(request).await {
                Ok(ack) => {
                    if let Err(e) = ack.await {
                        debug!(error = %e, "offline notice not written");
                    }
                }
                Err(e) => debug!(error = %e, "offline notice not sent"),
            }
        }

        self.machine.close(graceful).await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("channel", &self.channel)
            .finish()
    }
}

/// Close the lifecycle when the connection drops without `Client::close`.
async fn watch_connection(machine: Arc<StateMachine<TcpConnector>>, channel: Channel) {
    channel.wait_closed().await;
    if machine.mark_closed() {
        warn!(remote = ?channel.remote_addr(), "connection to server lost");
    }
}

/// Send a heartbeat whenever no request went out for `interval`.
async fn heartbeat_loop(channel: Channel, interval: Duration) {
    loop {
        let idle_since = channel.last_request_time();
        let wake = idle_since.map(|t| t + interval).unwrap_or_else(|| Instant::now() + interval);
        tokio::time::sleep_until(wake).await;

        if channel.is_closed() {
            return;
        }
        if channel.last_request_time() != idle_since {
            continue;
        }

        let request = Message::request(Header::new(MsgType::HeartbeatReq, 0), None);
        if let Err(e) = channel.request(request, Some(interval)).await {
            warn!(error = %e, "heartbeat failed");
            if e.is_connection_closed() {
                return;
            }
        }
    }
}
