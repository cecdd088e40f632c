//! Channel transport over one physical connection.
//!
//! A [`Channel`] owns the connection's read loop, its writer task, its
//! correlation table and its session table. Outbound sends come in four
//! flavours sharing id generation and session stamping:
//!
//! - [`Channel::oneway`] - resolves on write acknowledgement, no reply expected
//! - [`Channel::request`] - waits for the correlated reply or the timeout
//! - [`Channel::request_async`] - returns a [`ReplyFuture`] immediately
//! - [`Channel::request_with_callback`] - runs a callback with the outcome
//!
//! Inbound responses resolve their pending call. Inbound requests go to the
//! [`HandlerRegistry`] on spawned tasks bounded by a semaphore, so slow
//! handlers never stall the read loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::TransportConfig;
use crate::correlation::{FutureManager, ReplyFuture};
use crate::error::{CodecError, Result, RpcError};
use crate::handler::{HandlerRegistry, RequestContext};
use crate::inflight::InFlightCounter;
use crate::protocol::{
    FrameCodec, Header, Message, RequestMessage, ResponseMessage, ResponsePayload, SessionManager,
};
use crate::writer::{spawn_writer_task, OutboundFrame, WriteAck, WriterHandle};

/// Read buffer size for the connection read loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A live connection.
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    codec: Arc<FrameCodec>,
    sessions: Arc<SessionManager>,
    futures: Arc<FutureManager>,
    writer: WriterHandle,
    handlers: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
    in_flight: InFlightCounter,
    config: TransportConfig,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    last_request: Mutex<Option<Instant>>,
    closing: AtomicBool,
    closed: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Start a channel over a connected TCP stream.
    pub fn from_tcp(
        stream: TcpStream,
        codec: FrameCodec,
        handlers: Arc<HandlerRegistry>,
        config: TransportConfig,
    ) -> Self {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::start(reader, writer, codec, handlers, config, local_addr, remote_addr)
    }

    /// Start a channel over any split byte stream.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        codec: FrameCodec,
        handlers: Arc<HandlerRegistry>,
        config: TransportConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(reader, writer, codec, handlers, config, None, None)
    }

    fn start<R, W>(
        reader: R,
        writer: W,
        codec: FrameCodec,
        handlers: Arc<HandlerRegistry>,
        config: TransportConfig,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let sessions = codec
            .sessions()
            .cloned()
            .unwrap_or_else(|| Arc::new(SessionManager::new()));
        let codec = Arc::new(codec.with_sessions(Arc::clone(&sessions)));

        let (writer, writer_task) = spawn_writer_task(writer, config.writer_config());
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "writer task ended with error"),
                Err(e) => error!(error = %e, "writer task panicked"),
            }
        });

        let (closed, _) = watch::channel(false);
        let inner = Arc::new(ChannelInner {
            codec,
            sessions,
            futures: FutureManager::new(),
            writer,
            handlers,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            in_flight: InFlightCounter::new(),
            config,
            local_addr,
            remote_addr,
            last_request: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed,
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&inner).run(reader));
        if let Ok(mut slot) = inner.reader_task.lock() {
            *slot = Some(task);
        }

        debug!(local = ?local_addr, remote = ?remote_addr, "channel opened");
        Self { inner }
    }

    /// Send a message without waiting for a reply.
    ///
    /// Requests get a fresh message id. The returned [`WriteAck`] resolves
    /// once the frame has been written to the socket.
    pub async fn oneway(&self, message: impl Into<Message>) -> Result<WriteAck> {
        let mut message = message.into();
        let guard = self.inner.in_flight.acquire();
        self.inner.touch();
        self.inner.prepare(&mut message);

        let (header, bytes) = self.inner.codec.encode_to_bytes(message)?;
        trace!(msg_id = header.msg_id, msg_type = header.msg_type, len = bytes.len(), "sending one-way");
        self.inner
            .writer
            .send_acked(OutboundFrame::new(bytes).with_guard(guard))
            .await
    }

    /// Send a request and wait for its reply.
    ///
    /// `timeout` overrides the header's timeout and the transport default.
    pub async fn request(
        &self,
        message: impl Into<Message>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.request_async(message, timeout).await?.await
    }

    /// Send a request and return the pending reply without waiting for it.
    pub async fn request_async(
        &self,
        message: impl Into<Message>,
        timeout: Option<Duration>,
    ) -> Result<ReplyFuture> {
        let mut message = message.into();
        if !message.is_request() {
            return Err(RpcError::Protocol(
                "only request messages can await a reply".to_string(),
            ));
        }

        self.inner.touch();
        self.inner.prepare(&mut message);

        let timeout = timeout.unwrap_or_else(|| {
            Duration::from_millis(
                message
                    .header()
                    .effective_timeout(self.inner.config.request_timeout_ms),
            )
        });
        let header = message.header_mut();
        if header.timeout <= 0 {
            header.timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        }
        let id = header.msg_id;
        let session = header.session().cloned();

        let (_, bytes) = self.inner.codec.encode_to_bytes(message)?;

        let guard = self.inner.in_flight.acquire();
        let reply = self.inner.futures.create(id, timeout, session, Some(guard))?;

        if let Err(e) = self.inner.writer.send(OutboundFrame::new(bytes)).await {
            self.inner.futures.complete_exceptionally(id, RpcError::ConnectionClosed);
            return Err(e);
        }

        trace!(msg_id = id, timeout_ms = timeout.as_millis() as u64, "request sent");
        Ok(reply)
    }

    /// Send a request and hand its outcome to `callback` when it resolves.
    ///
    /// Returns the message id assigned to the request.
    pub async fn request_with_callback<F>(
        &self,
        message: impl Into<Message>,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<u32>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let reply = self.request_async(message, timeout).await?;
        let id = reply.id();
        tokio::spawn(async move {
            callback(reply.await);
        });
        Ok(id)
    }

    /// Fail a pending request with [`RpcError::Cancelled`].
    pub fn cancel(&self, msg_id: u32) -> bool {
        self.inner.futures.cancel(msg_id)
    }

    /// Close the connection.
    ///
    /// A graceful close first waits, up to the configured drain timeout, for
    /// in-flight requests to finish. Pending calls that remain are failed
    /// with [`RpcError::ConnectionClosed`]. Closing twice is a no-op.
    pub async fn close(&self, graceful: bool) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            self.wait_closed().await;
            return;
        }

        if graceful {
            let drain = self.inner.config.drain_timeout();
            if !self.inner.in_flight.wait_idle(drain).await {
                warn!(
                    remaining = self.inner.in_flight.count(),
                    drain_ms = drain.as_millis() as u64,
                    "drain timed out, closing with requests in flight"
                );
            }
        }

        self.inner.shutdown();

        let task = self.inner.reader_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
        }
        debug!(remote = ?self.inner.remote_addr, graceful, "channel closed");
    }

    /// Wait until the connection has closed, from either side.
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Requests and handlers that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count()
    }

    /// Calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.futures.len()
    }

    /// When the last request was sent on this channel.
    pub fn last_request_time(&self) -> Option<Instant> {
        self.inner.last_request.lock().ok().and_then(|t| *t)
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn codec(&self) -> &Arc<FrameCodec> {
        &self.inner.codec
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Whether the writer is currently applying backpressure.
    pub fn is_backpressure_active(&self) -> bool {
        self.inner.writer.is_backpressure_active()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("pending_calls", &self.inner.futures.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelInner {
    fn touch(&self) {
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(Instant::now());
        }
    }

    /// Assign an id to requests and stamp session defaults.
    fn prepare(&self, message: &mut Message) {
        let is_request = message.is_request();
        let header = message.header_mut();
        if is_request {
            header.msg_id = self.futures.next_id();
        }
        self.stamp(header);
    }

    fn stamp(&self, header: &mut Header) {
        header.bind_session(&self.sessions);
        if header.serialization != 0 {
            return;
        }
        let (serialization, compression) = match header.session() {
            Some(session) => (session.serialization(), session.compression()),
            None => (self.config.serialization, self.config.compression),
        };
        header.serialization = serialization;
        if header.compression == 0 {
            header.compression = compression;
        }
    }

    fn shutdown(&self) {
        self.writer.shutdown();
        self.futures.close();
        self.closed.send_replace(true);
    }

    async fn run<R: AsyncRead + Unpin>(self: Arc<Self>, reader: R) {
        match self.read_loop(reader).await {
            Ok(()) => debug!(remote = ?self.remote_addr, "peer closed connection"),
            Err(e) => warn!(remote = ?self.remote_addr, error = %e, "connection failed"),
        }
        self.closing.store(true, Ordering::Release);
        self.shutdown();
    }

    /// Main read loop - reads frames and dispatches them.
    async fn read_loop<R: AsyncRead + Unpin>(self: &Arc<Self>, mut reader: R) -> Result<()> {
        let mut frame_buffer = self.codec.frame_buffer();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(RpcError::Io(e)),
            };

            // A framing error desynchronizes the stream; give up on it.
            let frames = frame_buffer.push(&buf[..n])?;

            for frame in frames {
                self.dispatch_frame(frame).await;
            }
        }
    }

    async fn dispatch_frame(self: &Arc<Self>, frame: Bytes) {
        match self.codec.decode(frame) {
            Ok(None) => {}
            Ok(Some(Message::Response(response))) => {
                let id = response.header.msg_id;
                if !self.futures.complete(id, Message::Response(response)) {
                    debug!(msg_id = id, "dropping response with no pending call");
                }
            }
            Ok(Some(Message::Request(mut request))) => {
                request.received_at = Some(std::time::Instant::now());
                request.timeout = Some(Duration::from_millis(
                    request
                        .header
                        .effective_timeout(self.config.request_timeout_ms),
                ));
                request.local_addr = self.local_addr;
                request.remote_addr = self.remote_addr;
                self.handle_request(request).await;
            }
            Err(e) => self.handle_decode_error(e).await,
        }
    }

    async fn handle_request(self: &Arc<Self>, request: RequestMessage) {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                warn!(
                    msg_id = request.header.msg_id,
                    msg_type = request.header.msg_type,
                    "handler capacity reached, rejecting request"
                );
                self.reply_error(&request.header, "server busy").await;
                return;
            }
        };

        let guard = self.in_flight.acquire();
        let ctx = RequestContext::attach(
            &request,
            Arc::clone(&self.codec),
            Arc::clone(&self.sessions),
            Some(self.writer.clone()),
        );
        let handlers = Arc::clone(&self.handlers);

        tokio::spawn(async move {
            // Permit and guard are held until this task completes
            let _permit = permit;
            let _guard = guard;

            let msg_id = request.header.msg_id;
            let msg_type = request.header.msg_type;
            if let Err(e) = handlers.dispatch(request, ctx.clone()).await {
                match &e {
                    RpcError::HandlerNotFound(_) => {
                        warn!(msg_id, msg_type, "no handler registered")
                    }
                    _ => error!(msg_id, msg_type, error = %e, "handler failed"),
                }
                if let Err(send_err) = ctx.error(&e.to_string()).await {
                    debug!(msg_id, error = %send_err, "failed to send error response");
                }
            }
        });
    }

    async fn handle_decode_error(&self, e: CodecError) {
        let header = match e.header() {
            Some(h) if h.message_type().is_some() => h.clone(),
            _ => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        if header.is_request() {
            warn!(msg_id = header.msg_id, error = %e, "failed to decode request");
            self.reply_error(&header, e.message()).await;
        } else {
            warn!(msg_id = header.msg_id, error = %e, "failed to decode response");
            self.futures
                .complete_exceptionally(header.msg_id, RpcError::Codec(e));
        }
    }

    /// Answer `request` with an error outcome built from its best-known header.
    async fn reply_error(&self, request: &Header, message: &str) {
        let msg_type = match request.message_type() {
            Some(t) => t.response_type(),
            None => return,
        };
        let mut header = request.response(msg_type, 0, None);
        if self.codec.plugins().serialization(header.serialization).is_none() {
            header.serialization = self.config.serialization;
        }

        let response = ResponseMessage::new(header, Some(ResponsePayload::error(message).into()));
        let result = match self.codec.encode_to_bytes(Message::Response(response)) {
            Ok((_, bytes)) => self.writer.send(OutboundFrame::new(bytes)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!(msg_id = request.msg_id, error = %e, "failed to send error response");
        }
    }
}
