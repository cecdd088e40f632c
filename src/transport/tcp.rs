//! TCP controllers for the lifecycle state machine.
//!
//! [`TcpConnector`] dials a server and yields a [`Channel`]. [`TcpBinder`]
//! binds a listener and yields a [`ServerHandle`] that accepts connections
//! until it is closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::Channel;
use super::lifecycle::Controller;
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use crate::handler::{BoxFuture, HandlerRegistry};
use crate::protocol::FrameCodec;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Opens client connections.
#[derive(Clone)]
pub struct TcpConnector {
    addr: String,
    codec: FrameCodec,
    handlers: Arc<HandlerRegistry>,
    config: TransportConfig,
}

impl TcpConnector {
    pub fn new(
        addr: impl Into<String>,
        codec: FrameCodec,
        handlers: Arc<HandlerRegistry>,
        config: TransportConfig,
    ) -> Self {
        Self {
            addr: addr.into(),
            codec,
            handlers,
            config,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Controller for TcpConnector {
    type Connection = Channel;

    fn open(&self) -> BoxFuture<'static, Result<Channel>> {
        let this = self.clone();
        Box::pin(async move {
            let connect = TcpStream::connect(this.addr.as_str());
            let stream = match tokio::time::timeout(this.config.connect_timeout(), connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(RpcError::Connect(format!("{}: {}", this.addr, e))),
                Err(_) => {
                    return Err(RpcError::Connect(format!(
                        "{}: timed out after {}ms",
                        this.addr, this.config.connect_timeout_ms
                    )))
                }
            };
            debug!(addr = %this.addr, "connected");
            Ok(Channel::from_tcp(stream, this.codec, this.handlers, this.config))
        })
    }

    fn close(&self, channel: Channel, graceful: bool) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            channel.close(graceful).await;
            Ok(())
        })
    }
}

/// Binds server listeners.
#[derive(Clone)]
pub struct TcpBinder {
    addr: String,
    codec: FrameCodec,
    handlers: Arc<HandlerRegistry>,
    config: TransportConfig,
}

impl TcpBinder {
    pub fn new(
        addr: impl Into<String>,
        codec: FrameCodec,
        handlers: Arc<HandlerRegistry>,
        config: TransportConfig,
    ) -> Self {
        Self {
            addr: addr.into(),
            codec,
            handlers,
            config,
        }
    }
}

impl Controller for TcpBinder {
    type Connection = ServerHandle;

    fn open(&self) -> BoxFuture<'static, Result<ServerHandle>> {
        let this = self.clone();
        Box::pin(async move {
            let listener = TcpListener::bind(this.addr.as_str())
                .await
                .map_err(|e| RpcError::Connect(format!("bind {}: {}", this.addr, e)))?;
            let local_addr = listener.local_addr()?;
            info!(addr = %local_addr, "listening");

            let channels = Arc::new(DashMap::new());
            let accept_task = tokio::spawn(accept_loop(listener, this, Arc::clone(&channels)));

            Ok(ServerHandle {
                local_addr,
                channels,
                accept_task: Arc::new(Mutex::new(Some(accept_task))),
            })
        })
    }

    fn close(&self, handle: ServerHandle, graceful: bool) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let accept_task = handle.accept_task.lock().ok().and_then(|mut t| t.take());
            if let Some(task) = accept_task {
                task.abort();
                // Wait for the listener to drop so the port stops accepting.
                let _ = task.await;
            }

            let channels: Vec<Channel> = handle.channels.iter().map(|c| c.value().clone()).collect();
            let closing: Vec<_> = channels
                .into_iter()
                .map(|channel| tokio::spawn(async move { channel.close(graceful).await }))
                .collect();
            for task in closing {
                if let Err(e) = task.await {
                    warn!(error = %e, "channel close task failed");
                }
            }

            info!(addr = %handle.local_addr, "listener closed");
            Ok(())
        })
    }
}

/// A bound listener and its accepted connections.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    channels: Arc<DashMap<u64, Channel>>,
    accept_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the open connections.
    pub fn channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|c| c.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.channels.len())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, binder: TcpBinder, channels: Arc<DashMap<u64, Channel>>) {
    let next_id = AtomicU64::new(0);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let channel = Channel::from_tcp(
            stream,
            binder.codec.clone(),
            Arc::clone(&binder.handlers),
            binder.config.clone(),
        );
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        channels.insert(id, channel.clone());
        debug!(peer = %peer, id, "accepted connection");

        let channels = Arc::clone(&channels);
        tokio::spawn(async move {
            channel.wait_closed().await;
            channels.remove(&id);
            debug!(peer = %peer, id, "connection closed");
        });
    }
}
