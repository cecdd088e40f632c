//! Per-connection writer task.
//!
//! Every frame leaving a connection passes through one task that owns the
//! write half. Callers and handler tasks queue encoded frames on an mpsc
//! channel; the task drains whatever is ready, writes it with one vectored
//! write and then settles each frame's acknowledgement and in-flight guard.
//!
//! ```text
//! request()  ─┐
//! oneway()   ─┼─► mpsc<OutboundFrame> ─► writer task ─► socket
//! handlers   ─┘
//! ```
//!
//! Frames hit the socket in queue order. The queue is bounded by a pending
//! count; senders wait up to the backpressure timeout for room.

use std::future::Future;
use std::io::IoSlice;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::inflight::InFlightGuard;

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// How often a blocked sender re-checks the pending count.
const CAPACITY_POLL: Duration = Duration::from_micros(100);

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Complete encoded frame, magic included.
    pub bytes: Bytes,
    /// Notified once the frame is written (or the write fails).
    ack: Option<oneshot::Sender<Result<()>>>,
    /// In-flight slot released once the frame leaves the writer.
    guard: Option<InFlightGuard>,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            ack: None,
            guard: None,
        }
    }

    /// Keep `guard` alive until the frame has been written.
    pub fn with_guard(mut self, guard: InFlightGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Request a write acknowledgement.
    pub fn with_ack(mut self) -> (Self, WriteAck) {
        let (tx, rx) = oneshot::channel();
        self.ack = Some(tx);
        (self, WriteAck { rx })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn complete(self, result: Result<()>) {
        let OutboundFrame { ack, guard, .. } = self;
        drop(guard);
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
    }
}

/// Resolves when a frame has been written to the socket.
#[derive(Debug)]
pub struct WriteAck {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for WriteAck {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Writer went away with the frame still queued.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Queueing side of a connection's writer task. Clones share the queue.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued but not yet written.
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
    /// Asks the writer to flush what is queued and stop.
    shutdown: Arc<Notify>,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
            shutdown,
        }
    }

    /// Queue `frame`, waiting for room while the writer is saturated.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.wait_for_capacity().await?;

        // Counted before the send so the writer never decrements first.
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            RpcError::ConnectionClosed
        })
    }

    /// Queue `frame` and return a future that resolves once it is written.
    pub async fn send_acked(&self, frame: OutboundFrame) -> Result<WriteAck> {
        let (frame, ack) = frame.with_ack();
        self.send(frame).await?;
        Ok(ack)
    }

    async fn wait_for_capacity(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        while self.is_backpressure_active() {
            if tokio::time::Instant::now() >= deadline {
                warn!(pending = self.pending_count(), "backpressure timeout");
                return Err(RpcError::BackpressureTimeout);
            }
            tokio::time::sleep(CAPACITY_POLL).await;
        }
        Ok(())
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop accepting frames, write what is already queued, then shut the
    /// socket's write side down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Whether the writer task has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The JoinHandle completes when the writer stops: after
/// [`WriterHandle::shutdown`], when every handle is dropped, or on a write
/// error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let shutdown = Arc::new(Notify::new());

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
        shutdown.clone(),
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending, shutdown));

    (handle, task)
}

/// [`spawn_writer_task`] with [`WriterConfig::default`].
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

/// Drain the queue in batches until shutdown, handle drop or a write error.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.notified() => {
                rx.close();
                while let Some(frame) = rx.recv().await {
                    flush_batch(&mut writer, vec![frame], &pending).await?;
                }
                let _ = writer.shutdown().await;
                debug!("writer stopped");
                return Ok(());
            }
            frame = rx.recv() => match frame {
                Some(f) => f,
                // All handles dropped, clean shutdown
                None => return Ok(()),
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        flush_batch(&mut writer, batch, &pending).await?;
    }
}

/// Write one batch and settle its acknowledgements.
async fn flush_batch<W>(
    writer: &mut W,
    batch: Vec<OutboundFrame>,
    pending: &AtomicUsize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = write_batch(writer, &batch).await;
    pending.fetch_sub(batch.len(), Ordering::Release);

    match result {
        Ok(()) => {
            for frame in batch {
                frame.complete(Ok(()));
            }
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, frames = batch.len(), "frame write failed");
            for frame in batch {
                frame.complete(Err(copy_error(&e)));
            }
            Err(e)
        }
    }
}

fn copy_error(e: &RpcError) -> RpcError {
    match e {
        RpcError::Io(io) => RpcError::Io(std::io::Error::new(io.kind(), io.to_string())),
        _ => RpcError::ConnectionClosed,
    }
}

/// Write every byte of `batch`, resuming after partial vectored writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = remaining_slices(batch, written);
        match writer.write_vectored(&slices).await? {
            0 => {
                return Err(RpcError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "socket accepted no bytes",
                )))
            }
            n => written += n,
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering `batch` after its first `skip` bytes.
fn remaining_slices(batch: &[OutboundFrame], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.size();
        if skip < end {
            slices.push(IoSlice::new(&frame.bytes[skip.saturating_sub(offset)..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflight::InFlightCounter;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(len: usize) -> OutboundFrame {
        OutboundFrame::new(Bytes::from(vec![0xAB; len]))
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle.send(frame(30)).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 30);
    }

    #[tokio::test]
    async fn test_ack_after_write() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        let ack = handle.send_acked(frame(10)).await.unwrap();
        ack.await.unwrap();

        let mut buf = vec![0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_guard_released_after_write() {
        let (client, _server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);
        let counter = InFlightCounter::new();

        let ack = handle
            .send_acked(frame(8).with_guard(counter.acquire()))
            .await
            .unwrap();
        ack.await.unwrap();
        assert!(counter.is_idle());
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        let mut last = None;
        for i in 0..10u32 {
            let f = OutboundFrame::new(Bytes::copy_from_slice(&i.to_be_bytes()));
            last = Some(handle.send_acked(f).await.unwrap());
        }
        if let Some(ack) = last {
            ack.await.unwrap();
        }

        let mut buf = vec![0u8; 40];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[36..], &9u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_send_backpressure_timeout() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(10);
        let pending = Arc::new(AtomicUsize::new(1));
        let handle = WriterHandle::new(
            tx,
            pending,
            1,
            Duration::from_millis(5),
            Arc::new(Notify::new()),
        );

        let result = handle.send(frame(1)).await;
        assert!(matches!(result, Err(RpcError::BackpressureTimeout)));
    }

    #[test]
    fn test_remaining_slices_after_partial_write() {
        let batch = vec![frame(5), frame(7)];

        assert_eq!(remaining_slices(&batch, 0).len(), 2);

        let slices = remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices[1].len(), 7);

        let slices = remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 7);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame(3)).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 15);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        handle.send(frame(6)).await.unwrap();
        handle.shutdown();
        task.await.unwrap().unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 6);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(frame(1)).await,
            Err(RpcError::ConnectionClosed)
        ));
    }
}
