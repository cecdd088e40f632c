//! Correlation table: outstanding requests keyed by message id.
//!
//! Each connection owns one [`FutureManager`]. The write path registers a
//! pending call, the read loop resolves it when the matching response
//! decodes, and a per-call timer fails it on expiry. Whichever resolution
//! removes the entry from the map first wins; every later attempt finds
//! nothing and is a no-op.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, RpcError};
use crate::inflight::InFlightGuard;
use crate::protocol::{Message, Session};

/// One outstanding request.
struct PendingCall {
    tx: oneshot::Sender<Result<Message>>,
    deadline: Instant,
    timeout: Duration,
    session: Option<Arc<Session>>,
    /// Held until the call resolves so graceful drain can wait on it.
    _guard: Option<InFlightGuard>,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    fn finish(mut self, result: Result<Message>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.tx.send(result);
    }
}

/// Per-connection registry from message id to pending result slot.
pub struct FutureManager {
    next_id: AtomicU32,
    pending: DashMap<u32, PendingCall>,
    closed: AtomicBool,
}

impl FutureManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Generate the next connection-scoped message id. Never returns 0.
    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a pending call for `id` and start its timeout.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`RpcError::DuplicateId`] if `id` is already pending
    /// - [`RpcError::ConnectionClosed`] if the table has been closed
    pub fn create(
        self: &Arc<Self>,
        id: u32,
        timeout: Duration,
        session: Option<Arc<Session>>,
        guard: Option<InFlightGuard>,
    ) -> Result<ReplyFuture> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let timer = tokio::spawn(expire_after(Arc::downgrade(self), id, timeout));
                slot.insert(PendingCall {
                    tx,
                    deadline: Instant::now() + timeout,
                    timeout,
                    session,
                    _guard: guard,
                    timer: Some(timer),
                });
            }
        }

        // A close that swept the table before our insert would miss this call.
        if self.is_closed() {
            self.complete_exceptionally(id, RpcError::ConnectionClosed);
        }

        trace!(msg_id = id, timeout_ms = timeout.as_millis() as u64, "pending call registered");
        Ok(ReplyFuture { id, rx })
    }

    /// Resolve `id` with a response. Returns `false` if nothing was pending.
    pub fn complete(&self, id: u32, response: Message) -> bool {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                call.finish(Ok(response));
                true
            }
            None => {
                debug!(msg_id = id, "response without pending call dropped");
                false
            }
        }
    }

    /// Fail `id` with `error`. Returns `false` if nothing was pending.
    pub fn complete_exceptionally(&self, id: u32, error: RpcError) -> bool {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                call.finish(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail `id` with [`RpcError::Cancelled`].
    pub fn cancel(&self, id: u32) -> bool {
        self.complete_exceptionally(id, RpcError::Cancelled(id))
    }

    fn expire(&self, id: u32) {
        let now = Instant::now();
        if let Some((_, mut call)) = self.pending.remove_if(&id, |_, call| call.deadline <= now) {
            // Running inside the timer task; let it finish on its own.
            call.timer = None;
            let timeout_ms = call.timeout.as_millis() as u64;
            debug!(msg_id = id, timeout_ms, "pending call timed out");
            call.finish(Err(RpcError::Timeout {
                msg_id: id,
                timeout_ms,
            }));
        }
    }

    /// Fail every pending call with [`RpcError::ConnectionClosed`] and
    /// refuse new registrations.
    ///
    /// Returns how many calls were failed.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        let swept = ids
            .into_iter()
            .filter(|id| self.complete_exceptionally(*id, RpcError::ConnectionClosed))
            .count();
        if swept > 0 {
            debug!(swept, "pending calls failed on close");
        }
        swept
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of calls still waiting.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    /// Session the pending call for `id` was sent on.
    pub fn session(&self, id: u32) -> Option<Arc<Session>> {
        self.pending.get(&id).and_then(|call| call.session.clone())
    }
}

async fn expire_after(manager: Weak<FutureManager>, id: u32, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(manager) = manager.upgrade() {
        manager.expire(id);
    }
}

/// Awaitable result of a pending call.
///
/// Resolves with the response message, or with the error that failed the
/// call (timeout, cancellation, connection loss).
#[derive(Debug)]
pub struct ReplyFuture {
    id: u32,
    rx: oneshot::Receiver<Result<Message>>,
}

impl ReplyFuture {
    /// Message id this future waits on.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Future for ReplyFuture {
    type Output = Result<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Slot dropped without resolution: the table went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflight::InFlightCounter;
    use crate::protocol::{Header, MsgType};

    fn response(id: u32) -> Message {
        Message::response(Header::new(MsgType::BizResp, id), None)
    }

    #[test]
    fn test_ids_skip_zero() {
        let mgr = FutureManager::new();
        assert_eq!(mgr.next_id(), 1);
        assert_eq!(mgr.next_id(), 2);

        mgr.next_id.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(mgr.next_id(), u32::MAX);
        assert_eq!(mgr.next_id(), 1);
    }

    #[tokio::test]
    async fn test_create_and_complete() {
        let mgr = FutureManager::new();
        let fut = mgr.create(7, Duration::from_secs(5), None, None).unwrap();
        assert_eq!(fut.id(), 7);
        assert!(mgr.contains(7));

        assert!(mgr.complete(7, response(7)));
        let msg = fut.await.unwrap();
        assert_eq!(msg.msg_id(), 7);
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let mgr = FutureManager::new();
        let _fut = mgr.create(1, Duration::from_secs(5), None, None).unwrap();
        let err = mgr.create(1, Duration::from_secs(5), None, None).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateId(1)));
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_late_resolution_is_noop() {
        let mgr = FutureManager::new();
        assert!(!mgr.complete(99, response(99)));
        assert!(!mgr.complete_exceptionally(99, RpcError::ConnectionClosed));

        let fut = mgr.create(3, Duration::from_secs(5), None, None).unwrap();
        assert!(mgr.complete(3, response(3)));
        assert!(!mgr.complete(3, response(3)));
        assert!(!mgr.cancel(3));
        assert!(fut.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_call() {
        let mgr = FutureManager::new();
        let fut = mgr.create(5, Duration::from_millis(50), None, None).unwrap();

        let err = fut.await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Timeout {
                msg_id: 5,
                timeout_ms: 50
            }
        ));
        assert!(mgr.is_empty());
        assert!(!mgr.complete(5, response(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_affect_other_calls() {
        let mgr = FutureManager::new();
        let short = mgr.create(1, Duration::from_millis(10), None, None).unwrap();
        let long = mgr.create(2, Duration::from_secs(60), None, None).unwrap();

        assert!(short.await.unwrap_err().is_timeout());
        assert!(mgr.contains(2));
        assert!(mgr.complete(2, response(2)));
        assert!(long.await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_resolutions_single_winner() {
        for round in 0..200u32 {
            let mgr = FutureManager::new();
            let fut = mgr.create(round, Duration::from_secs(5), None, None).unwrap();

            let a = {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.complete(round, response(round)) })
            };
            let b = {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move {
                    mgr.complete_exceptionally(round, RpcError::Cancelled(round))
                })
            };

            let (won_a, won_b) = (a.await.unwrap(), b.await.unwrap());
            assert!(won_a ^ won_b, "exactly one resolution must win");

            match fut.await {
                Ok(_) => assert!(won_a),
                Err(RpcError::Cancelled(_)) => assert!(won_b),
                Err(other) => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_close_sweeps_all_pending() {
        let mgr = FutureManager::new();
        let futures: Vec<_> = (1..=10)
            .map(|id| mgr.create(id, Duration::from_secs(60), None, None).unwrap())
            .collect();

        assert_eq!(mgr.close(), 10);
        assert!(mgr.is_empty());

        for fut in futures {
            let err = tokio::time::timeout(Duration::from_secs(1), fut)
                .await
                .expect("swept call resolves promptly")
                .unwrap_err();
            assert!(err.is_connection_closed());
        }

        let err = mgr.create(11, Duration::from_secs(1), None, None).unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_guard_released_on_resolution() {
        let mgr = FutureManager::new();
        let counter = InFlightCounter::new();

        let fut = mgr
            .create(1, Duration::from_secs(5), None, Some(counter.acquire()))
            .unwrap();
        assert_eq!(counter.count(), 1);

        mgr.cancel(1);
        assert!(counter.is_idle());
        assert!(matches!(fut.await, Err(RpcError::Cancelled(1))));
    }

    #[tokio::test]
    async fn test_session_lookup() {
        let mgr = FutureManager::new();
        let session = Arc::new(Session::new(4, 3, 0));
        let _fut = mgr
            .create(1, Duration::from_secs(5), Some(session), None)
            .unwrap();
        assert_eq!(mgr.session(1).map(|s| s.id()), Some(4));
        assert!(mgr.session(2).is_none());
    }

    #[tokio::test]
    async fn test_dropped_table_reports_closed() {
        let mgr = FutureManager::new();
        let fut = mgr.create(1, Duration::from_secs(5), None, None).unwrap();
        drop(mgr);
        // Timer still holds only a weak handle; the slot is gone with the map.
        assert!(fut.await.unwrap_err().is_connection_closed());
    }
}
