//! In-flight request tracking for graceful drain.
//!
//! Every send acquires an [`InFlightGuard`] from the connection's
//! [`InFlightCounter`]. The guard travels with the request (into the writer
//! for one-way sends, into the pending call for request/response) and
//! releases the slot on drop, whichever way the request ends.
//!
//! A graceful close waits on [`InFlightCounter::wait_idle`] before tearing
//! the connection down.

use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Shared counter of requests that have not finished yet.
///
/// Cloning shares the count.
#[derive(Debug, Clone, Default)]
pub struct InFlightCounter {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl InFlightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a slot; it is released when the guard drops.
    pub fn acquire(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            counter: self.clone(),
        }
    }

    /// Get current in-flight count.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until nothing is in flight, up to `timeout`.
    ///
    /// Returns `true` if the counter reached zero in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();

            if self.is_idle() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle();
            }
        }
    }
}

/// Slot in an [`InFlightCounter`]; releases on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: InFlightCounter,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.release();
    }
}
