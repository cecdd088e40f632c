//! Connection lifecycle state machine.
//!
//! ```text
//! Closed --open--> Opening --ok--> Opened --close--> Closing --> Closed
//!                     |  \--err--> Closed                ^
//!                     \-----------close------------------/
//! ```
//!
//! The physical work is delegated to a [`Controller`]. Concurrent callers of
//! [`StateMachine::open`] share the outcome of the one open in progress, and
//! an open that arrives during a close waits for it and then reopens.
//! Open failures leave the machine in `Closed`, so opening can be retried.
//! Failures on the close path are logged and never returned.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::handler::BoxFuture;

/// Lifecycle state of a connection or server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    Closed,
    Opening,
    Opened,
    Closing,
}

/// Every legal `(from, to)` pair.
const TRANSITIONS: &[(ConnState, ConnState)] = &[
    (ConnState::Closed, ConnState::Opening),
    (ConnState::Opening, ConnState::Opened),
    (ConnState::Opening, ConnState::Closed),
    (ConnState::Opening, ConnState::Closing),
    (ConnState::Opened, ConnState::Closing),
    (ConnState::Closing, ConnState::Closed),
];

impl ConnState {
    pub fn can_transition_to(self, next: ConnState) -> bool {
        TRANSITIONS.contains(&(self, next))
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnState::Closed => "closed",
            ConnState::Opening => "opening",
            ConnState::Opened => "opened",
            ConnState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Performs the physical open and close.
pub trait Controller: Send + Sync + 'static {
    /// Live handle produced by a successful open.
    type Connection: Clone + Send + Sync + 'static;

    fn open(&self) -> BoxFuture<'static, Result<Self::Connection>>;

    fn close(&self, connection: Self::Connection, graceful: bool) -> BoxFuture<'static, Result<()>>;
}

/// Hook run around a close.
pub type CloseHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

type OpenWaiter<T> = oneshot::Sender<std::result::Result<T, String>>;

struct Slot<T> {
    state: ConnState,
    connection: Option<T>,
    waiters: Vec<OpenWaiter<T>>,
    /// Opens parked until the current close finishes.
    close_waiters: Vec<oneshot::Sender<()>>,
}

/// What a blocked `open` is waiting for.
enum Pending<T> {
    Open(oneshot::Receiver<std::result::Result<T, String>>),
    Close(oneshot::Receiver<()>),
}

impl<T> Slot<T> {
    /// Enter `Closed` and release opens parked behind the close.
    fn settle_closed(&mut self) {
        self.state = ConnState::Closed;
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn advance(&mut self, next: ConnState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RpcError::State(format!(
                "illegal transition {} -> {}",
                self.state, next
            )));
        }
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }
}

/// Enum state plus transition table, driving a [`Controller`].
pub struct StateMachine<C: Controller> {
    controller: C,
    slot: Mutex<Slot<C::Connection>>,
    before_close: Option<CloseHook>,
    after_close: Option<CloseHook>,
}

impl<C: Controller> StateMachine<C> {
    pub fn new(controller: C) -> Self {
        Self {
            controller,
            slot: Mutex::new(Slot {
                state: ConnState::Closed,
                connection: None,
                waiters: Vec::new(),
                close_waiters: Vec::new(),
            }),
            before_close: None,
            after_close: None,
        }
    }

    /// Run `hook` before the physical close (e.g. deregister from discovery).
    pub fn with_before_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.before_close = Some(Arc::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(hook())
        }));
        self
    }

    /// Run `hook` after the physical close.
    pub fn with_after_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.after_close = Some(Arc::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(hook())
        }));
        self
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Opened
    }

    /// The live connection, if opened.
    pub fn connection(&self) -> Option<C::Connection> {
        self.lock().connection.clone()
    }

    /// Open, or join the open already in progress.
    ///
    /// Returns the existing connection when already opened. While a close is
    /// running, waits for it to finish and then opens again.
    pub async fn open(&self) -> Result<C::Connection> {
        loop {
            let pending = {
                let mut slot = self.lock();
                match slot.state {
                    ConnState::Opened => {
                        return slot
                            .connection
                            .clone()
                            .ok_or_else(|| RpcError::State("opened without a connection".into()));
                    }
                    ConnState::Opening => {
                        let (tx, rx) = oneshot::channel();
                        slot.waiters.push(tx);
                        Pending::Open(rx)
                    }
                    ConnState::Closing => {
                        let (tx, rx) = oneshot::channel();
                        slot.close_waiters.push(tx);
                        Pending::Close(rx)
                    }
                    ConnState::Closed => {
                        slot.advance(ConnState::Opening)?;
                        break;
                    }
                }
            };

            match pending {
                Pending::Open(rx) => {
                    return match rx.await {
                        Ok(Ok(conn)) => Ok(conn),
                        Ok(Err(msg)) => Err(RpcError::Connect(msg)),
                        Err(_) => Err(RpcError::ConnectionClosed),
                    };
                }
                Pending::Close(rx) => {
                    let _ = rx.await;
                    debug!("close finished, reopening");
                }
            }
        }

        let result = self.controller.open().await;
        self.finish_open(result).await
    }

    async fn finish_open(&self, result: Result<C::Connection>) -> Result<C::Connection> {
        let (outcome, abandoned) = {
            let mut slot = self.lock();
            let waiters = std::mem::take(&mut slot.waiters);

            let (outcome, abandoned) = match result {
                Ok(conn) if slot.state == ConnState::Opening => {
                    slot.advance(ConnState::Opened)?;
                    slot.connection = Some(conn.clone());
                    (Ok(conn), None)
                }
                Ok(conn) => {
                    // close() was called while we were opening
                    slot.settle_closed();
                    (Err(RpcError::ConnectionClosed), Some(conn))
                }
                Err(e) => {
                    slot.settle_closed();
                    (Err(e), None)
                }
            };

            for waiter in waiters {
                let shared = match &outcome {
                    Ok(conn) => Ok(conn.clone()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = waiter.send(shared);
            }
            (outcome, abandoned)
        };

        if let Some(conn) = abandoned {
            if let Err(e) = self.controller.close(conn, false).await {
                warn!(error = %e, "failed to close connection abandoned during open");
            }
        }
        if let Err(e) = &outcome {
            warn!(error = %e, "open failed");
        }
        outcome
    }

    /// Close the connection.
    ///
    /// Runs the before-close hook, the physical close and the after-close
    /// hook in that order. Errors from any of them are logged. Closing a
    /// machine that is not open is a no-op; closing while opening makes the
    /// pending open discard its connection.
    pub async fn close(&self, graceful: bool) {
        let connection = {
            let mut slot = self.lock();
            match slot.state {
                ConnState::Closed | ConnState::Closing => return,
                ConnState::Opening => {
                    slot.state = ConnState::Closing;
                    return;
                }
                ConnState::Opened => {
                    slot.state = ConnState::Closing;
                    slot.connection.take()
                }
            }
        };

        if let Some(hook) = &self.before_close {
            if let Err(e) = hook().await {
                warn!(error = %e, "before-close hook failed");
            }
        }

        if let Some(conn) = connection {
            if let Err(e) = self.controller.close(conn, graceful).await {
                warn!(error = %e, "close failed");
            }
        }

        {
            let mut slot = self.lock();
            if !slot.state.can_transition_to(ConnState::Closed) {
                warn!(state = %slot.state, "unexpected state after close");
            }
            slot.settle_closed();
        }

        if let Some(hook) = &self.after_close {
            if let Err(e) = hook().await {
                warn!(error = %e, "after-close hook failed");
            }
        }
    }

    /// Record that the live connection went away on its own.
    ///
    /// Moves an opened machine through `Closing` to `Closed` without calling
    /// the controller or the close hooks, so the next [`open`](Self::open)
    /// dials again. Returns `false` if the machine was not opened.
    pub fn mark_closed(&self) -> bool {
        let mut slot = self.lock();
        if slot.state != ConnState::Opened {
            return false;
        }
        slot.connection = None;
        if let Err(e) = slot.advance(ConnState::Closing) {
            warn!(error = %e, "unexpected state on connection loss");
        }
        if !slot.state.can_transition_to(ConnState::Closed) {
            warn!(state = %slot.state, "unexpected state on connection loss");
        }
        slot.settle_closed();
        debug!("connection lost, lifecycle closed");
        true
    }

    fn lock(&self) -> MutexGuard<'_, Slot<C::Connection>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Controller> fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state())
            .finish()
    }
}
