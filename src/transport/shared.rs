//! Reference-counted endpoint shared by several logical consumers.
//!
//! Every [`SharedEndpoint::open`] takes a reference, even when the underlying
//! open fails, so every open must be paired with a [`SharedEndpoint::close`].
//! Only the close that drops the count to zero closes the endpoint, and the
//! pre-close callback runs exactly once for each such drop. An open racing
//! that close waits for it and reopens the endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use super::lifecycle::{ConnState, Controller, StateMachine};
use crate::error::Result;

type PreClose = Box<dyn Fn() + Send + Sync>;

pub struct SharedEndpoint<C: Controller> {
    machine: StateMachine<C>,
    refs: AtomicUsize,
    pre_close: Option<PreClose>,
}

impl<C: Controller> SharedEndpoint<C> {
    pub fn new(machine: StateMachine<C>) -> Self {
        Self {
            machine,
            refs: AtomicUsize::new(0),
            pre_close: None,
        }
    }

    /// Run `callback` whenever the last reference is closed.
    pub fn with_pre_close<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.pre_close = Some(Box::new(callback));
        self
    }

    /// Take a reference and open the endpoint if needed.
    pub async fn open(&self) -> Result<C::Connection> {
        let refs = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(refs, "shared endpoint acquired");
        self.machine.open().await
    }

    /// Drop a reference; the last one closes the endpoint.
    pub async fn close(&self, graceful: bool) {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Err(_) => warn!("close on a shared endpoint with no references"),
            Ok(1) => {
                if let Some(callback) = &self.pre_close {
                    callback();
                }
                self.machine.close(graceful).await;
            }
            Ok(n) => debug!(refs = n - 1, "shared endpoint released"),
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnState {
        self.machine.state()
    }

    pub fn connection(&self) -> Option<C::Connection> {
        self.machine.connection()
    }

    pub fn machine(&self) -> &StateMachine<C> {
        &self.machine
    }
}
