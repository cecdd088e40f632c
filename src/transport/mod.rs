//! Transport module - connections and their lifecycle.
//!
//! Provides:
//! - [`Channel`] - one framed connection with correlated request/response
//! - [`StateMachine`] - explicit open/close lifecycle over a [`Controller`]
//! - [`SharedEndpoint`] - reference-counted variant for shared servers
//! - TCP controllers for clients and servers

mod channel;
mod lifecycle;
mod shared;
mod tcp;

pub use channel::Channel;
pub use lifecycle::{CloseHook, ConnState, Controller, StateMachine};
pub use shared::SharedEndpoint;
pub use tcp::{ServerHandle, TcpBinder, TcpConnector};
