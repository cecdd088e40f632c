//! Handler module - inbound request handling and dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps request message types to handlers
//! - [`RequestContext`] - lets handlers answer the request they were given
//! - built-in handlers for heartbeat, negotiation, session, offline and
//!   authentication requests
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::handler::HandlerRegistry;
//! use rpcwire::protocol::MsgType;
//!
//! let mut registry = HandlerRegistry::with_builtins(plugins);
//!
//! registry.register_invocations(MsgType::BizReq, |inv, _ctx| async move {
//!     Ok(serde_json::json!(format!("{}::{}", inv.interface, inv.method)))
//! });
//! ```

mod builtin;
mod context;
mod registry;

pub use builtin::{AllowAll, Authenticator};
pub use context::RequestContext;
pub use registry::{
    BoxFuture, FnHandler, Handler, HandlerRegistry, HandlerResult, InvocationHandler,
};
