//! # rpcwire
//!
//! Binary RPC transport runtime: framing, pluggable serialization and
//! compression, request/response correlation and connection lifecycle.
//!
//! ## Architecture
//!
//! - **Frame codec**: magic + length-prefixed header with typed attributes,
//!   body serialized and optionally compressed by plugins selected per message
//! - **Correlation**: per-connection table resolving replies by message id,
//!   with per-call timeouts and a sweep on disconnect
//! - **Transport**: one read loop and one batching writer per connection,
//!   handlers on a bounded task pool, explicit open/close state machine
//!
//! ## Example
//!
//! ```ignore
//! use rpcwire::{Client, Invocation, Server};
//!
//! #[tokio::main]
//! async fn main() -> rpcwire::Result<()> {
//!     let server = Server::builder("127.0.0.1:0")
//!         .on_invoke(|inv, _ctx| async move { Ok(serde_json::json!(inv.args)) })
//!         .bind()
//!         .await?;
//!
//!     let client = Client::builder(server.local_addr().to_string())
//!         .connect()
//!         .await?;
//!     let echoed = client
//!         .invoke(Invocation::new("echo", "echo").with_arg("hi"))
//!         .await?;
//!     assert_eq!(echoed, serde_json::json!(["hi"]));
//!
//!     client.close(true).await;
//!     server.close(true).await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod handler;
pub mod inflight;
pub mod protocol;
pub mod transport;
pub mod writer;

mod client;
mod server;

pub use client::{Client, ClientBuilder};
pub use config::{CodecConfig, TransportConfig};
pub use error::{CodecError, CodecErrorKind, Result, RpcError};
pub use handler::{HandlerRegistry, RequestContext};
pub use protocol::{Header, Invocation, Message, MsgType, Payload};
pub use server::{Server, ServerBuilder};
pub use transport::{Channel, ConnState};
