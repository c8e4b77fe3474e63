//! crossrpc - procedure calls and events across a server, its clients and the
//! browser surfaces each client hosts.
//!
//! Every context registers named procedures and event listeners, and can call
//! or trigger names registered in any other context. Traffic between the
//! server and a browser is always relayed by the client hosting the browser.
//!
//! Transports are pluggable (see [`transport`]); an in-process adapter and a
//! TCP adapter for the server <-> client hop are bundled.
//!
//! # Example
//!
//! ```rust,ignore
//! use crossrpc::transport::memory::MemoryServerTransport;
//! use crossrpc::{procedure, ClientContext, ServerContext};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> crossrpc::Result<()> {
//!     let (link, inbound) = MemoryServerTransport::new();
//!     let server = ServerContext::new(link.clone());
//!     server.serve(inbound);
//!     server.register("add", procedure(|args: Value, _| async move {
//!         Ok::<Value, Value>(json!(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0)))
//!     }))?;
//!
//!     let endpoint = link.connect("peer-1");
//!     let client = ClientContext::new(endpoint.transport.clone(), Vec::new());
//!     client.serve(endpoint.inbound);
//!
//!     assert_eq!(client.call_server("add", json!([2, 3])).await?, json!(5));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod envelope;
pub mod environment;
pub mod error;
pub mod ids;
pub mod pending;
pub mod registry;
pub mod script;
pub mod transport;

mod util;

// Re-export commonly used types
pub use config::{ProtocolConfig, TransportConfig};
pub use context::{
    BrowserContext, BrowserDirectory, ClientContext, RpcContext, RpcOptions, ServerContext, Target,
};
pub use envelope::{Codec, Envelope, EnvelopeError, JsonCodec, Request, Response};
pub use environment::{Environment, UnknownEnvironment};
pub use error::{Result, RpcError};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use registry::{
    listener, procedure, CallInfo, EventListener, HandlerResult, ListenerId, Procedure,
};
pub use transport::{
    BrowserHandle, BrowserTransport, ClientInbound, ClientTransport, PeerId, ServerInbound,
    ServerTransport,
};
