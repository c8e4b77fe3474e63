//! Transport seams between the three contexts.
//!
//! Each pair of contexts talks through a different primitive:
//!
//! - server -> client: [`ServerTransport::send_to_peer`]
//! - client -> server: [`ClientTransport::send_to_server`]
//! - client -> browser: [`BrowserHandle::execute`] (runs a script, no reply)
//! - browser -> client: [`BrowserTransport::send_to_client`] on a named channel
//!
//! Browser <-> server traffic never has a primitive of its own; it is always
//! relayed by the client. All primitives are fire-and-forget: a returned error
//! only means the payload could not be handed to the transport.
//!
//! Bundled adapters:
//! - [`memory`]: in-process wiring for tests and embedding
//! - [`tcp`]: length-prefixed frames over TCP for server <-> client

pub mod frame;
pub mod memory;
pub mod tcp;

use crate::Result;
use serde::{Deserialize, Serialize};

/// Identity of a client connected to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Server-side primitive: deliver a payload to one connected client.
pub trait ServerTransport: Send + Sync + 'static {
    fn send_to_peer(&self, peer: &PeerId, payload: String) -> Result<()>;
}

/// Client-side primitive: deliver a payload to the server.
pub trait ClientTransport: Send + Sync + 'static {
    fn send_to_server(&self, payload: String) -> Result<()>;
}

/// Browser-side primitive: deliver a payload to the hosting client on a
/// well-known channel.
pub trait BrowserTransport: Send + Sync + 'static {
    fn send_to_client(&self, channel: &str, payload: String) -> Result<()>;
}

/// A live browser surface as seen from its hosting client.
pub trait BrowserHandle: Send + Sync + 'static {
    /// Run a script inside the surface. There is no return channel.
    fn execute(&self, code: &str);

    /// Whether the surface still exists.
    fn is_valid(&self) -> bool;
}

/// Payload pushed by a server transport into the server context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInbound {
    Connected(PeerId),
    Message(PeerId, String),
    Disconnected(PeerId),
}

/// Payload pushed by a client transport into the client context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInbound {
    pub channel: String,
    pub payload: String,
}

impl ClientInbound {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}
