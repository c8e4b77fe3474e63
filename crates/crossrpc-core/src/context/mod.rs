//! The per-environment runtimes.
//!
//! Each environment has its own context type with the operations that make
//! sense there ([`ServerContext`], [`ClientContext`], [`BrowserContext`]).
//! All three also implement [`RpcContext`], the uniform surface whose
//! target-taking operations validate the target shape at runtime, so
//! application code that only knows "some context" can hold an
//! `Arc<dyn RpcContext>` chosen once at startup.

mod browser;
mod client;
mod directory;
mod server;

pub use browser::BrowserContext;
pub use client::ClientContext;
pub use directory::BrowserDirectory;
pub use server::ServerContext;

use crate::envelope::{Codec, Envelope, JsonCodec, Request, Response};
use crate::environment::Environment;
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::pending::PendingCalls;
use crate::registry::{
    CallInfo, EventListener, EventRegistry, ListenerId, Procedure, ProcedureRegistry,
};
use crate::transport::{BrowserHandle, PeerId};
use crate::{Result, RpcError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{trace, warn};

/// Pluggable collaborators shared by every context type.
#[derive(Clone)]
pub struct RpcOptions {
    pub codec: Arc<dyn Codec>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            ids: Arc::new(UuidIdGenerator),
        }
    }
}

impl RpcOptions {
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }
}

/// Where a target-taking operation should go.
#[derive(Clone)]
pub enum Target {
    /// A connected client, as seen from the server.
    Peer(PeerId),
    /// A specific browser surface, as seen from its client.
    Browser(Arc<dyn BrowserHandle>),
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Peer(peer) => f.debug_tuple("Peer").field(peer).finish(),
            Target::Browser(_) => f.write_str("Browser(..)"),
        }
    }
}

impl From<PeerId> for Target {
    fn from(peer: PeerId) -> Self {
        Target::Peer(peer)
    }
}

/// The operations every context exposes.
///
/// Call-family operations resolve with the remote result or an [`RpcError`].
/// Trigger-family operations only report problems detected before anything
/// is sent; remote listener failures are never reported.
#[async_trait]
pub trait RpcContext: Send + Sync {
    fn environment(&self) -> Environment;

    /// Register a procedure. A later registration under the same name wins.
    fn register(&self, name: &str, handler: Arc<dyn Procedure>) -> Result<()>;
    fn unregister(&self, name: &str) -> Result<()>;

    /// Add an event listener.
    fn on(&self, name: &str, listener: Arc<dyn EventListener>) -> Result<ListenerId>;
    fn off(&self, name: &str, listener: ListenerId) -> Result<()>;

    /// Call a procedure registered in this same context.
    async fn call(&self, name: &str, args: Value) -> Result<Value>;
    async fn call_server(&self, name: &str, args: Value) -> Result<Value>;
    /// The server must name a peer; the client and browsers must not.
    async fn call_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<Value>;
    /// The server must name a peer; the client and browsers must not.
    async fn call_browsers(&self, target: Option<Target>, name: &str, args: Value)
        -> Result<Value>;
    /// Client only.
    async fn call_browser(
        &self,
        browser: Arc<dyn BrowserHandle>,
        name: &str,
        args: Value,
    ) -> Result<Value>;

    fn trigger(&self, name: &str, args: Value) -> Result<()>;
    fn trigger_server(&self, name: &str, args: Value) -> Result<()>;
    fn trigger_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<()>;
    fn trigger_browsers(&self, target: Option<Target>, name: &str, args: Value) -> Result<()>;
    /// Client only.
    fn trigger_browser(&self, browser: Arc<dyn BrowserHandle>, name: &str, args: Value)
        -> Result<()>;
}

/// State every context owns: registries, pending calls and collaborators.
pub(crate) struct Core {
    pub environment: Environment,
    pub procedures: ProcedureRegistry,
    pub events: EventRegistry,
    pub pending: PendingCalls,
    pub codec: Arc<dyn Codec>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Core {
    pub fn new(environment: Environment, options: RpcOptions) -> Self {
        Self {
            environment,
            procedures: ProcedureRegistry::new(),
            events: EventRegistry::new(),
            pending: PendingCalls::new(),
            codec: options.codec,
            ids: options.ids,
        }
    }

    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    pub fn encode(&self, envelope: impl Into<Envelope>) -> Result<String> {
        self.codec.encode(&envelope.into())
    }

    pub async fn call_local(&self, name: &str, args: Value) -> Result<Value> {
        require_name("call", name)?;
        self.procedures
            .invoke(name, args, CallInfo::local(self.environment))
            .await
            .map_err(RpcError::from_payload)
    }

    pub fn trigger_local(&self, name: &str, args: Value) -> Result<()> {
        require_name("trigger", name)?;
        self.events
            .emit(name, &args, &CallInfo::local(self.environment));
        Ok(())
    }

    /// Run an inbound request. Triggers fan out synchronously and never
    /// answer; calls run on a spawned task and hand exactly one response to
    /// `reply`.
    ///
    /// Calls need a Tokio runtime to run on. Outside one the call is logged
    /// and dropped, and the caller's own timeout is the only answer it gets.
    pub fn serve_request<F>(self: &Arc<Self>, req: Request, info: CallInfo, reply: F)
    where
        F: FnOnce(Response) + Send + 'static,
    {
        if req.trigger {
            let ran = self.events.emit(&req.name, &req.args, &info);
            trace!("Trigger {} ({}) reached {} listener(s)", req.name, req.id, ran);
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!(
                "Dropping call {} ({}): no Tokio runtime on this thread",
                req.name, req.id
            );
            return;
        };

        let core = Arc::clone(self);
        runtime.spawn(async move {
            let outcome = core.procedures.invoke(&req.name, req.args, info).await;
            trace!(
                "Procedure {} ({}) finished: {}",
                req.name,
                req.id,
                if outcome.is_ok() { "ok" } else { "err" }
            );
            reply(Response::new(req.id, core.environment, outcome));
        });
    }
}

pub(crate) fn require_name(operation: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RpcError::invalid_arguments(format!(
            "{operation} expects a non-empty name"
        )));
    }
    Ok(())
}

/// Arguments for the client relay procedures: `[name, args]`.
pub(crate) fn relay_args(name: &str, args: &Value) -> Value {
    json!([name, args])
}

/// Unpack `[name, args]` received by a relay procedure.
pub(crate) fn parse_relay_args(args: Value) -> std::result::Result<(String, Value), Value> {
    let invalid = || Value::String("relay expects [name, args]".to_string());
    let Value::Array(mut parts) = args else {
        return Err(invalid());
    };
    if parts.is_empty() || parts.len() > 2 {
        return Err(invalid());
    }
    let inner_args = if parts.len() == 2 {
        parts.pop().unwrap_or(Value::Null)
    } else {
        Value::Null
    };
    match parts.pop() {
        Some(Value::String(name)) if !name.is_empty() => Ok((name, inner_args)),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_args_roundtrip() {
        let packed = relay_args("getState", &json!({"a": 1}));
        assert_eq!(packed, json!(["getState", {"a": 1}]));
        assert_eq!(
            parse_relay_args(packed).unwrap(),
            ("getState".to_string(), json!({"a": 1}))
        );
    }

    #[test]
    fn test_relay_args_without_payload() {
        assert_eq!(
            parse_relay_args(json!(["ping"])).unwrap(),
            ("ping".to_string(), Value::Null)
        );
    }

    #[test]
    fn test_relay_args_rejects_bad_shapes() {
        for bad in [json!("ping"), json!([]), json!([1, 2]), json!(["", 1]), json!(["a", 1, 2])] {
            assert!(parse_relay_args(bad).is_err());
        }
    }

    #[test]
    fn test_require_name() {
        assert!(require_name("call", "x").is_ok());
        assert!(matches!(
            require_name("call", ""),
            Err(RpcError::InvalidArguments { .. })
        ));
    }
}
