//! Procedure and event registries.
//!
//! A procedure name maps to exactly one handler (last registration wins). An
//! event name maps to any number of listeners, each identified by the
//! [`ListenerId`] returned when it was added.

use crate::config::ProtocolConfig;
use crate::environment::Environment;
use crate::transport::{BrowserHandle, PeerId};
use crate::util::lock;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// What a handler produces: a success payload or a failure payload.
pub type HandlerResult = std::result::Result<Value, Value>;

/// Boxed future returned by [`Procedure::invoke`].
pub type ProcedureFuture = BoxFuture<'static, HandlerResult>;

/// Context handed to every procedure handler and event listener.
#[derive(Clone)]
pub struct CallInfo {
    /// Correlation id of the request, absent for purely local invocations.
    pub id: Option<String>,
    /// Environment the invocation really started in.
    pub environment: Environment,
    /// Sending client, on the server only.
    pub peer: Option<PeerId>,
    /// Sending browser surface, on the client only.
    pub browser: Option<Arc<dyn BrowserHandle>>,
}

impl CallInfo {
    pub fn local(environment: Environment) -> Self {
        Self {
            id: None,
            environment,
            peer: None,
            browser: None,
        }
    }
}

impl std::fmt::Debug for CallInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInfo")
            .field("id", &self.id)
            .field("environment", &self.environment)
            .field("peer", &self.peer)
            .field("browser", &self.browser.is_some())
            .finish()
    }
}

/// A named procedure. Implemented for every matching async closure.
pub trait Procedure: Send + Sync + 'static {
    fn invoke(&self, args: Value, info: CallInfo) -> ProcedureFuture;
}

impl<F, Fut> Procedure for F
where
    F: Fn(Value, CallInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn invoke(&self, args: Value, info: CallInfo) -> ProcedureFuture {
        Box::pin(self(args, info))
    }
}

/// An event listener. Implemented for every matching closure.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, args: Value, info: CallInfo) -> std::result::Result<(), Value>;
}

impl<F> EventListener for F
where
    F: Fn(Value, CallInfo) -> std::result::Result<(), Value> + Send + Sync + 'static,
{
    fn on_event(&self, args: Value, info: CallInfo) -> std::result::Result<(), Value> {
        self(args, info)
    }
}

/// Wrap an async closure as a shareable procedure.
pub fn procedure<F, Fut>(f: F) -> Arc<dyn Procedure>
where
    F: Fn(Value, CallInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a shareable event listener.
pub fn listener<F>(f: F) -> Arc<dyn EventListener>
where
    F: Fn(Value, CallInfo) -> std::result::Result<(), Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn not_found() -> Value {
    Value::String(ProtocolConfig::ERR_NOT_FOUND.to_string())
}

/// Name -> single handler.
#[derive(Default)]
pub struct ProcedureRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn Procedure>>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(&self, name: &str, handler: Arc<dyn Procedure>) -> Option<Arc<dyn Procedure>> {
        lock(&self.handlers).insert(name.to_string(), handler)
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        lock(&self.handlers).remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Procedure>> {
        lock(&self.handlers).get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.handlers).contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.handlers).keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler for `name`, or fail with the not-found sentinel.
    ///
    /// A panicking handler is reported as a failure payload instead of
    /// tearing down the task that serves the request.
    pub async fn invoke(&self, name: &str, args: Value, info: CallInfo) -> HandlerResult {
        let Some(handler) = self.get(name) else {
            return Err(not_found());
        };

        use futures::FutureExt;
        match AssertUnwindSafe(handler.invoke(args, info)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("panic in procedure {name}: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("panic in procedure {name}: {s}")
                } else {
                    format!("panic in procedure {name}")
                };
                Err(Value::String(message))
            }
        }
    }
}

/// Handle for removing one listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Name -> set of listeners.
#[derive(Default)]
pub struct EventRegistry {
    listeners: Mutex<HashMap<String, Vec<(ListenerId, Arc<dyn EventListener>)>>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, name: &str, listener: Arc<dyn EventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners)
            .entry(name.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove one listener. Returns whether it was registered under `name`.
    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let Some(set) = listeners.get_mut(name) else {
            return false;
        };
        let before = set.len();
        set.retain(|(existing, _)| *existing != id);
        let removed = set.len() != before;
        if set.is_empty() {
            listeners.remove(name);
        }
        removed
    }

    pub fn listener_count(&self, name: &str) -> usize {
        lock(&self.listeners).get(name).map_or(0, Vec::len)
    }

    /// Invoke every listener for `name` in registration order.
    ///
    /// A failing or panicking listener does not stop the others; failures are
    /// logged and discarded. Returns how many listeners ran.
    pub fn emit(&self, name: &str, args: &Value, info: &CallInfo) -> usize {
        // Snapshot so listeners may call on/off without deadlocking.
        let snapshot: Vec<Arc<dyn EventListener>> = match lock(&self.listeners).get(name) {
            Some(set) => set.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return 0,
        };

        for listener in &snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.on_event(args.clone(), info.clone())
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("Listener for event {} failed: {}", name, err),
                Err(_) => debug!("Listener for event {} panicked", name),
            }
        }
        snapshot.len()
    }
}
