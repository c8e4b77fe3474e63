//! Browser surface runtime.
//!
//! A browser only ever talks to its hosting client, on the client's
//! well-known channels. Everything addressed to the server or to other
//! browsers is relayed by the client.
//!
//! The client hands the browser its identity through the bootstrap script,
//! possibly after the runtime has already started registering handlers.
//! Registration announcements and outbound triggers issued before that are
//! queued and flushed, in order, once [`BrowserContext::assign_identity`]
//! runs. Outbound calls simply wait for the identity.

use super::{relay_args, require_name, Core, RpcContext, RpcOptions, Target};
use crate::config::ProtocolConfig;
use crate::envelope::{decode_or_log, Envelope, Request};
use crate::environment::Environment;
use crate::pending::wait_for;
use crate::registry::{CallInfo, EventListener, ListenerId, Procedure};
use crate::transport::{BrowserHandle, BrowserTransport};
use crate::util::lock;
use crate::{Result, RpcError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Outbound traffic held back until the browser knows its identity.
enum Deferred {
    Announce { channel: &'static str, name: String },
    Trigger(Request),
}

#[derive(Default)]
struct IdentitySlot {
    id: Option<String>,
    deferred: Vec<Deferred>,
}

struct BrowserInner {
    core: Arc<Core>,
    transport: Arc<dyn BrowserTransport>,
    slot: Mutex<IdentitySlot>,
    identity: watch::Sender<Option<String>>,
}

/// Runtime inside one browser surface. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct BrowserContext {
    inner: Arc<BrowserInner>,
}

impl BrowserContext {
    pub fn new(transport: Arc<dyn BrowserTransport>) -> Self {
        Self::with_options(transport, RpcOptions::default())
    }

    pub fn with_options(transport: Arc<dyn BrowserTransport>, options: RpcOptions) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            inner: Arc::new(BrowserInner {
                core: Arc::new(Core::new(Environment::Browser, options)),
                transport,
                slot: Mutex::new(IdentitySlot::default()),
                identity,
            }),
        }
    }

    /// Learn the identity the client assigned to this surface. Only the
    /// first assignment counts; queued traffic is flushed immediately.
    pub fn assign_identity(&self, id: &str) {
        let mut slot = lock(&self.inner.slot);
        if let Some(current) = &slot.id {
            if current != id {
                debug!("Keeping browser identity {}, ignoring {}", current, id);
            }
            return;
        }
        debug!("Browser identity assigned: {}", id);
        slot.id = Some(id.to_string());
        self.inner.identity.send_replace(Some(id.to_string()));

        // Flushed under the lock so later traffic cannot overtake it.
        for deferred in std::mem::take(&mut slot.deferred) {
            let sent = match deferred {
                Deferred::Announce { channel, name } => self.send_announcement(channel, id, &name),
                Deferred::Trigger(req) => self.send_to_client(req.with_browser(id)),
            };
            if let Err(e) = sent {
                debug!("Failed to flush deferred browser message: {}", e);
            }
        }
    }

    /// The identity, if the client has assigned one yet.
    pub fn identity(&self) -> Option<String> {
        lock(&self.inner.slot).id.clone()
    }

    /// Wait until the client has assigned an identity.
    pub async fn wait_identity(&self) -> Result<String> {
        let mut rx = self.inner.identity.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(id) = current {
                return Ok(id);
            }
            rx.changed().await.map_err(|_| RpcError::Closed)?;
        }
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.core.pending.len()
    }

    /// Inbound entry point for one envelope dispatched by the client.
    ///
    /// Calls are answered from a task spawned on the current Tokio runtime;
    /// invoked from a thread without one, only triggers are handled.
    pub fn process(&self, raw: &str) {
        let core = &self.inner.core;
        let Some(envelope) = decode_or_log(core.codec.as_ref(), raw) else {
            return;
        };

        match envelope {
            Envelope::Request(req) => {
                trace!("Request {} ({}) from {}", req.name, req.id, req.env);
                let info = CallInfo {
                    id: Some(req.id.clone()),
                    environment: req.origin(),
                    peer: None,
                    browser: None,
                };
                let browser = self.clone();
                core.serve_request(req, info, move |resp| {
                    if let Err(e) = browser.send_to_client(resp) {
                        debug!("Failed to answer client: {}", e);
                    }
                });
            }
            Envelope::Response(resp) => {
                core.pending.settle(&resp.id, None, resp.outcome);
            }
        }
    }

    fn send_to_client(&self, envelope: impl Into<Envelope>) -> Result<()> {
        let payload = self.inner.core.encode(envelope)?;
        self.inner
            .transport
            .send_to_client(ProtocolConfig::PROCESS_EVENT, payload)
    }

    fn send_announcement(&self, channel: &str, id: &str, name: &str) -> Result<()> {
        let payload = serde_json::to_string(&(id, name))?;
        self.inner.transport.send_to_client(channel, payload)
    }

    /// Tell the client this surface serves `name`, or no longer does.
    fn announce(&self, channel: &'static str, name: &str) {
        let mut slot = lock(&self.inner.slot);
        let sent = match slot.id.clone() {
            Some(id) => self.send_announcement(channel, &id, name),
            None => {
                slot.deferred.push(Deferred::Announce {
                    channel,
                    name: name.to_string(),
                });
                Ok(())
            }
        };
        if let Err(e) = sent {
            debug!("Failed to announce {} on {}: {}", name, channel, e);
        }
    }

    /// Announce unregistration only once nothing under `name` remains.
    fn announce_if_released(&self, name: &str) {
        let core = &self.inner.core;
        if !core.procedures.contains(name) && core.events.listener_count(name) == 0 {
            self.announce(ProtocolConfig::BROWSER_UNREGISTER, name);
        }
    }

    pub fn register(&self, name: &str, handler: Arc<dyn Procedure>) -> Result<()> {
        require_name("register", name)?;
        self.inner.core.procedures.register(name, handler);
        self.announce(ProtocolConfig::BROWSER_REGISTER, name);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        require_name("unregister", name)?;
        if self.inner.core.procedures.unregister(name) {
            self.announce_if_released(name);
        }
        Ok(())
    }

    pub fn on(&self, name: &str, listener: Arc<dyn EventListener>) -> Result<ListenerId> {
        require_name("on", name)?;
        let id = self.inner.core.events.on(name, listener);
        self.announce(ProtocolConfig::BROWSER_REGISTER, name);
        Ok(id)
    }

    pub fn off(&self, name: &str, listener: ListenerId) -> Result<()> {
        require_name("off", name)?;
        if self.inner.core.events.off(name, listener) {
            self.announce_if_released(name);
        }
        Ok(())
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        self.inner.core.call_local(name, args).await
    }

    pub async fn call_server(&self, name: &str, args: Value) -> Result<Value> {
        require_name("call_server", name)?;
        self.call_client(ProtocolConfig::RELAY_CALL_SERVER, relay_args(name, &args))
            .await
    }

    /// Call a procedure on the hosting client. Waits for the identity first.
    pub async fn call_client(&self, name: &str, args: Value) -> Result<Value> {
        require_name("call_client", name)?;
        let browser_id = self.wait_identity().await?;
        let core = &self.inner.core;
        let id = core.next_id();
        let rx = core.pending.insert(&id, None)?;
        let req = Request::call(&id, Environment::Browser, name, args).with_browser(browser_id);
        if let Err(e) = self.send_to_client(req) {
            core.pending.discard(&id);
            return Err(e);
        }
        wait_for(rx).await
    }

    pub async fn call_browsers(&self, name: &str, args: Value) -> Result<Value> {
        require_name("call_browsers", name)?;
        self.call_client(ProtocolConfig::RELAY_CALL_BROWSERS, relay_args(name, &args))
            .await
    }

    pub fn trigger(&self, name: &str, args: Value) -> Result<()> {
        self.inner.core.trigger_local(name, args)
    }

    pub fn trigger_server(&self, name: &str, args: Value) -> Result<()> {
        require_name("trigger_server", name)?;
        self.trigger_client(ProtocolConfig::RELAY_TRIGGER_SERVER, relay_args(name, &args))
    }

    /// Trigger an event on the hosting client. Queued until the identity is
    /// known.
    pub fn trigger_client(&self, name: &str, args: Value) -> Result<()> {
        require_name("trigger_client", name)?;
        let req = Request::trigger(self.inner.core.next_id(), Environment::Browser, name, args);
        let mut slot = lock(&self.inner.slot);
        match slot.id.clone() {
            Some(id) => self.send_to_client(req.with_browser(id)),
            None => {
                slot.deferred.push(Deferred::Trigger(req));
                Ok(())
            }
        }
    }

    pub fn trigger_browsers(&self, name: &str, args: Value) -> Result<()> {
        require_name("trigger_browsers", name)?;
        self.trigger_client(ProtocolConfig::RELAY_TRIGGER_BROWSERS, relay_args(name, &args))
    }
}

fn reject_target(operation: &str, target: Option<Target>) -> Result<()> {
    match target {
        None => Ok(()),
        Some(_) => Err(RpcError::invalid_arguments(format!(
            "{operation} from the browser expects a name and optional args"
        ))),
    }
}

#[async_trait]
impl RpcContext for BrowserContext {
    fn environment(&self) -> Environment {
        Environment::Browser
    }

    fn register(&self, name: &str, handler: Arc<dyn Procedure>) -> Result<()> {
        BrowserContext::register(self, name, handler)
    }

    fn unregister(&self, name: &str) -> Result<()> {
        BrowserContext::unregister(self, name)
    }

    fn on(&self, name: &str, listener: Arc<dyn EventListener>) -> Result<ListenerId> {
        BrowserContext::on(self, name, listener)
    }

    fn off(&self, name: &str, listener: ListenerId) -> Result<()> {
        BrowserContext::off(self, name, listener)
    }

    async fn call(&self, name: &str, args: Value) -> Result<Value> {
        BrowserContext::call(self, name, args).await
    }

    async fn call_server(&self, name: &str, args: Value) -> Result<Value> {
        BrowserContext::call_server(self, name, args).await
    }

    async fn call_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<Value> {
        reject_target("call_client", target)?;
        BrowserContext::call_client(self, name, args).await
    }

    async fn call_browsers(
        &self,
        target: Option<Target>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        reject_target("call_browsers", target)?;
        BrowserContext::call_browsers(self, name, args).await
    }

    async fn call_browser(
        &self,
        _browser: Arc<dyn BrowserHandle>,
        _name: &str,
        _args: Value,
    ) -> Result<Value> {
        Err(RpcError::WrongEnvironment {
            operation: "call_browser",
            environment: Environment::Browser,
        })
    }

    fn trigger(&self, name: &str, args: Value) -> Result<()> {
        BrowserContext::trigger(self, name, args)
    }

    fn trigger_server(&self, name: &str, args: Value) -> Result<()> {
        BrowserContext::trigger_server(self, name, args)
    }

    fn trigger_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<()> {
        reject_target("trigger_client", target)?;
        BrowserContext::trigger_client(self, name, args)
    }

    fn trigger_browsers(&self, target: Option<Target>, name: &str, args: Value) -> Result<()> {
        reject_target("trigger_browsers", target)?;
        BrowserContext::trigger_browsers(self, name, args)
    }

    fn trigger_browser(
        &self,
        _browser: Arc<dyn BrowserHandle>,
        _name: &str,
        _args: Value,
    ) -> Result<()> {
        Err(RpcError::WrongEnvironment {
            operation: "trigger_browser",
            environment: Environment::Browser,
        })
    }
}
