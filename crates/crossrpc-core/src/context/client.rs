//! Client runtime.
//!
//! The client sits between the server and the browser surfaces it hosts. It
//! keeps the [`BrowserDirectory`], answers the registration channels, and
//! installs four relays so browsers and the server can reach each other:
//!
//! | relay                    | kind      | does                                   |
//! |--------------------------|-----------|----------------------------------------|
//! | `__rpc:callServer`       | procedure | re-issue `[name, args]` to the server  |
//! | `__rpc:callBrowsers`     | procedure | call the browser that owns `name`      |
//! | `__rpc:triggerServer`    | event     | re-trigger `[name, args]` on the server|
//! | `__rpc:triggerBrowsers`  | event     | trigger the browser that owns `name`   |
//!
//! Relayed requests carry the origin environment in `fenv`.

use super::directory::BrowserDirectory;
use super::{parse_relay_args, require_name, Core, RpcContext, RpcOptions, Target};
use crate::config::ProtocolConfig;
use crate::envelope::{decode_or_log, Envelope, Request, Response};
use crate::environment::Environment;
use crate::pending::wait_for;
use crate::registry::{
    listener, procedure, CallInfo, EventListener, HandlerResult, ListenerId, Procedure,
};
use crate::script;
use crate::transport::{BrowserHandle, ClientInbound, ClientTransport};
use crate::{Result, RpcError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct ClientInner {
    core: Arc<Core>,
    transport: Arc<dyn ClientTransport>,
    directory: BrowserDirectory,
}

/// Client-side runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ClientContext {
    inner: Arc<ClientInner>,
}

fn context_dropped() -> Value {
    Value::String(RpcError::Closed.to_string())
}

impl ClientContext {
    /// Build a client over `transport`, admitting the browser surfaces that
    /// already exist.
    pub fn new<I>(transport: Arc<dyn ClientTransport>, browsers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn BrowserHandle>>,
    {
        Self::with_options(transport, browsers, RpcOptions::default())
    }

    pub fn with_options<I>(transport: Arc<dyn ClientTransport>, browsers: I, options: RpcOptions) -> Self
    where
        I: IntoIterator<Item = Arc<dyn BrowserHandle>>,
    {
        let client = Self {
            inner: Arc::new(ClientInner {
                core: Arc::new(Core::new(Environment::Client, options)),
                transport,
                directory: BrowserDirectory::new(),
            }),
        };
        client.install_relays();
        for browser in browsers {
            client.browser_created(browser);
        }
        client
    }

    fn upgrade(weak: &Weak<ClientInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Register the relay procedures and events. Running it again replaces
    /// the relays with equivalent ones.
    fn install_relays(&self) {
        let core = &self.inner.core;

        let weak = Arc::downgrade(&self.inner);
        core.procedures.register(
            ProtocolConfig::RELAY_CALL_SERVER,
            procedure(move |args, info: CallInfo| {
                relay_call_server(Self::upgrade(&weak), args, info)
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        core.procedures.register(
            ProtocolConfig::RELAY_CALL_BROWSERS,
            procedure(move |args, info: CallInfo| {
                relay_call_browsers(Self::upgrade(&weak), args, info)
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        core.events.on(
            ProtocolConfig::RELAY_TRIGGER_SERVER,
            listener(move |args, info| {
                let client = Self::upgrade(&weak).ok_or_else(context_dropped)?;
                let (name, args) = parse_relay_args(args)?;
                client
                    .trigger_server_as(&name, args, Some(info.environment))
                    .map_err(|e| e.to_payload())
            }),
        );

        let weak = Arc::downgrade(&self.inner);
        core.events.on(
            ProtocolConfig::RELAY_TRIGGER_BROWSERS,
            listener(move |args, info| {
                let client = Self::upgrade(&weak).ok_or_else(context_dropped)?;
                let (name, args) = parse_relay_args(args)?;
                client
                    .trigger_browsers_as(&name, args, Some(info.environment))
                    .map_err(|e| e.to_payload())
            }),
        );
    }

    /// A browser surface became live: give it a fresh identity and send it
    /// the bootstrap script. Returns the identity.
    pub fn browser_created(&self, browser: Arc<dyn BrowserHandle>) -> String {
        let id = self.inner.core.next_id();
        self.inner.directory.admit(&id, Arc::clone(&browser));
        debug!("Browser {} admitted", id);
        browser.execute(&script::bootstrap(&id));
        id
    }

    pub fn directory(&self) -> &BrowserDirectory {
        &self.inner.directory
    }

    /// Browser identity currently serving `name`.
    pub fn browser_owner(&self, name: &str) -> Option<String> {
        self.inner.directory.owner(name)
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.core.pending.len()
    }

    /// Spawn the inbound pump for everything arriving from the server and
    /// from the hosted browsers.
    pub fn serve(&self, mut inbound: mpsc::UnboundedReceiver<ClientInbound>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(item) = inbound.recv().await {
                client.receive(&item.channel, &item.payload);
            }
            debug!("Client inbound closed");
        })
    }

    /// Route one payload arriving on a well-known client channel.
    ///
    /// Same runtime requirement as [`ClientContext::process`].
    pub fn receive(&self, channel: &str, payload: &str) {
        match channel {
            ProtocolConfig::PROCESS_EVENT => self.process(payload),
            ProtocolConfig::BROWSER_REGISTER => {
                if let Some((browser_id, name)) = parse_announcement(payload) {
                    self.inner.directory.claim(&name, &browser_id);
                }
            }
            ProtocolConfig::BROWSER_UNREGISTER => {
                if let Some((browser_id, name)) = parse_announcement(payload) {
                    self.inner.directory.release(&name, &browser_id);
                }
            }
            other => debug!("Ignoring payload on unknown channel {}", other),
        }
    }

    /// Inbound entry point for one envelope from the server or a browser.
    ///
    /// Calls are answered from a task spawned on the current Tokio runtime;
    /// invoked from a thread without one, only triggers are handled.
    pub fn process(&self, raw: &str) {
        let core = &self.inner.core;
        let Some(envelope) = decode_or_log(core.codec.as_ref(), raw) else {
            return;
        };

        let req = match envelope {
            Envelope::Response(resp) => {
                core.pending.settle(&resp.id, None, resp.outcome);
                return;
            }
            Envelope::Request(req) => req,
        };
        trace!("Request {} ({}) from {}", req.name, req.id, req.env);

        match req.env {
            Environment::Server => {
                let info = CallInfo {
                    id: Some(req.id.clone()),
                    environment: req.origin(),
                    peer: None,
                    browser: None,
                };
                let client = self.clone();
                core.serve_request(req, info, move |resp| {
                    if let Err(e) = client.send_to_server(resp) {
                        debug!("Failed to answer server: {}", e);
                    }
                });
            }
            Environment::Browser => {
                let browser = req
                    .browser_id
                    .as_deref()
                    .and_then(|id| self.inner.directory.live(id));
                let info = CallInfo {
                    id: Some(req.id.clone()),
                    environment: req.origin(),
                    peer: None,
                    browser: browser.clone(),
                };
                let client = self.clone();
                core.serve_request(req, info, move |resp| match browser {
                    Some(browser) if browser.is_valid() => {
                        if let Err(e) = client.pass_to_browser(browser.as_ref(), resp, None) {
                            debug!("Failed to answer browser: {}", e);
                        }
                    }
                    _ => debug!("Dropping response {}: browser is gone", resp.id),
                });
            }
            Environment::Client => {
                debug!("Dropping request {} addressed from another client", req.id);
            }
        }
    }

    fn send_to_server(&self, envelope: impl Into<Envelope>) -> Result<()> {
        let payload = self.inner.core.encode(envelope)?;
        self.inner.transport.send_to_server(payload)
    }

    /// Execute a dispatch of `envelope` inside `browser`. With a
    /// `not_found_reply` the browser answers it when no runtime is loaded.
    fn pass_to_browser(
        &self,
        browser: &dyn BrowserHandle,
        envelope: impl Into<Envelope>,
        not_found_reply: Option<Response>,
    ) -> Result<()> {
        let payload = self.inner.core.encode(envelope)?;
        let reply = match not_found_reply {
            Some(reply) => Some(self.inner.core.encode(reply)?),
            None => None,
        };
        browser.execute(&script::dispatch(&payload, reply.as_deref()));
        Ok(())
    }

    pub fn register(&self, name: &str, handler: Arc<dyn Procedure>) -> Result<()> {
        require_name("register", name)?;
        self.inner.core.procedures.register(name, handler);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        require_name("unregister", name)?;
        self.inner.core.procedures.unregister(name);
        Ok(())
    }

    pub fn on(&self, name: &str, listener: Arc<dyn EventListener>) -> Result<ListenerId> {
        require_name("on", name)?;
        Ok(self.inner.core.events.on(name, listener))
    }

    pub fn off(&self, name: &str, listener: ListenerId) -> Result<()> {
        require_name("off", name)?;
        self.inner.core.events.off(name, listener);
        Ok(())
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        self.inner.core.call_local(name, args).await
    }

    pub async fn call_server(&self, name: &str, args: Value) -> Result<Value> {
        self.call_server_as(name, args, None).await
    }

    async fn call_server_as(&self, name: &str, args: Value, fenv: Option<Environment>) -> Result<Value> {
        require_name("call_server", name)?;
        let core = &self.inner.core;
        let id = core.next_id();
        let rx = core.pending.insert(&id, None)?;
        let req = Request::call(&id, Environment::Client, name, args).with_fenv(fenv);
        if let Err(e) = self.send_to_server(req) {
            core.pending.discard(&id);
            return Err(e);
        }
        wait_for(rx).await
    }

    /// On the client this is a local call.
    pub async fn call_client(&self, name: &str, args: Value) -> Result<Value> {
        self.call(name, args).await
    }

    /// Call the browser that announced `name`.
    pub async fn call_browsers(&self, name: &str, args: Value) -> Result<Value> {
        self.call_browsers_as(name, args, None).await
    }

    async fn call_browsers_as(&self, name: &str, args: Value, fenv: Option<Environment>) -> Result<Value> {
        require_name("call_browsers", name)?;
        let browser = self
            .inner
            .directory
            .owner_handle(name)
            .ok_or(RpcError::ProcedureNotFound)?;
        self.call_browser_as(browser.as_ref(), name, args, fenv).await
    }

    /// Call a specific browser, whether or not it announced `name`.
    pub async fn call_browser(&self, browser: &dyn BrowserHandle, name: &str, args: Value) -> Result<Value> {
        self.call_browser_as(browser, name, args, None).await
    }

    async fn call_browser_as(
        &self,
        browser: &dyn BrowserHandle,
        name: &str,
        args: Value,
        fenv: Option<Environment>,
    ) -> Result<Value> {
        require_name("call_browser", name)?;
        if !browser.is_valid() {
            return Err(RpcError::ProcedureNotFound);
        }
        let core = &self.inner.core;
        let id = core.next_id();
        let rx = core.pending.insert(&id, None)?;
        let req = Request::call(&id, Environment::Client, name, args).with_fenv(fenv);
        let not_found = Response::new(
            &id,
            Environment::Browser,
            Err(RpcError::ProcedureNotFound.to_payload()),
        );
        if let Err(e) = self.pass_to_browser(browser, req, Some(not_found)) {
            core.pending.discard(&id);
            return Err(e);
        }
        wait_for(rx).await
    }

    pub fn trigger(&self, name: &str, args: Value) -> Result<()> {
        self.inner.core.trigger_local(name, args)
    }

    pub fn trigger_server(&self, name: &str, args: Value) -> Result<()> {
        self.trigger_server_as(name, args, None)
    }

    fn trigger_server_as(&self, name: &str, args: Value, fenv: Option<Environment>) -> Result<()> {
        require_name("trigger_server", name)?;
        let id = self.inner.core.next_id();
        self.send_to_server(Request::trigger(id, Environment::Client, name, args).with_fenv(fenv))
    }

    pub fn trigger_client(&self, name: &str, args: Value) -> Result<()> {
        self.trigger(name, args)
    }

    /// Trigger the browser that announced `name`. Fails with
    /// [`RpcError::ProcedureNotFound`] when no live browser owns it.
    pub fn trigger_browsers(&self, name: &str, args: Value) -> Result<()> {
        self.trigger_browsers_as(name, args, None)
    }

    fn trigger_browsers_as(&self, name: &str, args: Value, fenv: Option<Environment>) -> Result<()> {
        require_name("trigger_browsers", name)?;
        let browser = self
            .inner
            .directory
            .owner_handle(name)
            .ok_or(RpcError::ProcedureNotFound)?;
        self.trigger_browser_as(browser.as_ref(), name, args, fenv)
    }

    pub fn trigger_browser(&self, browser: &dyn BrowserHandle, name: &str, args: Value) -> Result<()> {
        self.trigger_browser_as(browser, name, args, None)
    }

    fn trigger_browser_as(
        &self,
        browser: &dyn BrowserHandle,
        name: &str,
        args: Value,
        fenv: Option<Environment>,
    ) -> Result<()> {
        require_name("trigger_browser", name)?;
        if !browser.is_valid() {
            return Err(RpcError::ProcedureNotFound);
        }
        let id = self.inner.core.next_id();
        let req = Request::trigger(id, Environment::Client, name, args).with_fenv(fenv);
        // Triggers are never answered, not even with not-found.
        self.pass_to_browser(browser, req, None)
    }
}

async fn relay_call_server(client: Option<ClientContext>, args: Value, info: CallInfo) -> HandlerResult {
    let client = client.ok_or_else(context_dropped)?;
    let (name, args) = parse_relay_args(args)?;
    client
        .call_server_as(&name, args, Some(info.environment))
        .await
        .map_err(|e| e.to_payload())
}

async fn relay_call_browsers(client: Option<ClientContext>, args: Value, info: CallInfo) -> HandlerResult {
    let client = client.ok_or_else(context_dropped)?;
    let (name, args) = parse_relay_args(args)?;
    client
        .call_browsers_as(&name, args, Some(info.environment))
        .await
        .map_err(|e| e.to_payload())
}

/// Decode a `[browserId, name]` registration announcement.
fn parse_announcement(payload: &str) -> Option<(String, String)> {
    match serde_json::from_str::<(String, String)>(payload) {
        Ok(pair) => Some(pair),
        Err(e) => {
            debug!("Ignoring malformed browser announcement: {}", e);
            None
        }
    }
}

fn reject_target(operation: &str, target: Option<Target>) -> Result<()> {
    match target {
        None => Ok(()),
        Some(_) => Err(RpcError::invalid_arguments(format!(
            "{operation} from the client expects a name and optional args"
        ))),
    }
}

#[async_trait]
impl RpcContext for ClientContext {
    fn environment(&self) -> Environment {
        Environment::Client
    }

    fn register(&self, name: &str, handler: Arc<dyn Procedure>) -> Result<()> {
        ClientContext::register(self, name, handler)
    }

    fn unregister(&self, name: &str) -> Result<()> {
        ClientContext::unregister(self, name)
    }

    fn on(&self, name: &str, listener: Arc<dyn EventListener>) -> Result<ListenerId> {
        ClientContext::on(self, name, listener)
    }

    fn off(&self, name: &str, listener: ListenerId) -> Result<()> {
        ClientContext::off(self, name, listener)
    }

    async fn call(&self, name: &str, args: Value) -> Result<Value> {
        ClientContext::call(self, name, args).await
    }

    async fn call_server(&self, name: &str, args: Value) -> Result<Value> {
        ClientContext::call_server(self, name, args).await
    }

    async fn call_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<Value> {
        reject_target("call_client", target)?;
        ClientContext::call_client(self, name, args).await
    }

    async fn call_browsers(
        &self,
        target: Option<Target>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        reject_target("call_browsers", target)?;
        ClientContext::call_browsers(self, name, args).await
    }

    async fn call_browser(
        &self,
        browser: Arc<dyn BrowserHandle>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        ClientContext::call_browser(self, browser.as_ref(), name, args).await
    }

    fn trigger(&self, name: &str, args: Value) -> Result<()> {
        ClientContext::trigger(self, name, args)
    }

    fn trigger_server(&self, name: &str, args: Value) -> Result<()> {
        ClientContext::trigger_server(self, name, args)
    }

    fn trigger_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<()> {
        reject_target("trigger_client", target)?;
        ClientContext::trigger_client(self, name, args)
    }

    fn trigger_browsers(&self, target: Option<Target>, name: &str, args: Value) -> Result<()> {
        reject_target("trigger_browsers", target)?;
        ClientContext::trigger_browsers(self, name, args)
    }

    fn trigger_browser(
        &self,
        browser: Arc<dyn BrowserHandle>,
        name: &str,
        args: Value,
    ) -> Result<()> {
        ClientContext::trigger_browser(self, browser.as_ref(), name, args)
    }
}
