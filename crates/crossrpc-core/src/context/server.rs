//! Server runtime.
//!
//! The server talks to each connected client through its transport and never
//! reaches a browser directly: browser-bound traffic is relayed through the
//! client that hosts the browser.

use super::{relay_args, require_name, Core, RpcContext, RpcOptions, Target};
use crate::config::ProtocolConfig;
use crate::envelope::{decode_or_log, Envelope, Request};
use crate::environment::Environment;
use crate::pending::wait_for;
use crate::registry::{CallInfo, EventListener, ListenerId, Procedure};
use crate::transport::{BrowserHandle, PeerId, ServerInbound, ServerTransport};
use crate::util::lock;
use crate::{Result, RpcError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

struct ServerInner {
    core: Arc<Core>,
    transport: Arc<dyn ServerTransport>,
    peers: Mutex<BTreeSet<PeerId>>,
}

/// Server-side runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerInner>,
}

impl ServerContext {
    pub fn new(transport: Arc<dyn ServerTransport>) -> Self {
        Self::with_options(transport, RpcOptions::default())
    }

    pub fn with_options(transport: Arc<dyn ServerTransport>, options: RpcOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                core: Arc::new(Core::new(Environment::Server, options)),
                transport,
                peers: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Spawn the inbound pump: every item from the transport is handled in
    /// arrival order until the transport closes.
    pub fn serve(&self, mut inbound: mpsc::UnboundedReceiver<ServerInbound>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            while let Some(item) = inbound.recv().await {
                server.handle_inbound(item);
            }
            debug!("Server inbound closed");
        })
    }

    pub fn handle_inbound(&self, item: ServerInbound) {
        match item {
            ServerInbound::Connected(peer) => {
                info!("Peer {} connected", peer);
                lock(&self.inner.peers).insert(peer);
            }
            ServerInbound::Message(peer, raw) => self.process(&peer, &raw),
            ServerInbound::Disconnected(peer) => {
                info!("Peer {} disconnected", peer);
                lock(&self.inner.peers).remove(&peer);
            }
        }
    }

    /// Inbound entry point for one envelope sent by `peer`.
    ///
    /// Calls are answered from a task spawned on the current Tokio runtime;
    /// invoked from a thread without one, only triggers are handled.
    pub fn process(&self, peer: &PeerId, raw: &str) {
        let core = &self.inner.core;
        let Some(envelope) = decode_or_log(core.codec.as_ref(), raw) else {
            return;
        };

        match envelope {
            Envelope::Request(req) => {
                trace!("Request {} ({}) from {}", req.name, req.id, peer);
                let info = CallInfo {
                    id: Some(req.id.clone()),
                    environment: req.origin(),
                    peer: Some(peer.clone()),
                    browser: None,
                };
                let server = self.clone();
                let peer = peer.clone();
                core.serve_request(req, info, move |resp| {
                    if let Err(e) = server.send(&peer, resp) {
                        debug!("Failed to answer {}: {}", peer, e);
                    }
                });
            }
            Envelope::Response(resp) => {
                // Unknown ids and responses from the wrong peer are dropped.
                core.pending.settle(&resp.id, Some(peer), resp.outcome);
            }
        }
    }

    fn send(&self, peer: &PeerId, envelope: impl Into<Envelope>) -> Result<()> {
        let payload = self.inner.core.encode(envelope)?;
        self.inner.transport.send_to_peer(peer, payload)
    }

    /// Peers currently connected, as reported by the transport.
    pub fn peers(&self) -> Vec<PeerId> {
        lock(&self.inner.peers).iter().cloned().collect()
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.core.pending.len()
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

    /// On the server this is a local call.
    pub async fn call_server(&self, name: &str, args: Value) -> Result<Value> {
        self.call(name, args).await
    }

    /// Call a procedure registered on one client.
    pub async fn call_client(&self, peer: &PeerId, name: &str, args: Value) -> Result<Value> {
        require_name("call_client", name)?;
        let core = &self.inner.core;
        let id = core.next_id();
        let rx = core.pending.insert(&id, Some(peer.clone()))?;
        if let Err(e) = self.send(peer, Request::call(&id, Environment::Server, name, args)) {
            core.pending.discard(&id);
            return Err(e);
        }
        wait_for(rx).await
    }

    /// Call whichever browser on `peer`'s client serves `name`.
    pub async fn call_browsers(&self, peer: &PeerId, name: &str, args: Value) -> Result<Value> {
        require_name("call_browsers", name)?;
        self.call_client(peer, ProtocolConfig::RELAY_CALL_BROWSERS, relay_args(name, &args))
            .await
    }

    pub fn trigger(&self, name: &str, args: Value) -> Result<()> {
        self.inner.core.trigger_local(name, args)
    }

    pub fn trigger_server(&self, name: &str, args: Value) -> Result<()> {
        self.trigger(name, args)
    }

    pub fn trigger_client(&self, peer: &PeerId, name: &str, args: Value) -> Result<()> {
        require_name("trigger_client", name)?;
        let id = self.inner.core.next_id();
        self.send(peer, Request::trigger(id, Environment::Server, name, args))
    }

    pub fn trigger_browsers(&self, peer: &PeerId, name: &str, args: Value) -> Result<()> {
        require_name("trigger_browsers", name)?;
        self.trigger_client(peer, ProtocolConfig::RELAY_TRIGGER_BROWSERS, relay_args(name, &args))
    }
}

fn require_peer(operation: &str, target: Option<Target>) -> Result<PeerId> {
    match target {
        Some(Target::Peer(peer)) => Ok(peer),
        _ => Err(RpcError::invalid_arguments(format!(
            "{operation} from the server expects a peer target, a name and optional args"
        ))),
    }
}

#[async_trait]
impl RpcContext for ServerContext {
    fn environment(&self) -> Environment {
        Environment::Server
    }

    fn register(&self, name: &str, handler: Arc<dyn Procedure>) -> Result<()> {
        ServerContext::register(self, name, handler)
    }

    fn unregister(&self, name: &str) -> Result<()> {
        ServerContext::unregister(self, name)
    }

    fn on(&self, name: &str, listener: Arc<dyn EventListener>) -> Result<ListenerId> {
        ServerContext::on(self, name, listener)
    }

    fn off(&self, name: &str, listener: ListenerId) -> Result<()> {
        ServerContext::off(self, name, listener)
    }

    async fn call(&self, name: &str, args: Value) -> Result<Value> {
        ServerContext::call(self, name, args).await
    }

    async fn call_server(&self, name: &str, args: Value) -> Result<Value> {
        ServerContext::call_server(self, name, args).await
    }

    async fn call_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<Value> {
        let peer = require_peer("call_client", target)?;
        ServerContext::call_client(self, &peer, name, args).await
    }

    async fn call_browsers(
        &self,
        target: Option<Target>,
        name: &str,
        args: Value,
    ) -> Result<Value> {
        let peer = require_peer("call_browsers", target)?;
        ServerContext::call_browsers(self, &peer, name, args).await
    }

    async fn call_browser(
        &self,
        _browser: Arc<dyn BrowserHandle>,
        _name: &str,
        _args: Value,
    ) -> Result<Value> {
        Err(RpcError::WrongEnvironment {
            operation: "call_browser",
            environment: Environment::Server,
        })
    }

    fn trigger(&self, name: &str, args: Value) -> Result<()> {
        ServerContext::trigger(self, name, args)
    }

    fn trigger_server(&self, name: &str, args: Value) -> Result<()> {
        ServerContext::trigger_server(self, name, args)
    }

    fn trigger_client(&self, target: Option<Target>, name: &str, args: Value) -> Result<()> {
        let peer = require_peer("trigger_client", target)?;
        ServerContext::trigger_client(self, &peer, name, args)
    }

    fn trigger_browsers(&self, target: Option<Target>, name: &str, args: Value) -> Result<()> {
        let peer = require_peer("trigger_browsers", target)?;
        ServerContext::trigger_browsers(self, &peer, name, args)
    }

    fn trigger_browser(
        &self,
        _browser: Arc<dyn BrowserHandle>,
        _name: &str,
        _args: Value,
    ) -> Result<()> {
        Err(RpcError::WrongEnvironment {
            operation: "trigger_browser",
            environment: Environment::Server,
        })
    }
}
