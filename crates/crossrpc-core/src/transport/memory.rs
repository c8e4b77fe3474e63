//! In-process adapter.
//!
//! Wires one server, any number of clients and their browser surfaces
//! together with unbounded FIFO channels. Used by the test suites and by
//! hosts that embed every context in one process.
//!
//! ```ignore
//! let (server_link, server_inbound) = MemoryServerTransport::new();
//! let server = ServerContext::new(server_link.clone());
//! server.serve(server_inbound);
//!
//! let endpoint = server_link.connect("peer-1");
//! let browser = endpoint.browser();
//! let client = ClientContext::new(endpoint.transport.clone(), vec![browser.clone() as _]);
//! client.serve(endpoint.inbound);
//! let runtime = browser.load_runtime();
//! ```

use super::{
    BrowserHandle, BrowserTransport, ClientInbound, ClientTransport, PeerId, ServerInbound,
    ServerTransport,
};
use crate::config::ProtocolConfig;
use crate::context::BrowserContext;
use crate::script;
use crate::util::lock;
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Server end of the in-process wiring.
pub struct MemoryServerTransport {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<ClientInbound>>>,
    inbound: mpsc::UnboundedSender<ServerInbound>,
}

impl MemoryServerTransport {
    /// Create the server end and the inbound queue to feed to
    /// [`ServerContext::serve`](crate::ServerContext::serve).
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerInbound>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            inbound,
        });
        (transport, inbound_rx)
    }

    /// Attach a new client under `peer`.
    pub fn connect(&self, peer: impl Into<PeerId>) -> MemoryClientEndpoint {
        let peer = peer.into();
        let (sender, inbound) = mpsc::unbounded_channel();
        lock(&self.peers).insert(peer.clone(), sender.clone());
        let _ = self.inbound.send(ServerInbound::Connected(peer.clone()));
        debug!("Memory peer {} connected", peer);

        MemoryClientEndpoint {
            transport: Arc::new(MemoryClientTransport {
                peer,
                to_server: self.inbound.clone(),
            }),
            inbound,
            to_client: sender,
        }
    }

    /// Detach `peer`. Later sends to it fail.
    pub fn disconnect(&self, peer: &PeerId) {
        if lock(&self.peers).remove(peer).is_some() {
            debug!("Memory peer {} disconnected", peer);
            let _ = self.inbound.send(ServerInbound::Disconnected(peer.clone()));
        }
    }
}

impl ServerTransport for MemoryServerTransport {
    fn send_to_peer(&self, peer: &PeerId, payload: String) -> Result<()> {
        let peers = lock(&self.peers);
        let sender = peers.get(peer).ok_or_else(|| RpcError::Transport {
            message: format!("peer {} is not connected", peer),
        })?;
        sender
            .send(ClientInbound::new(ProtocolConfig::PROCESS_EVENT, payload))
            .map_err(|_| RpcError::Transport {
                message: format!("peer {} stopped receiving", peer),
            })
    }
}

/// Client end of the in-process wiring.
pub struct MemoryClientTransport {
    peer: PeerId,
    to_server: mpsc::UnboundedSender<ServerInbound>,
}

impl MemoryClientTransport {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }
}

impl ClientTransport for MemoryClientTransport {
    fn send_to_server(&self, payload: String) -> Result<()> {
        self.to_server
            .send(ServerInbound::Message(self.peer.clone(), payload))
            .map_err(|_| RpcError::Transport {
                message: "server stopped receiving".to_string(),
            })
    }
}

/// Everything a client needs from [`MemoryServerTransport::connect`].
pub struct MemoryClientEndpoint {
    pub transport: Arc<MemoryClientTransport>,
    /// Feed to [`ClientContext::serve`](crate::ClientContext::serve).
    pub inbound: mpsc::UnboundedReceiver<ClientInbound>,
    /// The queue hosted browsers post to. Still usable after `inbound` has
    /// been moved out, via [`MemoryBrowser::new`].
    pub to_client: mpsc::UnboundedSender<ClientInbound>,
}

impl MemoryClientEndpoint {
    /// A new browser surface hosted by this client, with no runtime loaded.
    pub fn browser(&self) -> Arc<MemoryBrowser> {
        MemoryBrowser::new(self.to_client.clone())
    }
}

/// Browser end of the in-process wiring: posts onto the client's queue.
pub struct MemoryBrowserTransport {
    to_client: mpsc::UnboundedSender<ClientInbound>,
}

impl MemoryBrowserTransport {
    pub fn new(to_client: mpsc::UnboundedSender<ClientInbound>) -> Self {
        Self { to_client }
    }
}

impl BrowserTransport for MemoryBrowserTransport {
    fn send_to_client(&self, channel: &str, payload: String) -> Result<()> {
        self.to_client
            .send(ClientInbound::new(channel, payload))
            .map_err(|_| RpcError::Transport {
                message: "client stopped receiving".to_string(),
            })
    }
}

#[derive(Default)]
struct Surface {
    /// Identity delivered by the first bootstrap since the last navigation.
    identity: Option<String>,
    runtime: Option<BrowserContext>,
}

/// A browser surface that interprets the scripts its client executes.
///
/// Bootstrap scripts deliver the identity. Dispatch scripts go to the loaded
/// [`BrowserContext`], or, with no runtime loaded, produce the not-found
/// reply the script carries.
pub struct MemoryBrowser {
    to_client: mpsc::UnboundedSender<ClientInbound>,
    surface: Mutex<Surface>,
    alive: AtomicBool,
}

impl MemoryBrowser {
    pub fn new(to_client: mpsc::UnboundedSender<ClientInbound>) -> Arc<Self> {
        Arc::new(Self {
            to_client,
            surface: Mutex::new(Surface::default()),
            alive: AtomicBool::new(true),
        })
    }

    /// Start the browser runtime, the way a page loading the library would.
    /// An identity already delivered is picked up immediately.
    pub fn load_runtime(&self) -> BrowserContext {
        let runtime = BrowserContext::new(Arc::new(MemoryBrowserTransport::new(
            self.to_client.clone(),
        )));
        let identity = {
            let mut surface = lock(&self.surface);
            surface.runtime = Some(runtime.clone());
            surface.identity.clone()
        };
        if let Some(id) = identity {
            runtime.assign_identity(&id);
        }
        runtime
    }

    pub fn runtime(&self) -> Option<BrowserContext> {
        lock(&self.surface).runtime.clone()
    }

    /// Drop the page state: runtime and identity are gone until the client
    /// bootstraps the surface again.
    pub fn navigate(&self) {
        *lock(&self.surface) = Surface::default();
    }

    /// Destroy the surface. The handle stays around but is no longer valid.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        *lock(&self.surface) = Surface::default();
    }

    fn bootstrap(&self, id: String) {
        let runtime = {
            let mut surface = lock(&self.surface);
            if surface.identity.is_some() {
                // The identity promise only resolves once.
                return;
            }
            surface.identity = Some(id.clone());
            surface.runtime.clone()
        };
        if let Some(runtime) = runtime {
            runtime.assign_identity(&id);
        }
    }

    fn dispatch(&self, dispatch: script::DispatchScript) {
        match self.runtime() {
            Some(runtime) => runtime.process(&dispatch.payload),
            None => {
                if let Some(reply) = dispatch.not_found_reply {
                    let _ = self
                        .to_client
                        .send(ClientInbound::new(ProtocolConfig::PROCESS_EVENT, reply));
                }
            }
        }
    }
}

impl BrowserHandle for MemoryBrowser {
    fn execute(&self, code: &str) {
        if !self.is_valid() {
            return;
        }
        if let Some(id) = script::parse_bootstrap(code) {
            trace!("Bootstrap script for {}", id);
            self.bootstrap(id);
        } else if let Some(dispatch) = script::parse_dispatch(code) {
            self.dispatch(dispatch);
        } else {
            debug!("Ignoring unrecognised script");
        }
    }

    fn is_valid(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
