//! TCP adapter for the server <-> client hop.
//!
//! Every accepted connection becomes one [`PeerId`]. Envelopes travel as
//! length-prefixed frames (see [`super::frame`]). Each connection has a reader
//! task feeding the server's inbound queue and a writer task draining an
//! unbounded outbound queue, so [`ServerTransport::send_to_peer`] never
//! blocks.
//!
//! # Thread Safety
//!
//! The connection table is a short-held `std::sync::Mutex`; nothing awaits
//! while holding it.

use super::frame::{read_frame, write_frame};
use super::{ClientInbound, ClientTransport, PeerId, ServerInbound, ServerTransport};
use crate::config::{ProtocolConfig, TransportConfig};
use crate::util::lock;
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Server side of the TCP adapter: routes payloads to connected peers.
#[derive(Default)]
pub struct TcpServerTransport {
    connections: Mutex<HashMap<PeerId, mpsc::UnboundedSender<String>>>,
}

impl TcpServerTransport {
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }
}

impl ServerTransport for TcpServerTransport {
    fn send_to_peer(&self, peer: &PeerId, payload: String) -> Result<()> {
        let connections = lock(&self.connections);
        let outbound = connections.get(peer).ok_or_else(|| RpcError::Transport {
            message: format!("peer {} is not connected", peer),
        })?;
        outbound.send(payload).map_err(|_| RpcError::Transport {
            message: format!("connection to {} is closing", peer),
        })
    }
}

/// Handle to a running listener. Dropping it shuts the listener down.
pub struct TcpServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TcpServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections and close every open one.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for TcpServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// A bound listener: the transport to give to a
/// [`ServerContext`](crate::ServerContext), the inbound queue to
/// [`serve`](crate::ServerContext::serve), and the shutdown handle.
pub struct TcpServer {
    pub transport: Arc<TcpServerTransport>,
    pub inbound: mpsc::UnboundedReceiver<ServerInbound>,
    pub handle: TcpServerHandle,
}

impl TcpServer {
    /// Bind and start accepting in background tasks.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Listening on {}", addr);

        let transport = Arc::new(TcpServerTransport::default());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            transport.clone(),
            inbound_tx,
            shutdown_rx,
            conn_shutdown_rx,
        ));

        Ok(Self {
            transport,
            inbound,
            handle: TcpServerHandle {
                addr,
                port: addr.port(),
                shutdown_tx: Some(shutdown_tx),
                conn_shutdown_tx,
                task_handle: Some(task_handle),
            },
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        transport: Arc<TcpServerTransport>,
        inbound: mpsc::UnboundedSender<ServerInbound>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let active_connections = Arc::new(AtomicUsize::new(0));
        let next_peer = AtomicU64::new(1);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= TransportConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    TransportConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            let peer = PeerId::new(format!(
                                "peer-{}",
                                next_peer.fetch_add(1, Ordering::Relaxed)
                            ));
                            debug!("Connection {} from {}", peer, peer_addr);

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let conns = active_connections.clone();
                            let transport = transport.clone();
                            let inbound = inbound.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                Self::handle_connection(stream, peer, &transport, &inbound, conn_shutdown).await;
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer: PeerId,
        transport: &TcpServerTransport,
        inbound: &mpsc::UnboundedSender<ServerInbound>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let (mut reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        lock(&transport.connections).insert(peer.clone(), outbound_tx);
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));

        let _ = inbound.send(ServerInbound::Connected(peer.clone()));

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => result,
                _ = shutdown_rx.changed() => break,
            };
            match frame {
                Ok(Some(payload)) => {
                    if inbound.send(ServerInbound::Message(peer.clone(), payload)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Connection {} ended: {}", peer, e);
                    break;
                }
            }
        }

        lock(&transport.connections).remove(&peer);
        writer_task.abort();
        debug!("Connection {} closed", peer);
        let _ = inbound.send(ServerInbound::Disconnected(peer));
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<String>) {
    while let Some(payload) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &payload).await {
            debug!("Write failed: {}", e);
            break;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::UnboundedSender<ClientInbound>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(payload)) => {
                let item = ClientInbound::new(ProtocolConfig::PROCESS_EVENT, payload);
                if inbound.send(item).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Server connection ended: {}", e);
                break;
            }
        }
    }
    debug!("Server connection closed");
}

/// Client side of the TCP adapter.
pub struct TcpClientTransport {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
}

impl TcpClientTransport {
    /// Connect to a server. Everything the server sends arrives on the
    /// returned queue under the `__rpc:process` channel; the queue closes
    /// when the connection does.
    pub async fn connect(
        addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ClientInbound>)> {
        let stream = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Transport {
                message: format!("timed out connecting to {}", addr),
            })?
            .map_err(|e| RpcError::Transport {
                message: format!("failed to connect to {}: {}", addr, e),
            })?;
        debug!("Connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, inbound_tx));

        Ok((Arc::new(Self { addr, outbound }), inbound))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl ClientTransport for TcpClientTransport {
    fn send_to_server(&self, payload: String) -> Result<()> {
        self.outbound.send(payload).map_err(|_| RpcError::Transport {
            message: format!("connection to {} is closed", self.addr),
        })
    }
}
