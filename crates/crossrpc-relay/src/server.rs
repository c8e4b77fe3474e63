//! Relay server: a server context on a TCP listener with built-in procedures.

use crossrpc::transport::tcp::{TcpServer, TcpServerHandle};
use crossrpc::{procedure, ServerContext};
use serde_json::{json, Value};
use tracing::info;

const BUILTINS: [&str; 3] = ["ping", "echo", "peers"];

/// A running relay.
pub struct Relay {
    pub server: ServerContext,
    pub handle: TcpServerHandle,
}

/// Bind the relay and register its built-in procedures.
///
/// - `ping` -> `"pong"`
/// - `echo` -> its arguments
/// - `peers` -> ids of the connected clients
pub async fn start_relay(host: &str, port: u16) -> anyhow::Result<Relay> {
    let TcpServer {
        transport,
        inbound,
        handle,
    } = TcpServer::bind((host, port)).await?;

    let server = ServerContext::new(transport);
    register_builtins(&server)?;
    server.serve(inbound);
    info!("Relay procedures registered: {}", BUILTINS.join(", "));

    Ok(Relay { server, handle })
}

fn register_builtins(server: &ServerContext) -> crossrpc::Result<()> {
    server.register(
        "ping",
        procedure(|_, _| async { Ok::<Value, Value>(json!("pong")) }),
    )?;

    server.register(
        "echo",
        procedure(|args: Value, _| async move { Ok::<Value, Value>(args) }),
    )?;

    let peers_of = server.clone();
    server.register(
        "peers",
        procedure(move |_, _| {
            let peers: Vec<String> = peers_of.peers().iter().map(ToString::to_string).collect();
            async move { Ok::<Value, Value>(json!(peers)) }
        }),
    )?;

    Ok(())
}
