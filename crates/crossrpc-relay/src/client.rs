//! One-shot client commands against a running relay.

use anyhow::Context;
use crossrpc::transport::tcp::TcpClientTransport;
use crossrpc::ClientContext;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

async fn connect(addr: SocketAddr) -> anyhow::Result<ClientContext> {
    let (link, inbound) = TcpClientTransport::connect(addr).await?;
    let client = ClientContext::new(link, Vec::new());
    client.serve(inbound);
    Ok(client)
}

async fn call_with_timeout(client: &ClientContext, name: &str, args: Value) -> anyhow::Result<Value> {
    let result = tokio::time::timeout(CALL_TIMEOUT, client.call_server(name, args))
        .await
        .with_context(|| format!("no answer to {name} within {:?}", CALL_TIMEOUT))??;
    Ok(result)
}

/// Call `name` on the relay and return its result.
pub async fn call(addr: SocketAddr, name: &str, args: Value) -> anyhow::Result<Value> {
    let client = connect(addr).await?;
    call_with_timeout(&client, name, args).await
}

/// Trigger `name` on the relay.
pub async fn trigger(addr: SocketAddr, name: &str, args: Value) -> anyhow::Result<()> {
    let client = connect(addr).await?;
    client.trigger_server(name, args)?;

    // The server handles one connection in order, so once `ping` is answered
    // the trigger has been delivered.
    call_with_timeout(&client, "ping", Value::Null).await?;
    debug!("Trigger {} delivered", name);
    Ok(())
}
