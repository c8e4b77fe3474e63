//! Server <-> client traffic over the TCP adapter.

use crossrpc::transport::memory::MemoryBrowser;
use crossrpc::transport::tcp::{TcpClientTransport, TcpServer, TcpServerHandle};
use crossrpc::{procedure, BrowserHandle, ClientContext, PeerId, ServerContext};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation timed out")
}

async fn start_server() -> (ServerContext, TcpServerHandle) {
    let TcpServer {
        transport,
        inbound,
        handle,
    } = TcpServer::bind("127.0.0.1:0").await.unwrap();
    let server = ServerContext::new(transport);
    server.serve(inbound);
    server
        .register(
            "add",
            procedure(|args: Value, _| async move {
                let sum: i64 = args
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok::<Value, Value>(json!(sum))
            }),
        )
        .unwrap();
    (server, handle)
}

async fn only_peer(server: &ServerContext) -> PeerId {
    for _ in 0..500 {
        if let Some(peer) = server.peers().into_iter().next() {
            return peer;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no peer connected");
}

#[tokio::test]
async fn test_calls_in_both_directions() {
    let (server, mut handle) = start_server().await;
    let (link, inbound) = TcpClientTransport::connect(handle.addr()).await.unwrap();
    let client = ClientContext::new(link, Vec::new());
    client.serve(inbound);
    client
        .register("ping", procedure(|_, _| async { Ok::<Value, Value>(json!("pong")) }))
        .unwrap();

    let result = within(client.call_server("add", json!([2, 3]))).await;
    assert_eq!(result.unwrap(), json!(5));

    let peer = only_peer(&server).await;
    let result = within(server.call_client(&peer, "ping", Value::Null)).await;
    assert_eq!(result.unwrap(), json!("pong"));

    let err = within(client.call_server("missing", Value::Null)).await.unwrap_err();
    assert!(err.is_not_found());

    handle.shutdown();
}

#[tokio::test]
async fn test_server_reaches_browser_hosted_by_tcp_client() {
    let (server, mut handle) = start_server().await;
    let (link, inbound) = TcpClientTransport::connect(handle.addr()).await.unwrap();

    // Browsers post on their own queue; the client pumps both.
    let (to_client, from_browsers) = mpsc::unbounded_channel();
    let browser = MemoryBrowser::new(to_client);
    let client = ClientContext::new(link, vec![browser.clone() as Arc<dyn BrowserHandle>]);
    client.serve(inbound);
    client.serve(from_browsers);

    let runtime = browser.load_runtime();
    runtime
        .register("getState", procedure(|_, _| async { Ok::<Value, Value>(json!({"hp": 7})) }))
        .unwrap();
    for _ in 0..500 {
        if client.browser_owner("getState").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let peer = only_peer(&server).await;
    let result = within(server.call_browsers(&peer, "getState", Value::Null)).await;
    assert_eq!(result.unwrap(), json!({"hp": 7}));

    let result = within(runtime.call_server("add", json!([1, 2, 3]))).await;
    assert_eq!(result.unwrap(), json!(6));

    handle.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_client_inbound() {
    let (server, mut handle) = start_server().await;
    let (link, inbound) = TcpClientTransport::connect(handle.addr()).await.unwrap();
    let client = ClientContext::new(link, Vec::new());
    let pump = client.serve(inbound);
    only_peer(&server).await;

    handle.shutdown();
    within(pump).await.unwrap();

    for _ in 0..500 {
        if server.peers().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer still tracked after shutdown");
}
