//! Integration tests for the crossrpc-relay binary.
//!
//! These tests spawn the relay, discover its port from stdout, and drive it
//! both with a library client and with the binary's own `call` subcommand.

use crossrpc::transport::tcp::TcpClientTransport;
use crossrpc::{procedure, ClientContext};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

struct RelayHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl RelayHandle {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn relay_binary() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_crossrpc-relay") {
        return Ok(PathBuf::from(path));
    }

    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("crossrpc-relay");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_crossrpc-relay not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

/// Start the relay and wait for its `RPC_PORT=` line.
async fn start_relay() -> Result<RelayHandle, String> {
    let binary = relay_binary()?;

    let mut child = tokio::process::Command::new(&binary)
        .arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn crossrpc-relay: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read crossrpc-relay stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by crossrpc-relay".to_string())?;

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(RelayHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

async fn connect(addr: SocketAddr) -> ClientContext {
    let (link, inbound) = TcpClientTransport::connect(addr)
        .await
        .expect("Failed to connect to relay");
    let client = ClientContext::new(link, Vec::new());
    client.serve(inbound);
    client
}

async fn call(client: &ClientContext, name: &str, args: Value) -> crossrpc::Result<Value> {
    tokio::time::timeout(Duration::from_secs(10), client.call_server(name, args))
        .await
        .expect("call timed out")
}

/// Run `crossrpc-relay call` and return its stdout.
async fn run_call_command(addr: SocketAddr, name: &str, args: Option<&str>) -> (bool, String) {
    let mut command = tokio::process::Command::new(relay_binary().expect("relay binary"));
    command.arg("call").arg("--addr").arg(addr.to_string()).arg(name);
    if let Some(args) = args {
        command.arg(args);
    }
    let output = tokio::time::timeout(
        Duration::from_secs(20),
        command.stderr(Stdio::null()).output(),
    )
    .await
    .expect("call command timed out")
    .expect("Failed to run call command");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    )
}

#[tokio::test]
async fn test_builtin_procedures() {
    let relay = start_relay().await.expect("Failed to start relay");
    let client = connect(relay.addr()).await;

    assert_eq!(call(&client, "ping", Value::Null).await.unwrap(), json!("pong"));

    let nested = json!({"player": {"name": "ann", "items": [1, 2, {"k": null}]}});
    assert_eq!(call(&client, "echo", nested.clone()).await.unwrap(), nested);

    let peers = call(&client, "peers", Value::Null).await.unwrap();
    assert_eq!(peers.as_array().map(Vec::len), Some(1));

    relay.stop().await;
}

#[tokio::test]
async fn test_missing_procedure_is_not_found() {
    let relay = start_relay().await.expect("Failed to start relay");
    let client = connect(relay.addr()).await;

    let err = call(&client, "doesNotExist", Value::Null).await.unwrap_err();
    assert!(err.is_not_found());

    // The connection stays usable afterwards.
    assert_eq!(call(&client, "ping", Value::Null).await.unwrap(), json!("pong"));

    relay.stop().await;
}

#[tokio::test]
async fn test_peers_lists_each_connection() {
    let relay = start_relay().await.expect("Failed to start relay");
    let first = connect(relay.addr()).await;
    let second = connect(relay.addr()).await;

    // Both connections have issued a request, so both are tracked.
    call(&second, "ping", Value::Null).await.unwrap();
    let peers = call(&first, "peers", Value::Null).await.unwrap();
    assert_eq!(peers.as_array().map(Vec::len), Some(2));

    relay.stop().await;
}

#[tokio::test]
async fn test_client_procedures_stay_local() {
    let relay = start_relay().await.expect("Failed to start relay");
    let client = connect(relay.addr()).await;
    client
        .register("whoami", procedure(|_, _| async { Ok::<Value, Value>(json!("client")) }))
        .unwrap();

    assert_eq!(client.call("whoami", Value::Null).await.unwrap(), json!("client"));
    let err = call(&client, "whoami", Value::Null).await.unwrap_err();
    assert!(err.is_not_found());

    relay.stop().await;
}

#[tokio::test]
async fn test_call_command_prints_result() {
    let relay = start_relay().await.expect("Failed to start relay");

    let (ok, stdout) = run_call_command(relay.addr(), "echo", Some(r#"{"a":[1,2]}"#)).await;
    assert!(ok);
    let value: Value = serde_json::from_str(&stdout).expect("stdout is JSON");
    assert_eq!(value, json!({"a": [1, 2]}));

    let (ok, stdout) = run_call_command(relay.addr(), "ping", None).await;
    assert!(ok);
    assert_eq!(stdout, r#""pong""#);

    relay.stop().await;
}

#[tokio::test]
async fn test_call_command_fails_on_missing_procedure() {
    let relay = start_relay().await.expect("Failed to start relay");

    let (ok, stdout) = run_call_command(relay.addr(), "doesNotExist", None).await;
    assert!(!ok);
    assert!(stdout.is_empty());

    relay.stop().await;
}
