//! End-to-end tests wiring a server, clients and browser surfaces together
//! with the in-process transport.

use crossrpc::transport::memory::{MemoryBrowser, MemoryServerTransport};
use crossrpc::{
    listener, procedure, BrowserContext, BrowserHandle, CallInfo, ClientContext, Environment,
    PeerId, RpcContext, RpcError, RpcOptions, SequentialIdGenerator, ServerContext, Target,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn start_server(options: RpcOptions) -> (ServerContext, Arc<MemoryServerTransport>) {
    let (link, inbound) = MemoryServerTransport::new();
    let server = ServerContext::with_options(link.clone(), options);
    server.serve(inbound);
    (server, link)
}

/// One connected client hosting browser surfaces that all have the runtime
/// loaded.
struct Player {
    peer: PeerId,
    client: ClientContext,
    browsers: Vec<Arc<MemoryBrowser>>,
    runtimes: Vec<BrowserContext>,
}

impl Player {
    fn join(link: &MemoryServerTransport, peer: &str, browser_count: usize) -> Self {
        let endpoint = link.connect(peer);
        let browsers: Vec<Arc<MemoryBrowser>> =
            (0..browser_count).map(|_| endpoint.browser()).collect();
        let handles: Vec<Arc<dyn BrowserHandle>> = browsers
            .iter()
            .map(|b| b.clone() as Arc<dyn BrowserHandle>)
            .collect();

        let client = ClientContext::new(endpoint.transport.clone(), handles);
        client.serve(endpoint.inbound);
        let runtimes = browsers.iter().map(|b| b.load_runtime()).collect();

        Self {
            peer: PeerId::new(peer),
            client,
            browsers,
            runtimes,
        }
    }

    fn runtime(&self) -> &BrowserContext {
        &self.runtimes[0]
    }

    async fn wait_owner(&self, name: &str, index: usize) {
        let expected = self.runtimes[index].identity();
        eventually(|| self.client.browser_owner(name) == expected).await;
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation timed out")
}

fn add() -> Arc<dyn crossrpc::Procedure> {
    procedure(|args: Value, _| async move {
        let sum: i64 = args
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_i64).sum())
            .unwrap_or(0);
        Ok::<Value, Value>(json!(sum))
    })
}

fn origin_reporter(value: Value) -> Arc<dyn crossrpc::Procedure> {
    procedure(move |_, info: CallInfo| {
        let value = value.clone();
        async move {
            Ok::<Value, Value>(json!({
                "value": value,
                "origin": info.environment.as_str(),
            }))
        }
    })
}

fn counter(hits: &Arc<AtomicUsize>) -> Arc<dyn crossrpc::EventListener> {
    let hits = hits.clone();
    listener(move |_, _| {
        hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[tokio::test]
async fn test_client_calls_server_procedure() {
    let (server, link) = start_server(RpcOptions::default());
    server.register("add", add()).unwrap();
    let player = Player::join(&link, "p1", 0);

    let result = within(player.client.call_server("add", json!([2, 3]))).await;
    assert_eq!(result.unwrap(), json!(5));
    assert_eq!(player.client.pending_count(), 0);
}

#[tokio::test]
async fn test_client_calls_missing_server_procedure() {
    let (_server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 0);

    let err = within(player.client.call_server("missing", json!([])))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "Expected not found, got: {:?}", err);
}

#[tokio::test]
async fn test_concurrent_calls_settle_out_of_order() {
    const CALLS: usize = 5;
    let (server, link) = start_server(RpcOptions::default());
    let gates: Arc<Vec<Notify>> = Arc::new((0..CALLS).map(|_| Notify::new()).collect());
    let waiting = gates.clone();
    server
        .register(
            "echo_after",
            procedure(move |args: Value, _| {
                let gates = waiting.clone();
                async move {
                    let k = args.as_u64().unwrap_or_default() as usize;
                    gates[k].notified().await;
                    Ok::<Value, Value>(json!(k))
                }
            }),
        )
        .unwrap();
    let player = Player::join(&link, "p1", 0);

    let calls: Vec<_> = (0..CALLS)
        .map(|k| {
            let client = player.client.clone();
            tokio::spawn(async move { client.call_server("echo_after", json!(k)).await })
        })
        .collect();
    eventually(|| player.client.pending_count() == CALLS).await;

    for (k, call) in calls.into_iter().enumerate().rev() {
        gates[k].notify_one();
        let result = within(call).await.unwrap();
        assert_eq!(result.unwrap(), json!(k));
    }
    assert_eq!(player.client.pending_count(), 0);
}

#[tokio::test]
async fn test_response_from_wrong_peer_is_ignored() {
    let options = RpcOptions::default().with_ids(Arc::new(SequentialIdGenerator::new("srv-")));
    let (server, link) = start_server(options);
    let x = Player::join(&link, "x", 0);
    let forger = link.connect("y");

    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    x.client
        .register(
            "ping",
            procedure(move |_, _| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok::<Value, Value>(json!("pong"))
                }
            }),
        )
        .unwrap();

    let caller = server.clone();
    let peer = x.peer.clone();
    let call = tokio::spawn(async move { caller.call_client(&peer, "ping", Value::Null).await });
    eventually(|| server.pending_count() == 1).await;

    use crossrpc::ClientTransport;
    forger
        .transport
        .send_to_server(r#"{"ret":1,"id":"srv-1","env":"client","res":"forged"}"#.to_string())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());
    assert_eq!(server.pending_count(), 1);

    release.notify_one();
    let result = within(call).await.unwrap();
    assert_eq!(result.unwrap(), json!("pong"));
    assert_eq!(server.pending_count(), 0);
}

#[tokio::test]
async fn test_client_calls_browser_registered_procedure() {
    let (_server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);

    player
        .runtime()
        .register("getState", procedure(|_, _| async { Ok::<Value, Value>(json!({"hp": 100})) }))
        .unwrap();
    player.wait_owner("getState", 0).await;

    let result = within(player.client.call_browsers("getState", Value::Null)).await;
    assert_eq!(result.unwrap(), json!({"hp": 100}));
}

#[tokio::test]
async fn test_server_calls_browser_through_client() {
    let (server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);
    player
        .runtime()
        .register("getState", origin_reporter(json!("ready")))
        .unwrap();
    player.wait_owner("getState", 0).await;

    let result = within(server.call_browsers(&player.peer, "getState", Value::Null)).await;
    assert_eq!(result.unwrap(), json!({"value": "ready", "origin": "server"}));

    let err = within(server.call_browsers(&player.peer, "unclaimed", Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_browser_calls_server_through_client() {
    let (server, link) = start_server(RpcOptions::default());
    server.register("whoami", origin_reporter(json!(1))).unwrap();
    server.register("add", add()).unwrap();
    let player = Player::join(&link, "p1", 1);

    let result = within(player.runtime().call_server("add", json!([2, 3]))).await;
    assert_eq!(result.unwrap(), json!(5));

    let result = within(player.runtime().call_server("whoami", Value::Null)).await;
    assert_eq!(result.unwrap(), json!({"value": 1, "origin": "browser-surface"}));

    let err = within(player.runtime().call_server("missing", Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_browser_calls_its_client() {
    let (_server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);
    player
        .client
        .register(
            "getPos",
            procedure(|_, info: CallInfo| async move {
                Ok::<Value, Value>(json!({"from_browser": info.browser.is_some()}))
            }),
        )
        .unwrap();

    let result = within(player.runtime().call_client("getPos", Value::Null)).await;
    assert_eq!(result.unwrap(), json!({"from_browser": true}));
}

#[tokio::test]
async fn test_browsers_call_each_other_through_client() {
    let (_server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 2);
    player.runtimes[1].register("peek", add()).unwrap();
    player.wait_owner("peek", 1).await;

    let result = within(player.runtimes[0].call_browsers("peek", json!([4, 5]))).await;
    assert_eq!(result.unwrap(), json!(9));
}

#[tokio::test]
async fn test_triggers_reach_every_context() {
    let (server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);

    let on_server = Arc::new(AtomicUsize::new(0));
    let on_client = Arc::new(AtomicUsize::new(0));
    let on_browser = Arc::new(AtomicUsize::new(0));
    server.on("tick", counter(&on_server)).unwrap();
    player.client.on("tick", counter(&on_client)).unwrap();
    player.runtime().on("flash", counter(&on_browser)).unwrap();
    player.wait_owner("flash", 0).await;

    player.client.trigger_server("tick", Value::Null).unwrap();
    player.runtime().trigger_server("tick", Value::Null).unwrap();
    eventually(|| on_server.load(Ordering::SeqCst) == 2).await;

    server.trigger_client(&player.peer, "tick", Value::Null).unwrap();
    player.runtime().trigger_client("tick", Value::Null).unwrap();
    eventually(|| on_client.load(Ordering::SeqCst) == 2).await;

    server.trigger_browsers(&player.peer, "flash", json!({"color": "red"})).unwrap();
    player.client.trigger_browsers("flash", Value::Null).unwrap();
    eventually(|| on_browser.load(Ordering::SeqCst) == 2).await;

    // Nothing was ever waiting for an answer.
    assert_eq!(server.pending_count(), 0);
    assert_eq!(player.client.pending_count(), 0);
}

#[tokio::test]
async fn test_trigger_fan_out_isolates_failing_listeners() {
    let (server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 0);

    let hits = Arc::new(AtomicUsize::new(0));
    server.on("spawn", counter(&hits)).unwrap();
    server
        .on("spawn", listener(|_, _| Err(json!("listener failed"))))
        .unwrap();
    server
        .on("spawn", listener(|_, _| panic!("listener panicked")))
        .unwrap();
    server.on("spawn", counter(&hits)).unwrap();

    player.client.trigger_server("spawn", json!([1])).unwrap();
    eventually(|| hits.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test]
async fn test_not_found_is_uniform_across_call_family() {
    let (server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);

    let errors: Vec<RpcError> = vec![
        server.call("nope", Value::Null).await.unwrap_err(),
        within(player.client.call_server("nope", Value::Null)).await.unwrap_err(),
        within(server.call_client(&player.peer, "nope", Value::Null)).await.unwrap_err(),
        within(player.client.call_browsers("nope", Value::Null)).await.unwrap_err(),
        within(player.runtime().call_client("nope", Value::Null)).await.unwrap_err(),
        within(player.runtime().call_browsers("nope", Value::Null)).await.unwrap_err(),
    ];
    for err in errors {
        assert!(err.is_not_found(), "Expected not found, got: {:?}", err);
        assert_eq!(err.to_string(), "PROCEDURE_NOT_FOUND");
    }
}

#[tokio::test]
async fn test_browser_without_runtime_answers_not_found() {
    let (_server, link) = start_server(RpcOptions::default());
    let endpoint = link.connect("p1");
    let bare = endpoint.browser();
    let client = ClientContext::new(endpoint.transport.clone(), vec![bare.clone() as Arc<dyn BrowserHandle>]);
    client.serve(endpoint.inbound);

    let err = within(client.call_browser(&*bare, "anything", Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_closed_browser_counts_as_not_found() {
    let (_server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);
    player.runtime().register("getState", add()).unwrap();
    player.wait_owner("getState", 0).await;

    player.browsers[0].close();
    let err = within(player.client.call_browsers("getState", Value::Null))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(player.client.trigger_browsers("getState", Value::Null).unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_last_registering_browser_owns_name() {
    let (_server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 2);

    player.runtimes[0].register("x", origin_reporter(json!("first"))).unwrap();
    player.wait_owner("x", 0).await;
    player.runtimes[1].register("x", origin_reporter(json!("second"))).unwrap();
    player.wait_owner("x", 1).await;

    // A stale unregister from the previous owner changes nothing.
    player.runtimes[0].unregister("x").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = within(player.client.call_browsers("x", Value::Null)).await;
    assert_eq!(result.unwrap(), json!({"value": "second", "origin": "client"}));

    player.runtimes[1].unregister("x").unwrap();
    eventually(|| player.client.browser_owner("x").is_none()).await;
}

#[tokio::test]
async fn test_recreated_browser_gets_fresh_identity() {
    let (_server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);
    let browser = &player.browsers[0];
    let first = player.runtime().identity().unwrap();

    browser.navigate();
    let handle: Arc<dyn BrowserHandle> = browser.clone();
    let second = player.client.browser_created(handle);
    let runtime = browser.load_runtime();

    assert_ne!(first, second);
    assert_eq!(runtime.identity(), Some(second.clone()));
    assert!(player.client.directory().live(&first).is_none());
    assert_eq!(player.client.directory().browser_count(), 1);

    runtime.register("again", add()).unwrap();
    eventually(|| player.client.browser_owner("again") == Some(second.clone())).await;
    let result = within(player.client.call_browsers("again", json!([1, 1]))).await;
    assert_eq!(result.unwrap(), json!(2));
}

#[tokio::test]
async fn test_nested_payloads_survive_every_hop() {
    let (server, link) = start_server(RpcOptions::default());
    server
        .register("echo", procedure(|args: Value, _| async move { Ok::<Value, Value>(args) }))
        .unwrap();
    let player = Player::join(&link, "p1", 1);

    let payload = json!({
        "list": [1, 2.5, "three", null, {"deep": [true, false]}],
        "quote": "it's \"quoted\" \\ and\nmultiline \u{2028}",
        "empty": {},
    });
    let result = within(player.runtime().call_server("echo", payload.clone())).await;
    assert_eq!(result.unwrap(), payload);
}

#[tokio::test]
async fn test_remote_failure_payload_is_verbatim() {
    let (server, link) = start_server(RpcOptions::default());
    server
        .register(
            "fail",
            procedure(|_, _| async { Err::<Value, Value>(json!({"reason": "denied", "code": 403})) }),
        )
        .unwrap();
    let player = Player::join(&link, "p1", 0);

    match within(player.client.call_server("fail", Value::Null)).await {
        Err(RpcError::Remote(payload)) => {
            assert_eq!(payload, json!({"reason": "denied", "code": 403}))
        }
        other => panic!("Expected Remote, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_server_tracks_connected_peers() {
    let (server, link) = start_server(RpcOptions::default());
    let _a = Player::join(&link, "a", 0);
    let _b = Player::join(&link, "b", 0);
    eventually(|| server.peers().len() == 2).await;

    link.disconnect(&PeerId::new("a"));
    eventually(|| server.peers() == vec![PeerId::new("b")]).await;

    let err = within(server.call_client(&PeerId::new("a"), "ping", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Transport { .. }));
    assert_eq!(server.pending_count(), 0);
}

#[tokio::test]
async fn test_uniform_surface_across_environments() {
    let (server, link) = start_server(RpcOptions::default());
    let player = Player::join(&link, "p1", 1);
    server.register("add", add()).unwrap();

    let contexts: Vec<Arc<dyn RpcContext>> = vec![
        Arc::new(server.clone()),
        Arc::new(player.client.clone()),
        Arc::new(player.runtime().clone()),
    ];
    let environments: Vec<Environment> = contexts.iter().map(|c| c.environment()).collect();
    assert_eq!(
        environments,
        vec![Environment::Server, Environment::Client, Environment::Browser]
    );

    for ctx in &contexts {
        let result = within(ctx.call_server("add", json!([20, 22]))).await;
        assert_eq!(result.unwrap(), json!(42));
    }

    let handle: Arc<dyn BrowserHandle> = player.browsers[0].clone();
    assert!(matches!(
        contexts[0].call_browser(handle.clone(), "x", Value::Null).await,
        Err(RpcError::WrongEnvironment { .. })
    ));
    assert!(matches!(
        contexts[2].trigger_browser(handle, "x", Value::Null),
        Err(RpcError::WrongEnvironment { .. })
    ));

    let target = Target::Peer(player.peer.clone());
    let result = within(contexts[0].call_client(Some(target), "nope", Value::Null)).await;
    assert!(result.unwrap_err().is_not_found());
    assert!(matches!(
        contexts[1].call_client(Some(Target::Peer(player.peer.clone())), "x", Value::Null).await,
        Err(RpcError::InvalidArguments { .. })
    ));
}
