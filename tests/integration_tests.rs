//! End-to-end integration tests: WebSocket connection, principal handshake
//! and full session/servant cycles through the running Keel server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use keel_acquire::{
    BroadcastAccept, DirectoryPoll, InMemoryBus, InMemoryJobStore, LocalProcessor, MessageBus,
    StaticDiscovery, WorkerHandle,
};
use keel_protocol::AuthConfig;
use keel_server::{BundledServices, RpcServer, ServerConfig, ServiceCatalog, SessionManager};
use keel_services::config::ConfigService;
use keel_transport::{TransportConfig, TransportServer};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    port: u16,
    token: String,
    server: Arc<RpcServer>,
}

/// Start the full stack on a random port. One local processor owned by user
/// 1 answers `acquireProcessor`; RawFile servants read under a temp dir
/// holding `hello.txt`.
async fn start_test_server() -> TestServer {
    let root = Box::leak(Box::new(TempDir::new().unwrap())).path().to_path_buf();
    std::fs::write(root.join("hello.txt"), b"hello, keel").unwrap();

    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    let processors = Arc::new(BroadcastAccept::new(
        bus.clone(),
        Arc::new(InMemoryJobStore::new()),
        Duration::from_secs(2),
    ));
    let handle = WorkerHandle {
        worker_id: "w-1".into(),
        endpoint: "inproc://w-1".into(),
    };
    LocalProcessor::new(handle, 1).spawn(bus);

    let catalog = ServiceCatalog::bundled(BundledServices {
        settings: ConfigService::shared_defaults(),
        file_root: root,
        processors,
        resources: Arc::new(DirectoryPoll::new(Arc::new(StaticDiscovery::new()))),
    });
    let config = ServerConfig {
        pool_size: 4,
        queue_depth: 32,
        ..ServerConfig::default()
    };
    let server = Arc::new(RpcServer::new(SessionManager::new(config, catalog)));
    server.initialize();

    let token = format!("test-token-{}", std::process::id());
    let transport_config = TransportConfig {
        port: 0,
        auth: Some(AuthConfig {
            token: token.clone(),
            handshake_timeout_ms: 5000,
        }),
        max_connections: Some(16),
        ..TransportConfig::default()
    };
    let transport = TransportServer::start(transport_config, server.clone()).await.unwrap();
    let port = transport.port();

    // Leak the transport to keep it running for the test
    Box::leak(Box::new(transport));

    TestServer {
        port,
        token,
        server,
    }
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Read until the response to `id`, returning it with any notifications
/// that arrived first.
async fn recv_response(ws: &mut Ws, id: i64) -> (Value, Vec<Value>) {
    let mut notifications = Vec::new();
    loop {
        let msg = recv_json(ws).await;
        if msg["id"] == id {
            return (msg, notifications);
        }
        notifications.push(msg);
    }
}

async fn connect_as(server: &TestServer, user: &str, user_id: i64, session: &str) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws", server.port))
        .await
        .expect("Failed to connect");

    let required = recv_json(&mut ws).await;
    assert_eq!(required["method"], "auth/required");

    let handshake = json!({
        "jsonrpc": "2.0",
        "id": "auth-1",
        "method": "auth/handshake",
        "params": {
            "token": server.token,
            "principal": {
                "user": user,
                "userId": user_id,
                "group": "lab",
                "groupId": 5,
                "session": session,
            },
            "client": { "name": "test-client", "version": "0.1.0" }
        }
    });
    ws.send(Message::Text(handshake.to_string().into())).await.unwrap();

    let resp = recv_json(&mut ws).await;
    assert!(resp.get("result").is_some(), "Handshake should succeed: {resp}");
    assert_eq!(resp["result"]["sessionId"], session);

    let welcome = recv_json(&mut ws).await;
    assert_eq!(welcome["method"], "server/connected");
    ws
}

async fn call(ws: &mut Ws, id: i64, method: &str, params: Value) -> Value {
    let req = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string().into())).await.unwrap();
    recv_response(ws, id).await.0
}

async fn invoke(ws: &mut Ws, id: i64, proxy: &Value, method: &str, args: Value) -> Value {
    call(
        ws,
        id,
        "servant/invoke",
        json!({ "proxy": proxy, "method": method, "args": args }),
    )
    .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_get_service_shares_identity_and_destroy_notifies() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-1").await;

    // Two getService requests in flight at once.
    for id in [1, 2] {
        let req = json!({
            "jsonrpc": "2.0", "id": id,
            "method": "session/getService", "params": { "name": "Config" }
        });
        ws.send(Message::Text(req.to_string().into())).await.unwrap();
    }
    let first = recv_json(&mut ws).await;
    let second = recv_json(&mut ws).await;
    assert_eq!(first["result"]["identity"], second["result"]["identity"]);
    assert_eq!(first["result"]["identity"]["category"], "1:alice-e2e-1");

    let (resp, notifications) = {
        let req = json!({ "jsonrpc": "2.0", "id": 3, "method": "session/destroy" });
        ws.send(Message::Text(req.to_string().into())).await.unwrap();
        recv_response(&mut ws, 3).await
    };
    assert_eq!(resp["result"]["success"], true);
    assert_eq!(notifications.len(), 1, "{notifications:?}");
    assert_eq!(notifications[0]["method"], "session/closed");
}

#[tokio::test]
async fn config_round_trip_through_servant_invoke() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-2").await;

    let proxy = call(&mut ws, 1, "session/getService", json!({ "name": "Config" })).await;
    let identity = proxy["result"]["identity"].clone();

    let set = invoke(&mut ws, 2, &identity, "set", json!({ "key": "e2e.flag", "value": "on" })).await;
    assert!(set.get("result").is_some(), "{set}");
    let got = invoke(&mut ws, 3, &identity, "get", json!({ "key": "e2e.flag" })).await;
    assert_eq!(got["result"]["value"], "on");

    let services = call(&mut ws, 4, "session/activeServices", Value::Null).await;
    assert_eq!(services["result"]["services"], json!(["Config"]));
}

#[tokio::test]
async fn raw_file_servant_reads_and_closes() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-3").await;

    let proxy = call(&mut ws, 1, "session/createService", json!({ "name": "RawFile" })).await;
    assert_eq!(proxy["result"]["stateful"], true);
    let identity = proxy["result"]["identity"].clone();

    let opened = invoke(&mut ws, 2, &identity, "open", json!({ "path": "hello.txt" })).await;
    assert_eq!(opened["result"]["size"], 11);
    let read = invoke(&mut ws, 3, &identity, "read", json!({ "offset": 7, "length": 100 })).await;
    assert_eq!(read["result"]["length"], 4);

    let closed = invoke(&mut ws, 4, &identity, "close", Value::Null).await;
    assert_eq!(closed["result"]["success"], true);

    let alive = call(&mut ws, 5, "session/keepAliveSingle", json!({ "proxy": identity })).await;
    assert_eq!(alive["result"]["alive"], false);

    let after = invoke(&mut ws, 6, &identity, "size", Value::Null).await;
    assert_eq!(after["error"]["code"], -32020);
}

#[tokio::test]
async fn raw_file_rejects_escaping_paths() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-4").await;

    let proxy = call(&mut ws, 1, "session/createService", json!({ "name": "RawFile" })).await;
    let identity = proxy["result"]["identity"].clone();
    let resp = invoke(&mut ws, 2, &identity, "open", json!({ "path": "../etc/passwd" })).await;
    assert_eq!(resp["error"]["code"], -32010);
}

#[tokio::test]
async fn acquire_processor_returns_the_owning_users_worker() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-5").await;

    let proxy = call(&mut ws, 1, "session/getService", json!({ "name": "SharedResources" })).await;
    let identity = proxy["result"]["identity"].clone();
    let resp = invoke(
        &mut ws,
        2,
        &identity,
        "acquireProcessor",
        json!({ "job": { "id": 42, "kind": "script" }, "maxWaitSeconds": 5 }),
    )
    .await;
    assert_eq!(resp["result"]["worker"]["workerId"], "w-1", "{resp}");
}

#[tokio::test]
async fn acquire_processor_for_another_user_is_none() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "bob", 2, "bob-e2e-1").await;

    let proxy = call(&mut ws, 1, "session/getService", json!({ "name": "SharedResources" })).await;
    let identity = proxy["result"]["identity"].clone();
    let resp = invoke(
        &mut ws,
        2,
        &identity,
        "acquireProcessor",
        json!({ "job": { "id": 43, "kind": "script" }, "maxWaitSeconds": 1 }),
    )
    .await;
    assert!(resp.get("error").is_none(), "{resp}");
    assert_eq!(resp["result"]["worker"], Value::Null);
}

#[tokio::test]
async fn acquire_resource_over_three_minutes_is_rejected() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-6").await;

    let proxy = call(&mut ws, 1, "session/getService", json!({ "name": "SharedResources" })).await;
    let identity = proxy["result"]["identity"].clone();
    let resp = invoke(
        &mut ws,
        2,
        &identity,
        "acquireResource",
        json!({ "descriptor": { "kind": "Tables", "target": "t-1" }, "maxWaitSeconds": 181 }),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);
}

#[tokio::test]
async fn unknown_service_is_an_authorization_error() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-7").await;

    let resp = call(&mut ws, 1, "session/getService", json!({ "name": "Nope" })).await;
    assert_eq!(resp["error"]["code"], -32010);
}

#[tokio::test]
async fn proxies_of_other_sessions_are_refused() {
    let server = start_test_server().await;
    let mut alice = connect_as(&server, "alice", 1, "alice-e2e-8").await;
    let mut bob = connect_as(&server, "bob", 2, "bob-e2e-2").await;

    let proxy = call(&mut alice, 1, "session/getService", json!({ "name": "Config" })).await;
    let identity = proxy["result"]["identity"].clone();
    let resp = invoke(&mut bob, 1, &identity, "getAll", Value::Null).await;
    assert_eq!(resp["error"]["code"], -32010);
}

#[tokio::test]
async fn detached_state_survives_reconnect() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-9").await;

    let proxy = call(&mut ws, 1, "session/createService", json!({ "name": "RawFile" })).await;
    let identity = proxy["result"]["identity"].clone();
    invoke(&mut ws, 2, &identity, "open", json!({ "path": "hello.txt" })).await;
    call(&mut ws, 3, "session/detachOnDestroy", Value::Null).await;
    ws.close(None).await.unwrap();
    drop(ws);

    // Wait for the server to notice the socket is gone.
    let manager = server.server.manager();
    timeout(Duration::from_secs(5), async {
        while manager.sessions().iter().any(|s| s.category() == "1:alice-e2e-9") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session was not destroyed after close");

    let mut again = connect_as(&server, "alice", 1, "alice-e2e-9").await;
    let size = invoke(&mut again, 1, &identity, "size", Value::Null).await;
    assert_eq!(size["result"]["size"], 11);
}

#[tokio::test]
async fn closing_the_last_socket_tears_the_session_down() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-10").await;
    call(&mut ws, 1, "session/createService", json!({ "name": "RawFile" })).await;
    ws.close(None).await.unwrap();
    drop(ws);

    let store = server.server.manager().store().clone();
    timeout(Duration::from_secs(5), async {
        while store.registry("1:alice-e2e-10").is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registry was not released");
}

#[tokio::test]
async fn keep_alive_flags_missing_proxies() {
    let server = start_test_server().await;
    let mut ws = connect_as(&server, "alice", 1, "alice-e2e-11").await;

    let proxy = call(&mut ws, 1, "session/getService", json!({ "name": "Config" })).await;
    let identity = proxy["result"]["identity"].clone();
    let resp = call(
        &mut ws,
        2,
        "session/keepAlive",
        json!({ "proxies": [identity, { "category": "1:alice-e2e-11", "name": "RawFile-gone" }] }),
    )
    .await;
    assert_eq!(resp["result"]["missing"], 2);
}
