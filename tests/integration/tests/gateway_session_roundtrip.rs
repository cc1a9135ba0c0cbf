use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use trellis_access::{
    AccessPolicy, ConnectCredential, DeviceNonceWindow, Scope, ScopeSet,
    DEVICE_NONCE_ROTATION_MS_DEFAULT,
};
use trellis_gateway::{
    ConnectionRegistry, GatewayClient, GatewayClientConfig, GatewayEventHandler, GatewayServer,
    GatewayServerConfig,
};
use trellis_registry::{
    CapabilityManifest, CapabilityRegistry, MethodError, RpcCallContext, RpcMethodHandler,
    RpcMethodRegistration,
};

const WAIT: Duration = Duration::from_secs(5);

struct EchoMethod;

#[async_trait]
impl RpcMethodHandler for EchoMethod {
    async fn handle(&self, ctx: RpcCallContext, params: Value) -> Result<Value, MethodError> {
        Ok(json!({ "identity": ctx.identity, "echo": params }))
    }
}

struct ResetMethod;

#[async_trait]
impl RpcMethodHandler for ResetMethod {
    async fn handle(&self, _ctx: RpcCallContext, _params: Value) -> Result<Value, MethodError> {
        Ok(json!({ "reset": true }))
    }
}

fn registry() -> Arc<CapabilityRegistry> {
    let manifest = CapabilityManifest::new()
        .register_method(RpcMethodRegistration::new(
            "echo",
            Scope::Read,
            Arc::new(EchoMethod),
        ))
        .register_method(RpcMethodRegistration::new(
            "admin.reset",
            Scope::Admin,
            Arc::new(ResetMethod),
        ));
    Arc::new(CapabilityRegistry::from_manifest(manifest))
}

fn token_policy() -> AccessPolicy {
    AccessPolicy {
        shared_token: Some("integration-token".to_string()),
        token_scopes: ScopeSet::read_only(),
        ..AccessPolicy::default()
    }
}

async fn start_server(policy: AccessPolicy) -> (SocketAddr, Arc<ConnectionRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    start_server_with(policy, GatewayServerConfig::new(addr.to_string()), listener).await
}

async fn start_fast_heartbeat_server(policy: AccessPolicy) -> (SocketAddr, Arc<ConnectionRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let mut config = GatewayServerConfig::new(addr.to_string());
    config.heartbeat_interval = Duration::from_millis(50);
    config.stale_after = Duration::from_millis(200);
    start_server_with(policy, config, listener).await
}

async fn start_server_with(
    policy: AccessPolicy,
    config: GatewayServerConfig,
    listener: TcpListener,
) -> (SocketAddr, Arc<ConnectionRegistry>) {
    let addr = listener.local_addr().expect("local addr");
    let connections = Arc::new(ConnectionRegistry::new());
    let server = GatewayServer::new(
        config,
        policy,
        DeviceNonceWindow::new([7u8; 32], DEVICE_NONCE_ROTATION_MS_DEFAULT),
        registry(),
        connections.clone(),
    );
    tokio::spawn(server.serve_on(listener));
    (addr, connections)
}

struct CollectingHandler {
    hello_tx: mpsc::UnboundedSender<Value>,
    event_tx: mpsc::UnboundedSender<(String, Option<u64>, Value)>,
}

#[async_trait]
impl GatewayEventHandler for CollectingHandler {
    async fn on_event(&self, event: &str, seq: Option<u64>, payload: Value) {
        let _ = self.event_tx.send((event.to_string(), seq, payload));
    }

    async fn on_connected(&self, hello: Value) {
        let _ = self.hello_tx.send(hello);
    }
}

struct ConnectedClient {
    client: Arc<GatewayClient>,
    hello: Value,
    events: mpsc::UnboundedReceiver<(String, Option<u64>, Value)>,
}

async fn connect_client(
    addr: SocketAddr,
    credential: ConnectCredential,
    subscriptions: Option<Vec<String>>,
) -> ConnectedClient {
    let (hello_tx, mut hello_rx) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let mut config = GatewayClientConfig::new(format!("ws://{addr}/ws"));
    config.subscriptions = subscriptions;
    let client = GatewayClient::new(
        config,
        Arc::new(credential),
        Arc::new(CollectingHandler { hello_tx, event_tx }),
    );
    tokio::spawn(client.clone().run());
    let hello = tokio::time::timeout(WAIT, hello_rx.recv())
        .await
        .expect("handshake completed")
        .expect("hello payload");
    ConnectedClient {
        client,
        hello,
        events,
    }
}

#[tokio::test]
async fn token_handshake_then_request_response_roundtrip() {
    let (addr, connections) = start_server(token_policy()).await;
    let connected = connect_client(
        addr,
        ConnectCredential::Token {
            token: "integration-token".to_string(),
        },
        None,
    )
    .await;

    assert_eq!(connected.hello["protocol_version"], "1");
    assert_eq!(connected.hello["server"], "trellis-gateway");
    let methods: Vec<String> =
        serde_json::from_value(connected.hello["methods"].clone()).expect("methods");
    assert!(methods.iter().any(|name| name == "echo"));
    assert_eq!(connections.connection_count(), 1);

    let payload = connected
        .client
        .call("echo", json!({ "text": "ping" }))
        .await
        .expect("echo call");
    assert_eq!(payload["identity"], "token");
    assert_eq!(payload["echo"]["text"], "ping");
}

#[tokio::test]
async fn read_only_token_cannot_reach_admin_methods() {
    let (addr, _connections) = start_server(token_policy()).await;
    let connected = connect_client(
        addr,
        ConnectCredential::Token {
            token: "integration-token".to_string(),
        },
        None,
    )
    .await;

    let error = connected
        .client
        .call("admin.reset", json!({}))
        .await
        .expect_err("scope violation");
    assert!(error.to_string().contains("forbidden"), "{error}");

    let error = connected
        .client
        .call("no.such.method", json!({}))
        .await
        .expect_err("unknown method");
    assert!(error.to_string().contains("unknown_method"), "{error}");
}

#[tokio::test]
async fn broadcast_events_arrive_with_gap_free_sequence_numbers() {
    let (addr, connections) = start_server(token_policy()).await;
    let mut connected = connect_client(
        addr,
        ConnectCredential::Token {
            token: "integration-token".to_string(),
        },
        None,
    )
    .await;

    connections.broadcast("run.started", json!({ "run_id": "run-1" }));
    connections.broadcast("run.finished", json!({ "run_id": "run-1" }));

    let (event, seq, payload) = tokio::time::timeout(WAIT, connected.events.recv())
        .await
        .expect("first event")
        .expect("channel open");
    assert_eq!(event, "run.started");
    assert_eq!(seq, Some(1));
    assert_eq!(payload["run_id"], "run-1");

    let (event, seq, _) = tokio::time::timeout(WAIT, connected.events.recv())
        .await
        .expect("second event")
        .expect("channel open");
    assert_eq!(event, "run.finished");
    assert_eq!(seq, Some(2));
}

#[tokio::test]
async fn subscriptions_filter_classes_without_consuming_sequence_numbers() {
    let (addr, connections) = start_server(token_policy()).await;
    let mut connected = connect_client(
        addr,
        ConnectCredential::Token {
            token: "integration-token".to_string(),
        },
        Some(vec!["run".to_string()]),
    )
    .await;

    connections.broadcast("delivery.sent", json!({ "chunk": 1 }));
    connections.broadcast("run.started", json!({ "run_id": "run-1" }));

    let (event, seq, _) = tokio::time::timeout(WAIT, connected.events.recv())
        .await
        .expect("subscribed event")
        .expect("channel open");
    assert_eq!(event, "run.started");
    assert_eq!(seq, Some(1));
}

#[tokio::test]
async fn passive_subscriber_outlives_the_stale_threshold() {
    let (addr, connections) = start_fast_heartbeat_server(token_policy()).await;
    let mut connected = connect_client(
        addr,
        ConnectCredential::Token {
            token: "integration-token".to_string(),
        },
        None,
    )
    .await;

    // Several stale windows pass without the client sending anything; the
    // server's ping and the client's automatic pong keep it registered.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(connections.connection_count(), 1);

    let (event, seq, _) = tokio::time::timeout(WAIT, connected.events.recv())
        .await
        .expect("heartbeat event")
        .expect("channel open");
    assert_eq!(event, "gateway.heartbeat");
    assert_eq!(seq, Some(1));
}

#[tokio::test]
async fn heartbeat_events_respect_the_subscription_filter() {
    let (addr, connections) = start_fast_heartbeat_server(token_policy()).await;
    let mut connected = connect_client(
        addr,
        ConnectCredential::Token {
            token: "integration-token".to_string(),
        },
        Some(vec!["run".to_string()]),
    )
    .await;

    // Enough time for multiple heartbeat ticks to fire.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(connections.connection_count(), 1);
    assert!(connected.events.try_recv().is_err());

    connections.broadcast("run.started", json!({ "run_id": "run-1" }));
    let (event, seq, _) = tokio::time::timeout(WAIT, connected.events.recv())
        .await
        .expect("subscribed event")
        .expect("channel open");
    assert_eq!(event, "run.started");
    assert_eq!(seq, Some(1));
}

#[tokio::test]
async fn wrong_token_is_rejected_without_detail() {
    let (addr, connections) = start_server(token_policy()).await;
    let (hello_tx, _hello_rx) = mpsc::unbounded_channel();
    let (event_tx, _events) = mpsc::unbounded_channel();
    let client = GatewayClient::new(
        GatewayClientConfig::new(format!("ws://{addr}/ws")),
        Arc::new(ConnectCredential::Token {
            token: "wrong-token".to_string(),
        }),
        Arc::new(CollectingHandler { hello_tx, event_tx }),
    );

    let error = tokio::time::timeout(WAIT, client.run_session())
        .await
        .expect("handshake finished")
        .expect_err("rejected");
    let detail = error.to_string();
    assert!(detail.contains("unauthorized"), "{detail}");
    assert!(!detail.contains("mismatch"), "{detail}");
    assert_eq!(connections.connection_count(), 0);
}
