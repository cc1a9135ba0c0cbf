//! WebSocket transport: handshake, heartbeat, and the per-connection loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use trellis_access::{
    verify_connect_credential, AccessPolicy, AuthGrant, ConnectCredential, DeviceNonceWindow,
};
use trellis_core::{current_unix_timestamp_ms, next_id};
use trellis_registry::{CapabilityRegistry, RpcCallContext};

use crate::broadcaster::{ConnectionRegistry, RegisteredConnection};
use crate::rpc::RpcDispatcher;
use crate::wire::{
    best_effort_request_id, classify_parse_error, encode_frame, error_response, event_frame,
    ok_response, parse_frame, Frame, ERROR_CODE_INVALID_FRAME, ERROR_CODE_UNAUTHORIZED,
    EVENT_CONNECT_CHALLENGE, EVENT_HEARTBEAT, METHOD_CONNECT, PROTOCOL_VERSION,
};

#[derive(Debug, Clone)]
pub struct GatewayServerConfig {
    pub bind_addr: String,
    pub server_name: String,
    pub heartbeat_interval: Duration,
    /// A connection silent past this threshold is forcibly closed.
    pub stale_after: Duration,
    pub handshake_timeout: Duration,
}

impl GatewayServerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            server_name: "trellis-gateway".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Declared by the client in its `connect` request.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    auth: ConnectCredential,
    /// Event classes to receive; absent means all.
    #[serde(default)]
    subscriptions: Option<Vec<String>>,
    #[serde(default)]
    capabilities: Vec<String>,
}

enum HandshakeOutcome {
    Granted {
        request_id: String,
        grant: AuthGrant,
        subscriptions: Option<BTreeSet<String>>,
    },
    Rejected(Frame),
}

/// The gateway transport host: accepts websocket connections, runs the
/// challenge/response handshake, and bridges frames to the RPC dispatcher
/// and the connection registry.
pub struct GatewayServer {
    config: GatewayServerConfig,
    policy: AccessPolicy,
    nonce_window: DeviceNonceWindow,
    registry: Arc<CapabilityRegistry>,
    connections: Arc<ConnectionRegistry>,
    dispatcher: RpcDispatcher,
}

impl GatewayServer {
    pub fn new(
        config: GatewayServerConfig,
        policy: AccessPolicy,
        nonce_window: DeviceNonceWindow,
        registry: Arc<CapabilityRegistry>,
        connections: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        let dispatcher = RpcDispatcher::new(registry.clone());
        Arc::new(Self {
            config,
            policy,
            nonce_window,
            registry,
            connections,
            dispatcher,
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Binds and serves. Failure to bind is one of the few process-fatal
    /// startup conditions.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("failed to bind gateway transport {}", self.config.bind_addr))?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener; used by tests to bind port 0.
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let app = Router::new()
            .route("/ws", get(handle_ws_upgrade))
            .with_state(self);
        axum::serve(listener, app)
            .await
            .context("gateway transport serve loop failed")
    }

    async fn run_connection(self: Arc<Self>, socket: WebSocket) {
        let connection_id = next_id("conn");
        let (mut sink, mut source) = socket.split();

        let nonce = self.nonce_window.current(current_unix_timestamp_ms());
        let challenge = event_frame(
            None,
            EVENT_CONNECT_CHALLENGE,
            json!({ "nonce": nonce, "protocol_version": PROTOCOL_VERSION }),
        );
        if sink
            .send(WsMessage::Text(encode_frame(&challenge).into()))
            .await
            .is_err()
        {
            return;
        }

        let first_text = tokio::time::timeout(self.config.handshake_timeout, async {
            while let Some(message) = source.next().await {
                match message {
                    Ok(WsMessage::Text(raw)) => return Some(raw),
                    Ok(WsMessage::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        })
        .await;
        let Ok(Some(raw)) = first_text else {
            debug!(connection_id, "connection closed before handshake completed");
            return;
        };

        let (request_id, grant, subscriptions) = match self.evaluate_handshake(raw.as_str()) {
            HandshakeOutcome::Granted {
                request_id,
                grant,
                subscriptions,
            } => (request_id, grant, subscriptions),
            HandshakeOutcome::Rejected(response) => {
                warn!(connection_id, "handshake rejected; closing");
                let _ = sink
                    .send(WsMessage::Text(encode_frame(&response).into()))
                    .await;
                let _ = sink.close().await;
                return;
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let connection = self.connections.register(
            connection_id.clone(),
            grant.identity.clone(),
            grant.scopes.clone(),
            subscriptions,
            outbound_tx,
        );
        connection.send_frame(ok_response(
            &request_id,
            json!({
                "protocol_version": PROTOCOL_VERSION,
                "server": self.config.server_name,
                "connection_id": connection_id,
                "heartbeat_interval_ms": self.config.heartbeat_interval.as_millis() as u64,
                "methods": self.registry.method_names(),
            }),
        ));
        debug!(connection_id, identity = %grant.identity, "connection registered");

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    if sink
                        .send(WsMessage::Text(encode_frame(&frame).into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.stale_after {
                        warn!(connection_id, "connection silent past stale threshold; closing");
                        break;
                    }
                    // Clients auto-reply Pong to this, which refreshes
                    // last_seen above, so a passive subscriber stays alive.
                    if sink
                        .send(WsMessage::Ping(Bytes::new()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if connection.subscribed_to(EVENT_HEARTBEAT) {
                        connection.send_event(
                            EVENT_HEARTBEAT,
                            json!({ "unix_ms": current_unix_timestamp_ms() }),
                        );
                    }
                }
                maybe_message = source.next() => {
                    match maybe_message {
                        Some(Ok(WsMessage::Text(raw))) => {
                            last_seen = Instant::now();
                            self.handle_text_frame(&connection, raw.as_str());
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        self.connections.unregister(&connection_id);
        debug!(connection_id, "connection closed");
    }

    fn evaluate_handshake(&self, raw: &str) -> HandshakeOutcome {
        match parse_frame(raw) {
            Ok(Frame::Req { id, method, params }) if method == METHOD_CONNECT => {
                let params = params.unwrap_or_else(|| json!({}));
                let connect = match serde_json::from_value::<ConnectParams>(params) {
                    Ok(connect) => connect,
                    Err(error) => {
                        return HandshakeOutcome::Rejected(error_response(
                            &id,
                            ERROR_CODE_INVALID_FRAME,
                            format!("invalid connect params: {error}"),
                        ))
                    }
                };
                if !connect.capabilities.is_empty() {
                    debug!(capabilities = ?connect.capabilities, "client declared capabilities");
                }
                match verify_connect_credential(
                    &self.policy,
                    &connect.auth,
                    &self.nonce_window,
                    current_unix_timestamp_ms(),
                ) {
                    Ok(grant) => HandshakeOutcome::Granted {
                        request_id: id,
                        grant,
                        subscriptions: connect
                            .subscriptions
                            .map(|classes| classes.into_iter().collect()),
                    },
                    // The denial is opaque on purpose; the log carries the
                    // reason, the wire never does.
                    Err(denied) => HandshakeOutcome::Rejected(error_response(
                        &id,
                        ERROR_CODE_UNAUTHORIZED,
                        denied.to_string(),
                    )),
                }
            }
            Ok(Frame::Req { id, .. }) => HandshakeOutcome::Rejected(error_response(
                &id,
                ERROR_CODE_INVALID_FRAME,
                "first request must be 'connect'",
            )),
            Ok(_) => HandshakeOutcome::Rejected(error_response(
                "unknown-request",
                ERROR_CODE_INVALID_FRAME,
                "handshake expects a connect request",
            )),
            Err(error) => {
                let message = error.to_string();
                let code = classify_parse_error(&message);
                let id = best_effort_request_id(raw)
                    .unwrap_or_else(|| "unknown-request".to_string());
                HandshakeOutcome::Rejected(error_response(&id, code, message))
            }
        }
    }

    /// Requests are dispatched on their own tasks, so responses may complete
    /// out of request order; correlation is by id only.
    fn handle_text_frame(self: &Arc<Self>, connection: &Arc<RegisteredConnection>, raw: &str) {
        match parse_frame(raw) {
            Err(error) => {
                let message = error.to_string();
                let code = classify_parse_error(&message);
                let id = best_effort_request_id(raw)
                    .unwrap_or_else(|| "unknown-request".to_string());
                connection.send_frame(error_response(&id, code, message));
            }
            Ok(Frame::Req { id, method, params }) => {
                let server = self.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    let ctx = RpcCallContext {
                        connection_id: connection.connection_id().to_string(),
                        identity: connection.identity().to_string(),
                    };
                    let response = server
                        .dispatcher
                        .dispatch(ctx, connection.scopes(), &id, &method, params)
                        .await;
                    connection.send_frame(response);
                });
            }
            Ok(_) => debug!("ignoring non-request frame from client"),
        }
    }
}

async fn handle_ws_upgrade(
    State(server): State<Arc<GatewayServer>>,
    websocket: WebSocketUpgrade,
) -> Response {
    websocket.on_upgrade(move |socket| server.run_connection(socket))
}
