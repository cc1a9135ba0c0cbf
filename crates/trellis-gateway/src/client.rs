//! Reconnecting gateway client over `tokio-tungstenite`.
//!
//! Ordering of in-flight requests is not guaranteed across a reconnect; every
//! session starts fresh for request correlation, and calls pending at
//! disconnect fail instead of spanning sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use trellis_access::ConnectCredential;
use trellis_core::{next_id, BoundedBackoff};

use crate::wire::{
    encode_frame, parse_frame, ErrorPayload, Frame, EVENT_CONNECT_CHALLENGE, METHOD_CONNECT,
};

/// Produces the credential for one handshake. Device-token callers sign the
/// server's challenge nonce here; static credentials just clone themselves.
pub trait CredentialSource: Send + Sync {
    fn credential(&self, challenge_nonce: &str) -> ConnectCredential;
}

impl CredentialSource for ConnectCredential {
    fn credential(&self, _challenge_nonce: &str) -> ConnectCredential {
        self.clone()
    }
}

#[async_trait]
/// Receives server-pushed events and connection lifecycle notifications.
pub trait GatewayEventHandler: Send + Sync {
    async fn on_event(&self, event: &str, seq: Option<u64>, payload: Value);

    async fn on_connected(&self, hello: Value) {
        let _ = hello;
    }
}

#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    pub url: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub handshake_timeout: Duration,
    /// Event classes to subscribe to; `None` means all.
    pub subscriptions: Option<Vec<String>>,
}

impl GatewayClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            subscriptions: None,
        }
    }
}

type PendingMap = HashMap<String, oneshot::Sender<std::result::Result<Value, ErrorPayload>>>;

pub struct GatewayClient {
    config: GatewayClientConfig,
    credentials: Arc<dyn CredentialSource>,
    events: Arc<dyn GatewayEventHandler>,
    pending: Mutex<PendingMap>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
}

impl GatewayClient {
    pub fn new(
        config: GatewayClientConfig,
        credentials: Arc<dyn CredentialSource>,
        events: Arc<dyn GatewayEventHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials,
            events,
            pending: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
        })
    }

    /// Connects, and reconnects with bounded exponential backoff whenever the
    /// session ends. Never returns.
    pub async fn run(self: Arc<Self>) {
        let mut backoff =
            BoundedBackoff::new(self.config.reconnect_min, self.config.reconnect_max);
        loop {
            match self.run_session().await {
                Ok(()) => backoff.reset(),
                Err(error) => warn!(error = %error, "gateway client session failed"),
            }
            self.clear_connection("connection closed before the response arrived");
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// One connection lifetime: handshake, then the frame pump until the
    /// socket closes.
    pub async fn run_session(&self) -> Result<()> {
        let (stream, _response) = connect_async(self.config.url.as_str())
            .await
            .context("failed to connect gateway websocket")?;
        let (mut sink, mut source) = stream.split();

        let challenge =
            tokio::time::timeout(self.config.handshake_timeout, next_text_frame(&mut source))
                .await
                .context("timed out waiting for the connect challenge")??;
        let Frame::Evt { event, payload, .. } = &challenge else {
            bail!("expected a connect challenge event during handshake");
        };
        if event != EVENT_CONNECT_CHALLENGE {
            bail!("expected '{EVENT_CONNECT_CHALLENGE}' during handshake, got '{event}'");
        }
        let nonce = payload
            .as_ref()
            .and_then(|payload| payload.get("nonce"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let credential = self.credentials.credential(&nonce);
        let connect_id = next_id("req");
        let mut connect_params = json!({ "auth": credential });
        if let Some(subscriptions) = &self.config.subscriptions {
            connect_params["subscriptions"] = json!(subscriptions);
        }
        let connect_frame = Frame::Req {
            id: connect_id.clone(),
            method: METHOD_CONNECT.to_string(),
            params: Some(connect_params),
        };
        sink.send(WsMessage::Text(encode_frame(&connect_frame).into()))
            .await
            .context("failed to send connect request")?;

        let hello =
            tokio::time::timeout(self.config.handshake_timeout, next_text_frame(&mut source))
                .await
                .context("timed out waiting for the connect response")??;
        let Frame::Res {
            id,
            ok,
            payload,
            error,
        } = hello
        else {
            bail!("expected a connect response during handshake");
        };
        if id != connect_id {
            bail!("connect response correlates to a different request");
        }
        if !ok {
            let detail = error
                .map(|error| format!("{}: {}", error.code, error.message))
                .unwrap_or_else(|| "no error payload".to_string());
            bail!("gateway refused the connection: {detail}");
        }
        self.events
            .on_connected(payload.unwrap_or_else(|| json!({})))
            .await;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        *self.lock_outbound() = Some(outbound_tx);

        loop {
            tokio::select! {
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { return Ok(()) };
                    sink.send(WsMessage::Text(encode_frame(&frame).into()))
                        .await
                        .context("failed to send frame")?;
                }
                maybe_message = source.next() => {
                    let Some(message) = maybe_message else { return Ok(()) };
                    match message.context("gateway websocket read failed")? {
                        WsMessage::Text(raw) => self.handle_inbound(raw.as_str()).await,
                        WsMessage::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Sends one request on the current connection and waits for its
    /// response, correlated by id.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = next_id("req");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), reply_tx);

        let sent = self
            .lock_outbound()
            .as_ref()
            .map(|sender| {
                sender
                    .send(Frame::Req {
                        id: id.clone(),
                        method: method.to_string(),
                        params: Some(params),
                    })
                    .is_ok()
            })
            .unwrap_or(false);
        if !sent {
            self.lock_pending().remove(&id);
            bail!("gateway client is not connected");
        }

        match reply_rx.await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(error)) => bail!("{}: {}", error.code, error.message),
            Err(_) => bail!("connection closed before the response arrived"),
        }
    }

    async fn handle_inbound(&self, raw: &str) {
        match parse_frame(raw) {
            Ok(Frame::Res {
                id,
                ok,
                payload,
                error,
            }) => {
                let Some(waiter) = self.lock_pending().remove(&id) else {
                    debug!(id, "response without a pending request");
                    return;
                };
                let outcome = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    Err(error.unwrap_or_else(|| {
                        ErrorPayload::new("internal_error", "response carried no error payload")
                    }))
                };
                let _ = waiter.send(outcome);
            }
            Ok(Frame::Evt {
                seq,
                event,
                payload,
            }) => {
                self.events
                    .on_event(&event, seq, payload.unwrap_or(Value::Null))
                    .await;
            }
            Ok(Frame::Req { .. }) => debug!("ignoring request frame from the server"),
            Err(error) => warn!(error = %error, "discarding malformed frame from the server"),
        }
    }

    fn clear_connection(&self, reason: &str) {
        *self.lock_outbound() = None;
        let pending = std::mem::take(&mut *self.lock_pending());
        for (_, waiter) in pending {
            let _ = waiter.send(Err(ErrorPayload::new("disconnected", reason)));
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Frame>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn next_text_frame<S>(source: &mut S) -> Result<Frame>
where
    S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(message) = source.next().await {
        match message.context("gateway websocket read failed")? {
            WsMessage::Text(raw) => return parse_frame(raw.as_str()),
            WsMessage::Close(_) => bail!("gateway closed the connection during handshake"),
            _ => {}
        }
    }
    bail!("gateway connection ended during handshake")
}
