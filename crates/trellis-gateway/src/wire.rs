//! JSON frame codec for the gateway wire protocol.
//!
//! Three frame shapes travel over the persistent transport:
//!
//! ```text
//! Request:  { "type": "req", "id": <opaque>, "method": <string>, "params"?: <object> }
//! Response: { "type": "res", "id": <opaque>, "ok": <bool>, "payload"?: <object>, "error"?: {code, message} }
//! Event:    { "type": "evt", "seq"?: <int>, "event": <string>, "payload"?: <object> }
//! ```
//!
//! Responses correlate to requests by `id` only; no ordering is promised
//! across distinct requests. Events carry the per-connection sequence number
//! assigned at broadcast time.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "1";

pub const ERROR_CODE_INVALID_JSON: &str = "invalid_json";
pub const ERROR_CODE_INVALID_FRAME: &str = "invalid_frame";
pub const ERROR_CODE_UNKNOWN_METHOD: &str = "unknown_method";
pub const ERROR_CODE_FORBIDDEN: &str = "forbidden";
pub const ERROR_CODE_HANDLER_ERROR: &str = "handler_error";
pub const ERROR_CODE_UNAUTHORIZED: &str = "unauthorized";

pub const METHOD_CONNECT: &str = "connect";
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";
pub const EVENT_HEARTBEAT: &str = "gateway.heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Typed error carried inside a failed response frame.
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Req {
        id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Evt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

/// Parses and structurally validates one frame.
pub fn parse_frame(raw: &str) -> Result<Frame> {
    let frame = serde_json::from_str::<Frame>(raw).context("failed to parse gateway frame JSON")?;
    match &frame {
        Frame::Req { id, method, params } => {
            if id.trim().is_empty() {
                bail!("gateway request id must be non-empty");
            }
            if method.trim().is_empty() {
                bail!("gateway request method must be non-empty");
            }
            if let Some(params) = params {
                if !params.is_object() {
                    bail!("gateway request params must be a JSON object");
                }
            }
        }
        Frame::Res { id, .. } => {
            if id.trim().is_empty() {
                bail!("gateway response id must be non-empty");
            }
        }
        Frame::Evt { event, .. } => {
            if event.trim().is_empty() {
                bail!("gateway event name must be non-empty");
            }
        }
    }
    Ok(frame)
}

/// Maps a parse failure to the error code reported back to the peer.
pub fn classify_parse_error(message: &str) -> &'static str {
    if message.contains("failed to parse gateway frame JSON") {
        ERROR_CODE_INVALID_JSON
    } else {
        ERROR_CODE_INVALID_FRAME
    }
}

/// Recovers a request id from an unparseable frame so the error response can
/// still correlate.
pub fn best_effort_request_id(raw: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(raw).ok()?;
    value
        .as_object()
        .and_then(|object| object.get("id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

pub fn ok_response(id: &str, payload: Value) -> Frame {
    Frame::Res {
        id: id.to_string(),
        ok: true,
        payload: Some(payload),
        error: None,
    }
}

pub fn error_response(id: &str, code: &str, message: impl Into<String>) -> Frame {
    Frame::Res {
        id: id.to_string(),
        ok: false,
        payload: None,
        error: Some(ErrorPayload::new(code, message)),
    }
}

pub fn event_frame(seq: Option<u64>, event: &str, payload: Value) -> Frame {
    Frame::Evt {
        seq,
        event: event.to_string(),
        payload: Some(payload),
    }
}

/// Serializes a frame for the wire. Serialization of these shapes cannot
/// realistically fail; the fallback keeps the connection alive if it somehow
/// does.
pub fn encode_frame(frame: &Frame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| {
        "{\"type\":\"res\",\"id\":\"unknown-request\",\"ok\":false,\"error\":{\"code\":\"internal_error\",\"message\":\"failed to serialize gateway frame\"}}"
            .to_string()
    })
}

/// The coarse class an event belongs to, used for per-connection
/// subscriptions: everything before the first `.`.
pub fn event_class(event: &str) -> &str {
    event.split('.').next().unwrap_or(event)
}
