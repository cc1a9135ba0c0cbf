//! RPC method handler contract. Core methods register here exactly like
//! plugin-supplied methods; the dispatcher sees one uniform table.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use trellis_access::Scope;

#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[error("{code}: {message}")]
/// Typed error payload written into a response frame.
pub struct MethodError {
    pub code: String,
    pub message: String,
}

impl MethodError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new("invalid_params", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

#[derive(Debug, Clone)]
/// Who is calling: carried from the authenticated connection.
pub struct RpcCallContext {
    pub connection_id: String,
    pub identity: String,
}

#[async_trait]
/// One RPC method body. Scope enforcement happens before `handle` runs.
pub trait RpcMethodHandler: Send + Sync {
    async fn handle(&self, ctx: RpcCallContext, params: Value) -> Result<Value, MethodError>;
}

#[derive(Clone)]
/// Registry entry binding a method name to its minimum scope and handler.
pub struct RpcMethodRegistration {
    pub name: String,
    pub required_scope: Scope,
    pub handler: Arc<dyn RpcMethodHandler>,
}

impl RpcMethodRegistration {
    pub fn new(
        name: impl Into<String>,
        required_scope: Scope,
        handler: Arc<dyn RpcMethodHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            required_scope,
            handler,
        }
    }
}
