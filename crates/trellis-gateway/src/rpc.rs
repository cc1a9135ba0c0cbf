//! Uniform RPC dispatch: one registry lookup path for core and plugin
//! methods alike.

use std::sync::Arc;

use serde_json::Value;
use trellis_access::ScopeSet;
use trellis_registry::{CapabilityRegistry, RpcCallContext};

use crate::wire::{
    error_response, ok_response, Frame, ERROR_CODE_FORBIDDEN, ERROR_CODE_HANDLER_ERROR,
    ERROR_CODE_UNKNOWN_METHOD,
};

/// Resolves request frames against the capability registry and produces
/// exactly one response frame per request id.
pub struct RpcDispatcher {
    registry: Arc<CapabilityRegistry>,
}

impl RpcDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Unknown method, scope violation, handler error, and handler panic each
    /// map to a typed error payload; nothing is silently dropped.
    pub async fn dispatch(
        &self,
        ctx: RpcCallContext,
        scopes: &ScopeSet,
        id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Frame {
        let Some(registration) = self.registry.method(method) else {
            return error_response(
                id,
                ERROR_CODE_UNKNOWN_METHOD,
                format!("method '{method}' is not registered"),
            );
        };
        if !scopes.allows(registration.required_scope) {
            return error_response(
                id,
                ERROR_CODE_FORBIDDEN,
                format!(
                    "method '{method}' requires scope '{}'",
                    registration.required_scope.as_str()
                ),
            );
        }

        let params = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        let handler = registration.handler.clone();
        // A separate task contains handler panics; they surface as a join
        // error, not a dropped connection.
        let invocation = tokio::spawn(async move { handler.handle(ctx, params).await });
        match invocation.await {
            Ok(Ok(payload)) => ok_response(id, payload),
            Ok(Err(error)) => error_response(id, &error.code, error.message),
            Err(join_error) => error_response(
                id,
                ERROR_CODE_HANDLER_ERROR,
                format!("method '{method}' handler failed: {join_error}"),
            ),
        }
    }
}
