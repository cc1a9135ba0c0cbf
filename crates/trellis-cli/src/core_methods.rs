//! Core RPC methods, registered into the capability registry exactly like
//! plugin-supplied methods.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use trellis_access::Scope;
use trellis_agent::{AgentExecutor, RunRequest};
use trellis_gateway::wire::PROTOCOL_VERSION;
use trellis_registry::{
    CapabilityManifest, CapabilityRegistry, MethodError, RpcCallContext, RpcMethodHandler,
    RpcMethodRegistration,
};
use trellis_session::SessionStore;

use crate::bootstrap::{RouterHandle, RunTracker, TrellisRuntime};

/// Adds the core method set to a collaborator-supplied manifest.
pub fn register_core_methods(
    manifest: CapabilityManifest,
    runtime: &Arc<TrellisRuntime>,
) -> CapabilityManifest {
    manifest
        .register_method(RpcMethodRegistration::new(
            "gateway.status",
            Scope::Read,
            Arc::new(GatewayStatusMethod {
                runtime: Arc::downgrade(runtime),
            }),
        ))
        .register_method(RpcMethodRegistration::new(
            "agent.run",
            Scope::Write,
            Arc::new(AgentRunMethod {
                executor: runtime.executor.clone(),
                runs: runtime.runs.clone(),
                system_prompt: runtime.config.agent.system_prompt.clone(),
            }),
        ))
        .register_method(RpcMethodRegistration::new(
            "agent.abort",
            Scope::Write,
            Arc::new(AgentAbortMethod {
                runs: runtime.runs.clone(),
            }),
        ))
        .register_method(RpcMethodRegistration::new(
            "session.status",
            Scope::Read,
            Arc::new(SessionStatusMethod {
                store: runtime.store.clone(),
            }),
        ))
        .register_method(RpcMethodRegistration::new(
            "session.reset",
            Scope::Admin,
            Arc::new(SessionResetMethod {
                store: runtime.store.clone(),
            }),
        ))
        .register_method(RpcMethodRegistration::new(
            "bindings.reload",
            Scope::Admin,
            Arc::new(BindingsReloadMethod {
                router: runtime.router.clone(),
            }),
        ))
}

/// The registry holds this method and this method reports on the registry,
/// so the back reference is weak.
struct GatewayStatusMethod {
    runtime: Weak<TrellisRuntime>,
}

#[async_trait]
impl RpcMethodHandler for GatewayStatusMethod {
    async fn handle(&self, _ctx: RpcCallContext, _params: Value) -> Result<Value, MethodError> {
        let Some(runtime) = self.runtime.upgrade() else {
            return Err(MethodError::internal("runtime is shutting down"));
        };
        let registry: &Arc<CapabilityRegistry> = &runtime.registry;
        Ok(json!({
            "protocol_version": PROTOCOL_VERSION,
            "server": runtime.config.gateway.server_name,
            "started_unix_ms": runtime.started_unix_ms,
            "connections": runtime.connections.connection_count(),
            "identities": runtime.connections.identities(),
            "active_runs": runtime.runs.active_count(),
            "channels": registry.channel_ids(),
            "methods": registry.method_names(),
        }))
    }
}

#[derive(Deserialize)]
struct AgentRunParams {
    session_key: String,
    text: String,
    #[serde(default)]
    system_prompt: Option<String>,
}

struct AgentRunMethod {
    executor: Arc<AgentExecutor>,
    runs: Arc<RunTracker>,
    system_prompt: Option<String>,
}

#[async_trait]
impl RpcMethodHandler for AgentRunMethod {
    async fn handle(&self, _ctx: RpcCallContext, params: Value) -> Result<Value, MethodError> {
        let params: AgentRunParams = serde_json::from_value(params)
            .map_err(|error| MethodError::invalid_params(error.to_string()))?;
        if params.session_key.trim().is_empty() {
            return Err(MethodError::invalid_params("session_key must be non-empty"));
        }
        if params.text.trim().is_empty() {
            return Err(MethodError::invalid_params("text must be non-empty"));
        }

        let mut request = RunRequest::new(params.session_key, params.text);
        request.system_prompt = params.system_prompt.or_else(|| self.system_prompt.clone());

        let abort = self.runs.register(&request.run_id);
        let run_id = request.run_id.clone();
        let outcome = self.executor.run(request, abort).await;
        self.runs.finish(&run_id);

        match outcome {
            Ok(outcome) => Ok(json!({
                "run_id": outcome.run_id,
                "session_key": outcome.session_key,
                "status": outcome.status.as_str(),
                "failure_reason": outcome.failure_reason,
                "output_text": outcome.output_text,
                "usage": {
                    "input_tokens": outcome.usage.input_tokens,
                    "output_tokens": outcome.usage.output_tokens,
                    "total_tokens": outcome.usage.total_tokens,
                },
                "tool_results": outcome.tool_results,
            })),
            Err(error) if error.is_retryable() => {
                Err(MethodError::new("session_lock_contention", error.to_string()))
            }
            Err(error) => Err(MethodError::internal(error.to_string())),
        }
    }
}

#[derive(Deserialize)]
struct AgentAbortParams {
    run_id: String,
}

struct AgentAbortMethod {
    runs: Arc<RunTracker>,
}

#[async_trait]
impl RpcMethodHandler for AgentAbortMethod {
    async fn handle(&self, _ctx: RpcCallContext, params: Value) -> Result<Value, MethodError> {
        let params: AgentAbortParams = serde_json::from_value(params)
            .map_err(|error| MethodError::invalid_params(error.to_string()))?;
        let aborted = self.runs.abort(&params.run_id);
        Ok(json!({ "run_id": params.run_id, "aborted": aborted }))
    }
}

#[derive(Deserialize)]
struct SessionStatusParams {
    #[serde(default)]
    session_key: Option<String>,
}

struct SessionStatusMethod {
    store: Arc<SessionStore>,
}

#[async_trait]
impl RpcMethodHandler for SessionStatusMethod {
    async fn handle(&self, _ctx: RpcCallContext, params: Value) -> Result<Value, MethodError> {
        let params: SessionStatusParams = serde_json::from_value(params)
            .map_err(|error| MethodError::invalid_params(error.to_string()))?;
        match params.session_key {
            Some(session_key) => {
                let report = self.store.validate(&session_key);
                Ok(json!({
                    "session_key": session_key,
                    "valid": report.is_valid(),
                    "readable": report.readable,
                    "turns": report.turns,
                    "malformed_lines": report.malformed_lines,
                    "orphan_results": report.orphan_results,
                    "unanswered_calls": report.unanswered_calls,
                }))
            }
            None => {
                let session_keys = self
                    .store
                    .list_session_keys()
                    .map_err(|error| MethodError::internal(error.to_string()))?;
                Ok(json!({ "session_keys": session_keys }))
            }
        }
    }
}

#[derive(Deserialize)]
struct SessionResetParams {
    session_key: String,
}

struct SessionResetMethod {
    store: Arc<SessionStore>,
}

#[async_trait]
impl RpcMethodHandler for SessionResetMethod {
    async fn handle(&self, _ctx: RpcCallContext, params: Value) -> Result<Value, MethodError> {
        let params: SessionResetParams = serde_json::from_value(params)
            .map_err(|error| MethodError::invalid_params(error.to_string()))?;
        match self.store.prune(&params.session_key).await {
            Ok(removed) => Ok(json!({
                "session_key": params.session_key,
                "removed": removed,
            })),
            Err(error) if error.is_retryable() => {
                Err(MethodError::new("session_lock_contention", error.to_string()))
            }
            Err(error) => Err(MethodError::internal(error.to_string())),
        }
    }
}

struct BindingsReloadMethod {
    router: Arc<RouterHandle>,
}

#[async_trait]
impl RpcMethodHandler for BindingsReloadMethod {
    async fn handle(&self, _ctx: RpcCallContext, _params: Value) -> Result<Value, MethodError> {
        let bindings = self
            .router
            .reload()
            .map_err(|error| MethodError::internal(error.to_string()))?;
        Ok(json!({ "bindings": bindings }))
    }
}
