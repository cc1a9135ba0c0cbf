//! Ordered lifecycle-hook dispatch with veto support at cancellable points.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

pub const HOOK_MESSAGE_RECEIVED: &str = "message.received";
pub const HOOK_BEFORE_TOOL: &str = "tool.before";
pub const HOOK_AFTER_TOOL: &str = "tool.after";
pub const HOOK_RUN_END: &str = "run.end";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of dispatching one hook point.
pub enum HookDecision {
    Continue,
    Block { reason: String },
}

impl HookDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, HookDecision::Block { .. })
    }
}

#[async_trait]
/// One hook subscriber. Returning `Block` at a cancellable point vetoes
/// continuation; at non-cancellable points the outcome is recorded and
/// ignored.
pub trait HookHandler: Send + Sync {
    async fn invoke(&self, payload: &Value) -> anyhow::Result<HookDecision>;
}

#[derive(Clone)]
/// Registration of one handler on one named lifecycle point.
pub struct HookRegistration {
    pub hook: String,
    pub priority: i32,
    pub cancellable: bool,
    pub handler: Arc<dyn HookHandler>,
}

impl HookRegistration {
    pub fn new(
        hook: impl Into<String>,
        priority: i32,
        cancellable: bool,
        handler: Arc<dyn HookHandler>,
    ) -> Self {
        Self {
            hook: hook.into(),
            priority,
            cancellable,
            handler,
        }
    }
}

/// Runs registrations for `hook` in ascending priority order (stable for
/// equal priorities). The first veto from a cancellable registration stops
/// dispatch; handler errors are logged and treated as pass.
pub(crate) async fn dispatch_hook(
    registrations: &[HookRegistration],
    hook: &str,
    payload: &Value,
) -> HookDecision {
    for registration in registrations {
        match registration.handler.invoke(payload).await {
            Ok(HookDecision::Block { reason }) if registration.cancellable => {
                return HookDecision::Block { reason };
            }
            Ok(HookDecision::Block { reason }) => {
                warn!(hook, reason, "non-cancellable hook returned block; ignoring");
            }
            Ok(HookDecision::Continue) => {}
            Err(error) => {
                warn!(hook, error = %error, "hook handler failed; continuing");
            }
        }
    }
    HookDecision::Continue
}
