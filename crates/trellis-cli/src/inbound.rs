//! Inbound pipeline: channel event to routed agent run to delivered reply.

use anyhow::Result;
use tracing::warn;
use trellis_agent::{RunOutcome, RunRequest};
use trellis_channel::{DeliveryTarget, InboundEvent, OutboundReport};
use trellis_registry::{HookDecision, HOOK_MESSAGE_RECEIVED};
use trellis_routing::resolve_route;

use crate::bootstrap::TrellisRuntime;

/// Terminal state of one inbound event through the pipeline.
#[derive(Debug)]
pub enum InboundDisposition {
    /// The run reached a terminal state; delivery ran when there was output.
    Ran {
        outcome: RunOutcome,
        delivery: Option<OutboundReport>,
    },
    /// A message-received hook vetoed processing.
    Blocked { reason: String },
    /// No binding matched and no default agent is configured.
    Unrouted,
}

/// Drives one inbound event end to end: hook gate, route resolution, agent
/// run, outbound delivery of the produced text.
///
/// Unrouted and blocked events are audited and dropped; neither is an error.
/// A failed delivery does not fail the run that produced the text.
pub async fn handle_inbound(
    runtime: &TrellisRuntime,
    event: InboundEvent,
) -> Result<InboundDisposition> {
    let payload = serde_json::to_value(&event)?;
    if let HookDecision::Block { reason } = runtime
        .registry
        .dispatch_hook(HOOK_MESSAGE_RECEIVED, &payload)
        .await
    {
        warn!(
            channel_id = %event.channel_id,
            peer_id = %event.peer_id,
            reason,
            "inbound message blocked by hook"
        );
        return Ok(InboundDisposition::Blocked { reason });
    }

    let table = runtime.router.current();
    let resolution = match resolve_route(&event, &table) {
        Ok(resolution) => resolution,
        Err(_) => {
            warn!(
                channel_id = %event.channel_id,
                peer_id = %event.peer_id,
                "no binding matched inbound message; dropping"
            );
            return Ok(InboundDisposition::Unrouted);
        }
    };

    let mut request = RunRequest::new(resolution.session_key.clone(), event.text.clone());
    request.system_prompt = runtime.config.agent.system_prompt.clone();
    let abort = runtime.runs.register(&request.run_id);
    let run_id = request.run_id.clone();
    let outcome = runtime.executor.run(request, abort).await;
    runtime.runs.finish(&run_id);
    let outcome = outcome?;

    let delivery = if outcome.output_text.is_empty() {
        None
    } else {
        deliver_reply(runtime, &event, &outcome.output_text).await
    };

    Ok(InboundDisposition::Ran { outcome, delivery })
}

async fn deliver_reply(
    runtime: &TrellisRuntime,
    event: &InboundEvent,
    text: &str,
) -> Option<OutboundReport> {
    let Some(adapter) = runtime.registry.channel(&event.channel_id) else {
        warn!(
            channel_id = %event.channel_id,
            "no channel adapter registered for reply delivery"
        );
        return None;
    };
    let target = DeliveryTarget {
        channel_id: event.channel_id.clone(),
        peer_id: event.peer_id.clone(),
        guild_id: event.guild_id.clone(),
    };
    match runtime.delivery.deliver(adapter.as_ref(), &target, text).await {
        Ok(report) => Some(report),
        Err(error) => {
            warn!(
                channel_id = %event.channel_id,
                peer_id = %event.peer_id,
                error = %error,
                "reply delivery failed"
            );
            None
        }
    }
}
