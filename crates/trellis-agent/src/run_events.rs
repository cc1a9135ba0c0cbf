//! Run lifecycle events published toward the event broadcaster.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::executor::RunStatus;
use trellis_ai::CompletionUsage;

/// Handler invoked with each run event, in generation order.
pub type RunEventHandler = Arc<dyn Fn(RunEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
/// Events emitted over the lifetime of one agent run.
pub enum RunEvent {
    RunStarted {
        run_id: String,
        session_key: String,
    },
    StreamDelta {
        run_id: String,
        text: String,
    },
    ToolStarted {
        run_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolFinished {
        run_id: String,
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },
    RunFinished {
        run_id: String,
        session_key: String,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
        usage: CompletionUsage,
    },
}

impl RunEvent {
    /// Run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StreamDelta { run_id, .. }
            | RunEvent::ToolStarted { run_id, .. }
            | RunEvent::ToolFinished { run_id, .. }
            | RunEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}
