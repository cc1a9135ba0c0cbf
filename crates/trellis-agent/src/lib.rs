//! Agent run executor and subagent registry.
//!
//! One run drives the state machine `Preparing -> Streaming <-> ToolDispatch
//! -> Finalizing -> {Completed | Aborted | Failed}` over a locked session
//! handle. Abort is cooperative: an [`AbortSignal`] raised by any task is
//! observed at every suspension boundary, and partial streamed output is
//! preserved, not discarded. Finalization always runs in the same order:
//! flush unanswered tool results, persist the session, release the lock, fire
//! the end-of-run hook, report the terminal event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod executor;
mod loop_guard;
mod run_events;
mod subagent_registry;

pub use executor::{AgentExecutor, ExecutorConfig, RunError, RunOutcome, RunRequest, RunStatus};
pub use run_events::{RunEvent, RunEventHandler};
pub use subagent_registry::{
    ParentAnnouncer, SubagentLimitExceeded, SubagentLimits, SubagentRecord, SubagentRegistry,
    SubagentSpawn, SubagentState,
};

#[cfg(test)]
mod tests;

/// Cooperative abort flag shared between a run and whoever may cancel it.
///
/// Raising the signal never preempts anything; the executor observes it at
/// suspension boundaries (before each streaming resume and before each tool
/// dispatch) and transitions to Finalizing.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    raised: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests abort and wakes pending waiters. Idempotent.
    pub fn raise(&self) {
        let already_raised = self.raised.swap(true, Ordering::SeqCst);
        if !already_raised {
            self.notify.notify_waiters();
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Resolves once the signal has been raised.
    pub async fn raised(&self) {
        if self.is_raised() {
            return;
        }
        self.notify.notified().await;
    }
}
