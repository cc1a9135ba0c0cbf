//! The run state machine: streaming, tool dispatch, and finalization.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;
use trellis_ai::{
    CompletionClient, CompletionRequest, CompletionUsage, StreamDeltaHandler, ToolCall,
    ToolDefinition, Turn,
};
use trellis_core::next_id;
use trellis_registry::{
    CapabilityRegistry, HookDecision, ToolExecutionResult, ToolHandler, HOOK_AFTER_TOOL,
    HOOK_BEFORE_TOOL, HOOK_RUN_END,
};
use trellis_session::{SessionError, SessionHandle, SessionStore};

use crate::loop_guard::ToolLoopGuard;
use crate::run_events::{RunEvent, RunEventHandler};
use crate::AbortSignal;

#[derive(Debug, Clone)]
/// Per-executor tuning. One executor drives many runs with one config.
pub struct ExecutorConfig {
    pub model: String,
    /// Upper bound on completion round-trips within one run.
    pub max_turns: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Identical tool invocations tolerated before the run fails.
    pub loop_detection_threshold: usize,
    pub tool_timeout: Option<Duration>,
}

impl ExecutorConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_turns: 16,
            max_tokens: None,
            temperature: None,
            loop_detection_threshold: 3,
            tool_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone)]
/// One unit of work handed to the executor.
pub struct RunRequest {
    pub run_id: String,
    pub session_key: String,
    /// Assembled by collaborators; seeded only into a fresh session.
    pub system_prompt: Option<String>,
    pub user_text: String,
}

impl RunRequest {
    pub fn new(session_key: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            run_id: next_id("run"),
            session_key: session_key.into(),
            system_prompt: None,
            user_text: user_text.into(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Terminal state of one run.
pub enum RunStatus {
    Completed,
    Aborted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// What one run produced. Aborted runs keep the partial output streamed
/// before the abort was observed.
pub struct RunOutcome {
    pub run_id: String,
    pub session_key: String,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub output_text: String,
    pub usage: CompletionUsage,
    pub tool_results: usize,
}

#[derive(Debug, Error)]
/// Failures that prevent a run from starting at all. Everything after the
/// session lock is held resolves to a [`RunOutcome`], never an error.
pub enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RunError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::Session(error) => error.is_retryable(),
        }
    }
}

enum Terminal {
    Completed,
    Aborted,
    Failed(String),
}

/// Drives agent runs over the session store, capability registry, and the
/// external completion backend.
pub struct AgentExecutor {
    store: Arc<SessionStore>,
    registry: Arc<CapabilityRegistry>,
    client: Arc<dyn CompletionClient>,
    config: ExecutorConfig,
    events: Option<RunEventHandler>,
}

impl AgentExecutor {
    pub fn new(
        store: Arc<SessionStore>,
        registry: Arc<CapabilityRegistry>,
        client: Arc<dyn CompletionClient>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            client,
            config,
            events: None,
        }
    }

    pub fn set_event_handler(&mut self, handler: RunEventHandler) {
        self.events = Some(handler);
    }

    /// Executes one run to its terminal state.
    ///
    /// Lock contention surfaces as a retryable [`RunError`] before anything
    /// has happened. Once the session handle is held, every path goes through
    /// finalization: unanswered tool calls are flushed as error results, the
    /// session is persisted, the lock released, the end-of-run hook fired,
    /// and the terminal event emitted, in that order.
    pub async fn run(
        &self,
        request: RunRequest,
        abort: AbortSignal,
    ) -> Result<RunOutcome, RunError> {
        let mut handle = self.store.acquire(&request.session_key).await?;
        self.emit(RunEvent::RunStarted {
            run_id: request.run_id.clone(),
            session_key: request.session_key.clone(),
        });

        if handle.turns().is_empty() {
            if let Some(system_prompt) = &request.system_prompt {
                handle.append_turn(Turn::system(system_prompt.clone()));
            }
        }
        handle.append_turn(Turn::user(request.user_text.clone()));

        let mut usage = CompletionUsage::default();
        let mut output = String::new();
        let mut tool_results = 0usize;
        let terminal = self
            .drive(
                &request,
                &abort,
                &mut handle,
                &mut usage,
                &mut output,
                &mut tool_results,
            )
            .await;
        Ok(self
            .finalize(request, handle, terminal, usage, output, tool_results)
            .await)
    }

    async fn drive(
        &self,
        request: &RunRequest,
        abort: &AbortSignal,
        handle: &mut SessionHandle,
        usage: &mut CompletionUsage,
        output: &mut String,
        tool_results: &mut usize,
    ) -> Terminal {
        let tools = self.registry.tool_definitions();
        let mut loop_guard = ToolLoopGuard::new(self.config.loop_detection_threshold);

        for _ in 0..self.config.max_turns {
            if abort.is_raised() {
                return Terminal::Aborted;
            }

            let completion_request = CompletionRequest {
                model: self.config.model.clone(),
                turns: handle.turns().to_vec(),
                tools: tools.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };
            let streamed = Arc::new(Mutex::new(String::new()));
            let on_delta = self.stream_delta_handler(&request.run_id, streamed.clone());

            let completion = tokio::select! {
                _ = abort.raised() => {
                    let partial = streamed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    if !partial.is_empty() {
                        append_output(output, &partial);
                        handle.append_turn(Turn::assistant_text(partial));
                    }
                    return Terminal::Aborted;
                }
                result = self
                    .client
                    .complete_with_stream(completion_request, Some(on_delta)) => result,
            };
            let response = match completion {
                Ok(response) => response,
                Err(error) => {
                    return Terminal::Failed(format!("completion backend failed: {error}"))
                }
            };

            usage.accumulate(&response.usage);
            let assistant = response.turn;
            let assistant_text = assistant.text_content();
            if !assistant_text.is_empty() {
                append_output(output, &assistant_text);
            }
            let tool_calls = assistant.tool_calls();
            handle.append_turn(assistant);

            if tool_calls.is_empty() {
                return Terminal::Completed;
            }

            for index in 0..tool_calls.len() {
                let call = tool_calls[index].clone();
                if abort.is_raised() {
                    flush_skipped_calls(
                        handle,
                        &tool_calls[index..],
                        "run aborted before this tool call executed",
                    );
                    return Terminal::Aborted;
                }
                if let Some(count) = loop_guard.observe(&call) {
                    flush_skipped_calls(
                        handle,
                        &tool_calls[index..],
                        "repeated identical tool invocation",
                    );
                    return Terminal::Failed(format!(
                        "loop detected: tool '{}' invoked identically {count} times",
                        call.name
                    ));
                }

                self.emit(RunEvent::ToolStarted {
                    run_id: request.run_id.clone(),
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let result = self.dispatch_tool_call(request, abort, &call).await;
                let is_error = result.is_error;
                handle.append_turn(Turn::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    result.as_text(),
                    is_error,
                ));
                *tool_results += 1;
                self.emit(RunEvent::ToolFinished {
                    run_id: request.run_id.clone(),
                    tool_call_id: call.id,
                    tool_name: call.name,
                    is_error,
                });
            }
        }
        Terminal::Failed("turn budget exhausted before the run completed".to_string())
    }

    /// Before-tool hook, lookup, argument validation, bounded execution,
    /// after-tool hook. Every failure mode collapses into an error result
    /// injected back into the model context.
    async fn dispatch_tool_call(
        &self,
        request: &RunRequest,
        abort: &AbortSignal,
        call: &ToolCall,
    ) -> ToolExecutionResult {
        let before_payload = json!({
            "run_id": request.run_id,
            "session_key": request.session_key,
            "tool_call_id": call.id,
            "tool_name": call.name,
            "arguments": call.arguments,
        });
        if let HookDecision::Block { reason } = self
            .registry
            .dispatch_hook(HOOK_BEFORE_TOOL, &before_payload)
            .await
        {
            return ToolExecutionResult::error(json!({
                "error": format!("tool call blocked: {reason}")
            }));
        }

        let result = match self.registry.tool(&call.name) {
            None => ToolExecutionResult::error(json!({
                "error": format!("tool '{}' is not registered", call.name)
            })),
            Some((definition, handler)) => {
                match validate_tool_arguments(&definition, &call.arguments) {
                    Err(message) => ToolExecutionResult::error(json!({ "error": message })),
                    Ok(()) => {
                        self.execute_bounded(abort, &definition, handler, call.arguments.clone())
                            .await
                    }
                }
            }
        };

        let after_payload = json!({
            "run_id": request.run_id,
            "session_key": request.session_key,
            "tool_call_id": call.id,
            "tool_name": call.name,
            "is_error": result.is_error,
            "content": result.content,
        });
        if let HookDecision::Block { reason } = self
            .registry
            .dispatch_hook(HOOK_AFTER_TOOL, &after_payload)
            .await
        {
            warn!(tool_name = %call.name, reason, "after-tool hook block has no effect");
        }
        result
    }

    async fn execute_bounded(
        &self,
        abort: &AbortSignal,
        definition: &ToolDefinition,
        handler: Arc<dyn ToolHandler>,
        arguments: Value,
    ) -> ToolExecutionResult {
        let tool_name = definition.name.clone();
        let tool_timeout = self.config.tool_timeout;
        let execution = async move {
            if let Some(timeout) = tool_timeout {
                match tokio::time::timeout(timeout, handler.execute(arguments)).await {
                    Ok(result) => result,
                    Err(_) => ToolExecutionResult::error(json!({
                        "error": format!(
                            "tool '{tool_name}' timed out after {}ms",
                            timeout.as_millis()
                        )
                    })),
                }
            } else {
                handler.execute(arguments).await
            }
        };

        tokio::select! {
            _ = abort.raised() => ToolExecutionResult::error(json!({
                "error": format!("tool '{}' cancelled", definition.name)
            })),
            result = execution => result,
        }
    }

    /// Mandatory ordering: persist, release lock, end-of-run hook, terminal
    /// event. A persist failure downgrades the run to Failed but still walks
    /// the rest of the sequence.
    async fn finalize(
        &self,
        request: RunRequest,
        handle: SessionHandle,
        terminal: Terminal,
        usage: CompletionUsage,
        output: String,
        tool_results: usize,
    ) -> RunOutcome {
        let (mut status, mut failure_reason) = match terminal {
            Terminal::Completed => (RunStatus::Completed, None),
            Terminal::Aborted => (RunStatus::Aborted, None),
            Terminal::Failed(reason) => (RunStatus::Failed, Some(reason)),
        };

        if let Err(error) = handle.persist() {
            warn!(
                session_key = %request.session_key,
                error = %error,
                "failed to persist session during finalization"
            );
            if status != RunStatus::Failed {
                status = RunStatus::Failed;
                failure_reason = Some(format!("session persist failed: {error}"));
            }
        }
        drop(handle);

        let end_payload = json!({
            "run_id": request.run_id,
            "session_key": request.session_key,
            "status": status.as_str(),
            "failure_reason": failure_reason,
            "usage": usage,
            "tool_results": tool_results,
        });
        self.registry.dispatch_hook(HOOK_RUN_END, &end_payload).await;

        self.emit(RunEvent::RunFinished {
            run_id: request.run_id.clone(),
            session_key: request.session_key.clone(),
            status,
            failure_reason: failure_reason.clone(),
            usage: usage.clone(),
        });

        RunOutcome {
            run_id: request.run_id,
            session_key: request.session_key,
            status,
            failure_reason,
            output_text: output,
            usage,
            tool_results,
        }
    }

    fn stream_delta_handler(&self, run_id: &str, streamed: Arc<Mutex<String>>) -> StreamDeltaHandler {
        let events = self.events.clone();
        let run_id = run_id.to_string();
        Arc::new(move |delta: String| {
            streamed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_str(&delta);
            if let Some(handler) = &events {
                handler(RunEvent::StreamDelta {
                    run_id: run_id.clone(),
                    text: delta,
                });
            }
        })
    }

    fn emit(&self, event: RunEvent) {
        if let Some(handler) = &self.events {
            handler(event);
        }
    }
}

/// Pairs every remaining tool call with an error result so the session never
/// finalizes with an unanswered call.
fn flush_skipped_calls(handle: &mut SessionHandle, calls: &[ToolCall], reason: &str) {
    for call in calls {
        handle.append_turn(Turn::tool_result(
            call.id.clone(),
            call.name.clone(),
            reason,
            true,
        ));
    }
}

fn validate_tool_arguments(definition: &ToolDefinition, arguments: &Value) -> Result<(), String> {
    let validator = validator_for(&definition.parameters)
        .map_err(|error| format!("invalid JSON schema for '{}': {error}", definition.name))?;
    let mut errors = validator.iter_errors(arguments);
    if let Some(first) = errors.next() {
        return Err(format!(
            "invalid arguments for '{}': {}",
            definition.name, first
        ));
    }
    Ok(())
}

fn append_output(output: &mut String, text: &str) {
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(text);
}
