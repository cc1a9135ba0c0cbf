use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use trellis_ai::{
    CompletionClient, CompletionError, CompletionRequest, CompletionResponse, CompletionUsage,
    ContentBlock, StreamDeltaHandler, ToolCall, ToolDefinition, Turn,
};
use trellis_registry::{
    CapabilityManifest, CapabilityRegistry, HookDecision, HookHandler, HookRegistration,
    ToolExecutionResult, ToolHandler, HOOK_BEFORE_TOOL, HOOK_RUN_END,
};
use trellis_session::{SessionStore, SessionStoreConfig};

use super::*;

struct ScriptedClient {
    responses: Mutex<VecDeque<CompletionResponse>>,
}

impl ScriptedClient {
    fn new(responses: Vec<CompletionResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
        })
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| CompletionError::Backend("script exhausted".to_string()))
    }
}

/// Emits one delta, then never completes; used to exercise abort mid-stream.
struct StallingClient;

#[async_trait]
impl CompletionClient for StallingClient {
    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        std::future::pending().await
    }

    async fn complete_with_stream(
        &self,
        _request: CompletionRequest,
        on_delta: Option<StreamDeltaHandler>,
    ) -> Result<CompletionResponse, CompletionError> {
        if let Some(handler) = on_delta {
            handler("partial thought".to_string());
        }
        std::future::pending().await
    }
}

struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    async fn execute(&self, arguments: Value) -> ToolExecutionResult {
        ToolExecutionResult::ok(json!({ "echo": arguments }))
    }
}

struct RecordingHook {
    payloads: Arc<Mutex<Vec<Value>>>,
    decision: HookDecision,
}

#[async_trait]
impl HookHandler for RecordingHook {
    async fn invoke(&self, payload: &Value) -> anyhow::Result<HookDecision> {
        self.payloads.lock().expect("payloads lock").push(payload.clone());
        Ok(self.decision.clone())
    }
}

fn text_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        turn: Turn::assistant_text(text),
        finish_reason: Some("stop".to_string()),
        usage: CompletionUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
    }
}

fn tool_call_response(call_id: &str, tool: &str, arguments: Value) -> CompletionResponse {
    CompletionResponse {
        turn: Turn::assistant_blocks(vec![ContentBlock::tool_call(ToolCall {
            id: call_id.to_string(),
            name: tool.to_string(),
            arguments,
        })]),
        finish_reason: Some("tool_use".to_string()),
        usage: CompletionUsage::default(),
    }
}

fn lookup_definition() -> ToolDefinition {
    ToolDefinition {
        name: "lookup".to_string(),
        description: "looks things up".to_string(),
        parameters: json!({
            "type": "object",
            "properties": { "q": { "type": "string" } },
            "required": ["q"],
        }),
    }
}

struct Fixture {
    store: Arc<SessionStore>,
    registry: Arc<CapabilityRegistry>,
    events: Arc<Mutex<Vec<RunEvent>>>,
    _tempdir: tempfile::TempDir,
}

impl Fixture {
    fn new(manifest: CapabilityManifest) -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            SessionStore::open(SessionStoreConfig::new(tempdir.path())).expect("open store"),
        );
        Self {
            store,
            registry: Arc::new(CapabilityRegistry::from_manifest(manifest)),
            events: Arc::new(Mutex::new(Vec::new())),
            _tempdir: tempdir,
        }
    }

    fn executor(&self, client: Arc<dyn CompletionClient>) -> AgentExecutor {
        let mut executor = AgentExecutor::new(
            self.store.clone(),
            self.registry.clone(),
            client,
            ExecutorConfig::new("test-model"),
        );
        let events = self.events.clone();
        executor.set_event_handler(Arc::new(move |event| {
            events.lock().expect("events lock").push(event);
        }));
        executor
    }

    fn events(&self) -> Vec<RunEvent> {
        self.events.lock().expect("events lock").clone()
    }
}

#[tokio::test]
async fn plain_text_run_completes_and_persists() {
    let fixture = Fixture::new(CapabilityManifest::new());
    let executor = fixture.executor(ScriptedClient::new(vec![text_response("hello back")]));

    let request = RunRequest::new("agent:A1:channel:C", "hello").with_system_prompt("be brief");
    let outcome = executor
        .run(request, AbortSignal::new())
        .await
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.output_text, "hello back");
    assert_eq!(outcome.usage.total_tokens, 15);

    let handle = fixture.store.acquire("agent:A1:channel:C").await.expect("acquire");
    let roles: Vec<_> = handle.turns().iter().map(|turn| turn.role).collect();
    assert_eq!(
        roles,
        vec![
            trellis_ai::TurnRole::System,
            trellis_ai::TurnRole::User,
            trellis_ai::TurnRole::Assistant
        ]
    );
}

#[tokio::test]
async fn tool_loop_executes_and_injects_result() {
    let manifest =
        CapabilityManifest::new().register_tool(lookup_definition(), Arc::new(EchoTool));
    let fixture = Fixture::new(manifest);
    let executor = fixture.executor(ScriptedClient::new(vec![
        tool_call_response("call-1", "lookup", json!({ "q": "rust" })),
        text_response("found it"),
    ]));

    let outcome = executor
        .run(RunRequest::new("agent:A1:channel:C", "look it up"), AbortSignal::new())
        .await
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.tool_results, 1);

    let handle = fixture.store.acquire("agent:A1:channel:C").await.expect("acquire");
    let tool_turn = handle
        .turns()
        .iter()
        .find(|turn| turn.role == trellis_ai::TurnRole::Tool)
        .expect("tool turn");
    assert_eq!(tool_turn.tool_call_id.as_deref(), Some("call-1"));
    assert!(!tool_turn.is_error);
    assert!(tool_turn.text_content().contains("rust"));

    let events = fixture.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, RunEvent::ToolStarted { tool_name, .. } if tool_name == "lookup")));
    assert!(matches!(events.last(), Some(RunEvent::RunFinished { .. })));
}

#[tokio::test]
async fn repeated_identical_tool_call_fails_with_loop_detected() {
    let manifest =
        CapabilityManifest::new().register_tool(lookup_definition(), Arc::new(EchoTool));
    let fixture = Fixture::new(manifest);
    let same = || tool_call_response("call-n", "lookup", json!({ "q": "again" }));
    let executor =
        fixture.executor(ScriptedClient::new(vec![same(), same(), same(), same(), same()]));

    let outcome = executor
        .run(RunRequest::new("agent:A1:channel:C", "loop"), AbortSignal::new())
        .await
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome
        .failure_reason
        .as_deref()
        .expect("reason")
        .contains("loop detected"));

    // Lock released and every call paired, despite the failure.
    assert!(fixture.store.acquire("agent:A1:channel:C").await.is_ok());
    assert!(fixture.store.validate("agent:A1:channel:C").is_valid());
}

#[tokio::test]
async fn abort_mid_stream_preserves_partial_output() {
    let fixture = Fixture::new(CapabilityManifest::new());
    let executor = fixture.executor(Arc::new(StallingClient));
    let abort = AbortSignal::new();

    let raiser = {
        let abort = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.raise();
        })
    };

    let outcome = executor
        .run(RunRequest::new("agent:A1:channel:C", "think"), abort)
        .await
        .expect("run");
    raiser.await.expect("join");

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.output_text, "partial thought");

    let handle = fixture.store.acquire("agent:A1:channel:C").await.expect("acquire");
    let last = handle.turns().last().expect("last turn");
    assert_eq!(last.role, trellis_ai::TurnRole::Assistant);
    assert_eq!(last.text_content(), "partial thought");
}

#[tokio::test]
async fn before_tool_hook_veto_injects_error_result() {
    let payloads = Arc::new(Mutex::new(Vec::new()));
    let manifest = CapabilityManifest::new()
        .register_tool(lookup_definition(), Arc::new(EchoTool))
        .register_hook(HookRegistration::new(
            HOOK_BEFORE_TOOL,
            0,
            true,
            Arc::new(RecordingHook {
                payloads: payloads.clone(),
                decision: HookDecision::Block {
                    reason: "policy says no".to_string(),
                },
            }),
        ));
    let fixture = Fixture::new(manifest);
    let executor = fixture.executor(ScriptedClient::new(vec![
        tool_call_response("call-1", "lookup", json!({ "q": "secret" })),
        text_response("understood"),
    ]));

    let outcome = executor
        .run(RunRequest::new("agent:A1:channel:C", "try"), AbortSignal::new())
        .await
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    let handle = fixture.store.acquire("agent:A1:channel:C").await.expect("acquire");
    let tool_turn = handle
        .turns()
        .iter()
        .find(|turn| turn.role == trellis_ai::TurnRole::Tool)
        .expect("tool turn");
    assert!(tool_turn.is_error);
    assert!(tool_turn.text_content().contains("policy says no"));
    assert_eq!(payloads.lock().expect("payloads lock").len(), 1);
}

#[tokio::test]
async fn unregistered_tool_and_invalid_arguments_become_error_results() {
    let manifest =
        CapabilityManifest::new().register_tool(lookup_definition(), Arc::new(EchoTool));
    let fixture = Fixture::new(manifest);
    let executor = fixture.executor(ScriptedClient::new(vec![
        tool_call_response("call-1", "no.such.tool", json!({})),
        tool_call_response("call-2", "lookup", json!({ "q": 7 })),
        text_response("done"),
    ]));

    let outcome = executor
        .run(RunRequest::new("agent:A1:channel:C", "go"), AbortSignal::new())
        .await
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    let handle = fixture.store.acquire("agent:A1:channel:C").await.expect("acquire");
    let tool_turns: Vec<_> = handle
        .turns()
        .iter()
        .filter(|turn| turn.role == trellis_ai::TurnRole::Tool)
        .collect();
    assert_eq!(tool_turns.len(), 2);
    assert!(tool_turns[0].text_content().contains("not registered"));
    assert!(tool_turns[1].text_content().contains("invalid arguments"));
    assert!(tool_turns.iter().all(|turn| turn.is_error));
}

#[tokio::test]
async fn run_end_hook_receives_terminal_status_and_usage() {
    let payloads = Arc::new(Mutex::new(Vec::new()));
    let manifest = CapabilityManifest::new().register_hook(HookRegistration::new(
        HOOK_RUN_END,
        0,
        false,
        Arc::new(RecordingHook {
            payloads: payloads.clone(),
            decision: HookDecision::Continue,
        }),
    ));
    let fixture = Fixture::new(manifest);
    let executor = fixture.executor(ScriptedClient::new(vec![text_response("bye")]));

    executor
        .run(RunRequest::new("agent:A1:channel:C", "hi"), AbortSignal::new())
        .await
        .expect("run");

    let payloads = payloads.lock().expect("payloads lock");
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["status"], "completed");
    assert_eq!(payloads[0]["usage"]["total_tokens"], 15);
}

#[tokio::test]
async fn lock_contention_surfaces_as_retryable_error() {
    let fixture = Fixture::new(CapabilityManifest::new());
    let executor = fixture.executor(ScriptedClient::new(vec![text_response("never sent")]));

    let _held = fixture.store.acquire("agent:A1:channel:C").await.expect("acquire");
    let error = executor
        .run(RunRequest::new("agent:A1:channel:C", "hi"), AbortSignal::new())
        .await
        .expect_err("contended run");
    assert!(error.is_retryable());
    assert!(fixture.events().is_empty());
}

#[test]
fn subagent_depth_ceiling_rejects_grandchildren() {
    let registry = SubagentRegistry::new(SubagentLimits {
        max_spawn_depth: 1,
        ..SubagentLimits::default()
    });

    let child = registry.spawn("run-root", 0, "agent-child").expect("spawn");
    assert_eq!(child.depth, 1);

    let rejected = registry.spawn(&child.run_id, child.depth, "agent-grandchild");
    assert_eq!(
        rejected,
        Err(SubagentLimitExceeded::DepthExceeded {
            requested: 2,
            max: 1
        })
    );
}

#[test]
fn subagent_fan_out_cap_frees_on_finish() {
    let registry = SubagentRegistry::new(SubagentLimits {
        max_spawn_depth: 3,
        max_children_per_parent: 2,
        ..SubagentLimits::default()
    });

    let first = registry.spawn("run-root", 0, "agent-a").expect("spawn");
    let second = registry.spawn("run-root", 0, "agent-b").expect("spawn");
    assert_ne!(first.session_key, second.session_key);

    let rejected = registry.spawn("run-root", 0, "agent-c");
    assert!(matches!(
        rejected,
        Err(SubagentLimitExceeded::FanOutExceeded { active: 2, .. })
    ));

    registry
        .mark_finished(&first.run_id, SubagentState::Completed)
        .expect("mark finished");
    assert!(registry.spawn("run-root", 0, "agent-c").is_ok());
}

#[test]
fn sweep_removes_only_expired_non_active_records() {
    let registry = SubagentRegistry::new(SubagentLimits {
        max_spawn_depth: 3,
        retention: Duration::from_secs(3_600),
        ..SubagentLimits::default()
    });

    let finished = registry.spawn("run-root", 0, "agent-a").expect("spawn");
    let active = registry.spawn("run-root", 0, "agent-b").expect("spawn");
    registry
        .mark_finished(&finished.run_id, SubagentState::Completed)
        .expect("mark finished");

    let now = trellis_core::current_unix_timestamp_ms();
    assert_eq!(registry.sweep(now), 0);
    assert_eq!(registry.sweep(now + 3_600_000 + 1), 1);
    assert!(registry.record(&finished.run_id).is_none());
    assert!(registry.record(&active.run_id).is_some());
}

#[tokio::test]
async fn announcement_retries_then_reports_failure() {
    struct FailingAnnouncer {
        attempts: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl ParentAnnouncer for FailingAnnouncer {
        async fn announce(
            &self,
            _record: &SubagentRecord,
            _summary: &str,
        ) -> anyhow::Result<()> {
            *self.attempts.lock().expect("attempts lock") += 1;
            anyhow::bail!("parent unreachable")
        }
    }

    let registry = SubagentRegistry::new(SubagentLimits::default());
    let spawn = registry.spawn("run-root", 0, "agent-a").expect("spawn");
    registry
        .mark_finished(&spawn.run_id, SubagentState::Completed)
        .expect("mark finished");

    let attempts = Arc::new(Mutex::new(0));
    let announcer = FailingAnnouncer {
        attempts: attempts.clone(),
    };
    let announced = registry
        .announce_completion(&announcer, &spawn.run_id, "all done", 2)
        .await;

    assert!(!announced);
    assert_eq!(*attempts.lock().expect("attempts lock"), 2);
}
