//! Boot wiring: opens the state directory, assembles the capability
//! registry, and starts the gateway transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trellis_access::{DeviceNonceWindow, DEVICE_NONCE_ROTATION_MS_DEFAULT};
use trellis_agent::{
    AbortSignal, AgentExecutor, ExecutorConfig, RunEvent, SubagentLimits, SubagentRegistry,
};
use trellis_ai::{CompletionClient, OpenAiCompatClient, OpenAiCompatConfig};
use trellis_channel::{OutboundDelivery, OutboundDeliveryConfig};
use trellis_core::current_unix_timestamp_ms;
use trellis_gateway::{ConnectionRegistry, GatewayServer, GatewayServerConfig};
use trellis_registry::{CapabilityManifest, CapabilityRegistry};
use trellis_routing::{load_binding_table, BindingTable, BINDING_TABLE_FILE_NAME};
use trellis_session::{SessionStore, SessionStoreConfig};

use crate::cli_args::Cli;
use crate::config::{apply_cli_overrides, load_config, TrellisConfig};
use crate::core_methods::register_core_methods;

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Abort signals of in-flight runs, keyed by run id.
#[derive(Default)]
pub struct RunTracker {
    runs: Mutex<HashMap<String, AbortSignal>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: &str) -> AbortSignal {
        let signal = AbortSignal::new();
        self.lock().insert(run_id.to_string(), signal.clone());
        signal
    }

    pub fn finish(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    /// Raises the abort signal of a tracked run. Returns false when the run
    /// id is unknown or already finished.
    pub fn abort(&self, run_id: &str) -> bool {
        match self.lock().get(run_id) {
            Some(signal) => {
                signal.raise();
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AbortSignal>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hot-reloadable binding table. Readers take the current snapshot; a reload
/// swaps the whole table atomically.
pub struct RouterHandle {
    path: PathBuf,
    table: ArcSwap<BindingTable>,
}

impl RouterHandle {
    pub fn load(path: PathBuf) -> Result<Self> {
        let table = load_binding_table(&path)?;
        Ok(Self {
            path,
            table: ArcSwap::from_pointee(table),
        })
    }

    pub fn current(&self) -> Arc<BindingTable> {
        self.table.load_full()
    }

    /// Re-reads the binding file and swaps the table in. Returns the number
    /// of bindings now active.
    pub fn reload(&self) -> Result<usize> {
        let table = load_binding_table(&self.path)?;
        let count = table.bindings.len();
        self.table.store(Arc::new(table));
        Ok(count)
    }
}

/// Everything the daemon wires together at boot.
pub struct TrellisRuntime {
    pub config: TrellisConfig,
    pub store: Arc<SessionStore>,
    pub registry: Arc<CapabilityRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub executor: Arc<AgentExecutor>,
    pub runs: Arc<RunTracker>,
    pub router: Arc<RouterHandle>,
    pub subagents: Arc<SubagentRegistry>,
    pub delivery: Arc<OutboundDelivery>,
    pub started_unix_ms: u64,
}

impl TrellisRuntime {
    /// Builds the runtime with the configured HTTP completion backend.
    pub fn build(config: TrellisConfig, capabilities: CapabilityManifest) -> Result<Arc<Self>> {
        let api_key = std::env::var(&config.completion.api_key_env).with_context(|| {
            format!(
                "completion api key environment variable {} is not set",
                config.completion.api_key_env
            )
        })?;
        let mut client_config = OpenAiCompatConfig::new(&config.completion.api_base, api_key);
        client_config.request_timeout = Duration::from_secs(config.completion.request_timeout_secs);
        client_config.max_retries = config.completion.max_retries;
        let client =
            OpenAiCompatClient::new(client_config).context("failed to build completion client")?;
        Self::build_with_client(config, capabilities, Arc::new(client))
    }

    /// Builds the runtime around an injected completion backend; tests use
    /// this with in-memory fakes.
    pub fn build_with_client(
        config: TrellisConfig,
        capabilities: CapabilityManifest,
        client: Arc<dyn CompletionClient>,
    ) -> Result<Arc<Self>> {
        let mut store_config = SessionStoreConfig::new(config.session.state_dir.clone());
        store_config.max_turns = config.session.max_turns;
        store_config.lock_policy = config.session.lock_policy()?;
        // Opening the state dir is one of the two process-fatal boot steps;
        // the other is binding the transport.
        let store = Arc::new(SessionStore::open(store_config)?);

        let router = Arc::new(RouterHandle::load(
            config.session.state_dir.join(BINDING_TABLE_FILE_NAME),
        )?);

        let delivery = Arc::new(OutboundDelivery::new(OutboundDeliveryConfig {
            dedupe_window_ms: config.delivery.dedupe_window_ms,
            max_send_attempts: config.delivery.max_send_attempts,
            state_dir: Some(config.session.state_dir.clone()),
            ..OutboundDeliveryConfig::default()
        }));

        let subagents = Arc::new(SubagentRegistry::new(SubagentLimits {
            max_spawn_depth: config.subagents.max_spawn_depth,
            max_children_per_parent: config.subagents.max_children_per_parent,
            retention: Duration::from_secs(config.subagents.retention_secs),
        }));

        let connections = Arc::new(ConnectionRegistry::new());
        let runs = Arc::new(RunTracker::new());

        // The executor needs the registry and the core RPC methods need the
        // executor, so the registry starts empty and the full manifest is
        // swapped in once every handler exists.
        let registry = Arc::new(CapabilityRegistry::from_manifest(CapabilityManifest::new()));

        let mut executor_config = ExecutorConfig::new(config.agent.model.clone());
        executor_config.max_turns = config.agent.max_turns;
        executor_config.max_tokens = config.agent.max_tokens;
        executor_config.temperature = config.agent.temperature;
        executor_config.loop_detection_threshold = config.agent.loop_detection_threshold;
        executor_config.tool_timeout = Some(Duration::from_secs(config.agent.tool_timeout_secs));

        let mut executor =
            AgentExecutor::new(store.clone(), registry.clone(), client, executor_config);
        let event_connections = connections.clone();
        executor.set_event_handler(Arc::new(move |event| {
            let (name, payload) = run_event_wire(&event);
            event_connections.broadcast(name, payload);
        }));
        let executor = Arc::new(executor);

        let runtime = Arc::new(Self {
            config,
            store,
            registry,
            connections,
            executor,
            runs,
            router,
            subagents,
            delivery,
            started_unix_ms: current_unix_timestamp_ms(),
        });

        let manifest = register_core_methods(capabilities, &runtime);
        runtime.registry.swap(manifest);
        Ok(runtime)
    }

    fn server_config(&self) -> GatewayServerConfig {
        let mut server = GatewayServerConfig::new(self.config.gateway.bind_addr.clone());
        server.server_name = self.config.gateway.server_name.clone();
        server.heartbeat_interval = Duration::from_secs(self.config.gateway.heartbeat_interval_secs);
        server.stale_after = Duration::from_secs(self.config.gateway.stale_after_secs);
        server.handshake_timeout = Duration::from_secs(self.config.gateway.handshake_timeout_secs);
        server
    }

    fn nonce_window(&self) -> DeviceNonceWindow {
        DeviceNonceWindow::new(self.nonce_seed(), DEVICE_NONCE_ROTATION_MS_DEFAULT)
    }

    fn nonce_seed(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match &self.config.gateway.nonce_secret {
            Some(secret) => hasher.update(secret.as_bytes()),
            None => {
                hasher.update(self.config.gateway.server_name.as_bytes());
                hasher.update(self.started_unix_ms.to_le_bytes());
                hasher.update(std::process::id().to_le_bytes());
            }
        }
        hasher.finalize().into()
    }

    /// Runs the daemon until the transport fails or shutdown is requested.
    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        self.subagents
            .spawn_sweeper(Duration::from_secs(self.config.subagents.sweep_interval_secs));

        let server = GatewayServer::new(
            self.server_config(),
            self.config.access.clone(),
            self.nonce_window(),
            self.registry.clone(),
            self.connections.clone(),
        );
        info!(
            bind_addr = %self.config.gateway.bind_addr,
            state_dir = %self.config.session.state_dir.display(),
            "gateway starting"
        );

        tokio::select! {
            result = server.serve() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                Ok(())
            }
        }
    }
}

/// Maps a run event to its wire event name and payload. The payload mirrors
/// the event fields minus the discriminant the name already carries.
pub fn run_event_wire(event: &RunEvent) -> (&'static str, Value) {
    let name = match event {
        RunEvent::RunStarted { .. } => "run.started",
        RunEvent::StreamDelta { .. } => "run.delta",
        RunEvent::ToolStarted { .. } => "run.tool.started",
        RunEvent::ToolFinished { .. } => "run.tool.finished",
        RunEvent::RunFinished { .. } => "run.finished",
    };
    let mut payload = serde_json::to_value(event).unwrap_or(Value::Null);
    if let Some(object) = payload.as_object_mut() {
        object.remove("event");
    }
    (name, payload)
}

/// Entry point behind `main`: parse flags, load config, build, serve.
pub async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config)?;
    apply_cli_overrides(&mut config, &cli);
    let runtime = TrellisRuntime::build(config, CapabilityManifest::new())?;
    if let Err(error) = runtime.serve().await {
        warn!(error = %error, "gateway exited with error");
        return Err(error);
    }
    Ok(())
}
