//! TOML configuration for the gateway daemon.
//!
//! A missing config file yields the built-in defaults so a first run works
//! from an empty directory; a file that exists but cannot be read or parsed
//! is a startup failure, not a silent fallback.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use trellis_access::AccessPolicy;
use trellis_session::LockPolicy;

use crate::cli_args::Cli;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrellisConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub access: AccessPolicy,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub completion: CompletionSection,
    #[serde(default)]
    pub subagents: SubagentSection,
    #[serde(default)]
    pub delivery: DeliverySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Seed material for the rotating device-token nonce. Absent means a
    /// per-process seed; paired devices then re-pair after a restart.
    #[serde(default)]
    pub nonce_secret: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            server_name: default_server_name(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            nonce_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_session_max_turns")]
    pub max_turns: usize,
    /// `fail-fast` (default) or `queue`.
    #[serde(default = "default_lock_mode")]
    pub lock_mode: String,
    #[serde(default = "default_lock_max_waiters")]
    pub lock_max_waiters: usize,
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub lock_wait_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_turns: default_session_max_turns(),
            lock_mode: default_lock_mode(),
            lock_max_waiters: default_lock_max_waiters(),
            lock_wait_timeout_ms: default_lock_wait_timeout_ms(),
        }
    }
}

impl SessionSection {
    pub fn lock_policy(&self) -> Result<LockPolicy> {
        match self.lock_mode.as_str() {
            "fail-fast" => Ok(LockPolicy::FailFast),
            "queue" => Ok(LockPolicy::Queue {
                max_waiters: self.lock_max_waiters,
                wait_timeout: Duration::from_millis(self.lock_wait_timeout_ms),
            }),
            other => bail!("unsupported session lock_mode '{other}' (expected fail-fast|queue)"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_agent_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_loop_detection_threshold")]
    pub loop_detection_threshold: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: None,
            max_turns: default_agent_max_turns(),
            max_tokens: None,
            temperature: None,
            loop_detection_threshold: default_loop_detection_threshold(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionSection {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Environment variable the API key is read from at boot.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_completion_max_retries")]
    pub max_retries: usize,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_completion_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubagentSection {
    #[serde(default = "default_max_spawn_depth")]
    pub max_spawn_depth: usize,
    #[serde(default = "default_max_children_per_parent")]
    pub max_children_per_parent: usize,
    #[serde(default = "default_subagent_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_subagent_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for SubagentSection {
    fn default() -> Self {
        Self {
            max_spawn_depth: default_max_spawn_depth(),
            max_children_per_parent: default_max_children_per_parent(),
            retention_secs: default_subagent_retention_secs(),
            sweep_interval_secs: default_subagent_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliverySection {
    #[serde(default = "default_dedupe_window_ms")]
    pub dedupe_window_ms: u64,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: usize,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            dedupe_window_ms: default_dedupe_window_ms(),
            max_send_attempts: default_max_send_attempts(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:7410".to_string()
}

fn default_server_name() -> String {
    "trellis-gateway".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    90
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_session_max_turns() -> usize {
    200
}

fn default_lock_mode() -> String {
    "fail-fast".to_string()
}

fn default_lock_max_waiters() -> usize {
    8
}

fn default_lock_wait_timeout_ms() -> u64 {
    5_000
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_agent_max_turns() -> usize {
    16
}

fn default_loop_detection_threshold() -> usize {
    3
}

fn default_tool_timeout_secs() -> u64 {
    120
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_completion_max_retries() -> usize {
    2
}

fn default_max_spawn_depth() -> usize {
    1
}

fn default_max_children_per_parent() -> usize {
    4
}

fn default_subagent_retention_secs() -> u64 {
    3_600
}

fn default_subagent_sweep_interval_secs() -> u64 {
    60
}

fn default_dedupe_window_ms() -> u64 {
    1_000
}

fn default_max_send_attempts() -> usize {
    3
}

/// Loads the config file, treating a missing file as defaults.
pub fn load_config(path: &Path) -> Result<TrellisConfig> {
    if !path.exists() {
        return Ok(TrellisConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Applies command-line overrides on top of the loaded file.
pub fn apply_cli_overrides(config: &mut TrellisConfig, cli: &Cli) {
    if let Some(state_dir) = &cli.state_dir {
        config.session.state_dir = state_dir.clone();
    }
    if let Some(bind) = &cli.bind {
        config.gateway.bind_addr = bind.clone();
    }
    if let Some(model) = &cli.model {
        config.agent.model = model.clone();
    }
}
