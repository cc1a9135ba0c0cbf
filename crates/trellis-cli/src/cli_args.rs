use std::path::PathBuf;

use clap::Parser;

/// Command-line flags. Every flag can also arrive via environment variable;
/// flags override the config file, which overrides built-in defaults.
#[derive(Debug, Parser)]
#[command(
    name = "trellis",
    version,
    about = "Gateway daemon bridging messaging surfaces to LLM-driven agent sessions"
)]
pub struct Cli {
    #[arg(
        long = "config",
        env = "TRELLIS_CONFIG",
        default_value = "trellis.toml",
        help = "Path to the TOML configuration file; a missing file uses built-in defaults"
    )]
    pub config: PathBuf,

    #[arg(
        long = "state-dir",
        env = "TRELLIS_STATE_DIR",
        help = "Override the state directory holding session records and receipts"
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long = "bind",
        env = "TRELLIS_BIND",
        help = "Override the gateway bind address, e.g. 127.0.0.1:7410"
    )]
    pub bind: Option<String>,

    #[arg(
        long = "model",
        env = "TRELLIS_MODEL",
        help = "Override the completion model id from the config file"
    )]
    pub model: Option<String>,
}
