//! Daemon assembly for the trellis gateway: flags, config, boot wiring, core
//! RPC methods, and the inbound message pipeline.

mod bootstrap;
mod cli_args;
mod config;
mod core_methods;
mod inbound;

pub use bootstrap::{init_tracing, run, RouterHandle, RunTracker, TrellisRuntime};
pub use cli_args::Cli;
pub use config::{apply_cli_overrides, load_config, TrellisConfig};
pub use core_methods::register_core_methods;
pub use inbound::{handle_inbound, InboundDisposition};
