//! Message routing: binding tables, the pure resolver, and session keys.
//!
//! Routing is a pure function from an inbound event plus the loaded binding
//! table to a target agent and deterministic session key. Identical inputs
//! always resolve identically; no I/O happens during resolution.

mod binding_table;
mod resolver;
mod session_keys;

pub use binding_table::{
    load_binding_table, save_binding_table, Binding, BindingScope, BindingTable,
    BINDING_TABLE_FILE_NAME, BINDING_TABLE_SCHEMA_VERSION,
};
pub use resolver::{resolve_route, RouteNotFound, RouteResolution};
pub use session_keys::{
    channel_session_key, guild_session_key, peer_session_key, subagent_session_key,
};

#[cfg(test)]
mod tests;
