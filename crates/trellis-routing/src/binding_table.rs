//! Declarative routing rules, ordered by scope priority.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use trellis_core::write_text_atomic;

pub const BINDING_TABLE_FILE_NAME: &str = "route-bindings.json";
pub const BINDING_TABLE_SCHEMA_VERSION: u32 = 1;

fn binding_table_schema_version() -> u32 {
    BINDING_TABLE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
/// Binding scope, declared narrowest first: the declaration order here is the
/// resolution priority order.
pub enum BindingScope {
    Peer,
    PeerParent,
    GuildRoles,
    Guild,
    Team,
    Account,
    Channel,
    Default,
}

impl BindingScope {
    /// All scopes in strict resolution priority order.
    pub const PRIORITY: [BindingScope; 8] = [
        BindingScope::Peer,
        BindingScope::PeerParent,
        BindingScope::GuildRoles,
        BindingScope::Guild,
        BindingScope::Team,
        BindingScope::Account,
        BindingScope::Channel,
        BindingScope::Default,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BindingScope::Peer => "peer",
            BindingScope::PeerParent => "peer-parent",
            BindingScope::GuildRoles => "guild-roles",
            BindingScope::Guild => "guild",
            BindingScope::Team => "team",
            BindingScope::Account => "account",
            BindingScope::Channel => "channel",
            BindingScope::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One routing rule. `match_key` is ignored for `Default`; `roles` is only
/// consulted for `GuildRoles`.
pub struct Binding {
    pub scope: BindingScope,
    #[serde(default)]
    pub match_key: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// The loaded rule set. Immutable once loaded; hot reload replaces the whole
/// table.
pub struct BindingTable {
    #[serde(default = "binding_table_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl Default for BindingTable {
    fn default() -> Self {
        Self {
            schema_version: BINDING_TABLE_SCHEMA_VERSION,
            bindings: Vec::new(),
        }
    }
}

impl BindingTable {
    /// Bindings of one scope, preserving table order within the scope.
    pub fn bindings_for_scope(&self, scope: BindingScope) -> impl Iterator<Item = &Binding> {
        self.bindings
            .iter()
            .filter(move |binding| binding.scope == scope)
    }
}

pub fn load_binding_table(path: &Path) -> Result<BindingTable> {
    if !path.exists() {
        return Ok(BindingTable::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read binding table {}", path.display()))?;
    let table = serde_json::from_str::<BindingTable>(&raw)
        .with_context(|| format!("failed to parse binding table {}", path.display()))?;
    if table.schema_version != BINDING_TABLE_SCHEMA_VERSION {
        bail!(
            "unsupported binding table schema {} in {} (expected {})",
            table.schema_version,
            path.display(),
            BINDING_TABLE_SCHEMA_VERSION
        );
    }
    for binding in &table.bindings {
        if binding.agent_id.trim().is_empty() {
            bail!("binding table {} has a binding with an empty agent_id", path.display());
        }
        if binding.scope != BindingScope::Default && binding.match_key.trim().is_empty() {
            bail!(
                "binding table {} has a {} binding with an empty match_key",
                path.display(),
                binding.scope.as_str()
            );
        }
    }
    Ok(table)
}

pub fn save_binding_table(path: &Path, table: &BindingTable) -> Result<()> {
    let raw =
        serde_json::to_string_pretty(table).context("failed to serialize binding table")?;
    write_text_atomic(path, &raw)
}
