//! Authorization scopes granted to a connection and required by RPC methods.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
/// One authorization scope. `Admin` implies every other scope.
pub enum Scope {
    Admin,
    Read,
    Write,
    Approvals,
    Pairing,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Admin => "admin",
            Scope::Read => "read",
            Scope::Write => "write",
            Scope::Approvals => "approvals",
            Scope::Pairing => "pairing",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Scope::Admin),
            "read" => Ok(Scope::Read),
            "write" => Ok(Scope::Write),
            "approvals" => Ok(Scope::Approvals),
            "pairing" => Ok(Scope::Pairing),
            other => bail!("unsupported scope '{other}' (expected admin|read|write|approvals|pairing)"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Set of scopes granted to an authenticated connection.
pub struct ScopeSet(BTreeSet<Scope>);

impl ScopeSet {
    pub fn new(scopes: impl IntoIterator<Item = Scope>) -> Self {
        Self(scopes.into_iter().collect())
    }

    pub fn admin() -> Self {
        Self::new([Scope::Admin])
    }

    pub fn read_only() -> Self {
        Self::new([Scope::Read])
    }

    pub fn insert(&mut self, scope: Scope) {
        self.0.insert(scope);
    }

    /// Whether this grant satisfies a method's minimum required scope.
    pub fn allows(&self, required: Scope) -> bool {
        self.0.contains(&Scope::Admin) || self.0.contains(&required)
    }

    pub fn iter(&self) -> impl Iterator<Item = Scope> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
