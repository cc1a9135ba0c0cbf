//! Durable session store with exclusive-writer discipline and self-repair.
//!
//! One JSONL record file per session key under the state directory. Acquiring
//! a key yields a [`SessionHandle`] holding the per-key write lock; the lock
//! is released on drop, on every exit path. Records failing structural
//! validation are repaired best-effort on read; records that cannot be read
//! at all surface as empty with a degraded flag, never as a crash. Writes
//! rewrite the full record atomically (temp file + rename).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use trellis_ai::Turn;

mod session_locking;
mod session_storage;

use session_locking::LockRegistry;
pub use session_locking::LockPolicy;
pub use session_storage::{RepairReport, SessionValidationReport};

#[cfg(test)]
mod tests;

pub const SESSION_SCHEMA_VERSION: u32 = 1;
const DEFAULT_MAX_TURNS: usize = 200;

#[derive(Debug, Clone)]
/// Store-wide configuration.
pub struct SessionStoreConfig {
    pub state_dir: PathBuf,
    /// Turn-window applied on read; history beyond this is truncated from the
    /// oldest end.
    pub max_turns: usize,
    pub lock_policy: LockPolicy,
}

impl SessionStoreConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            max_turns: DEFAULT_MAX_TURNS,
            lock_policy: LockPolicy::FailFast,
        }
    }
}

#[derive(Debug, Error)]
/// Failures surfaced by the session store.
pub enum SessionError {
    /// Another run holds the write lock. Retryable with backoff.
    #[error("session '{session_key}' is locked by another run")]
    LockContention { session_key: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::LockContention { .. })
    }
}

/// Durable key-value store of conversation state, one record per session key.
pub struct SessionStore {
    config: SessionStoreConfig,
    locks: LockRegistry,
}

impl SessionStore {
    /// Opens the store, creating the state directory. Failure here is one of
    /// the few process-fatal startup conditions.
    pub fn open(config: SessionStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir).with_context(|| {
            format!(
                "failed to create session state dir {}",
                config.state_dir.display()
            )
        })?;
        Ok(Self {
            config,
            locks: LockRegistry::new(),
        })
    }

    /// Acquires the exclusive write lock for `session_key` and loads (and if
    /// needed repairs) the persisted record. Under the default fail-fast
    /// policy a held lock surfaces immediately as retryable contention.
    pub async fn acquire(&self, session_key: &str) -> Result<SessionHandle, SessionError> {
        let guard = self
            .locks
            .acquire(session_key, &self.config.lock_policy)
            .await
            .ok_or_else(|| SessionError::LockContention {
                session_key: session_key.to_string(),
            })?;

        let path = self.session_path(session_key);
        let loaded = session_storage::read_session_record(&path, self.config.max_turns);
        if loaded.degraded {
            warn!(session_key, "session record unreadable; starting degraded-empty");
        } else if loaded.repair.repaired_anything() {
            debug!(
                session_key,
                dropped_malformed_lines = loaded.repair.dropped_malformed_lines,
                dropped_orphan_results = loaded.repair.dropped_orphan_results,
                injected_error_results = loaded.repair.injected_error_results,
                truncated_turns = loaded.repair.truncated_turns,
                "session record repaired on read"
            );
        }

        Ok(SessionHandle {
            session_key: session_key.to_string(),
            path,
            turns: loaded.turns,
            degraded: loaded.degraded,
            repair: loaded.repair,
            _guard: guard,
        })
    }

    /// Structural validation without taking the write lock.
    pub fn validate(&self, session_key: &str) -> SessionValidationReport {
        session_storage::validate_session_record(&self.session_path(session_key))
    }

    /// Explicit maintenance: load with repair and rewrite the cleaned record.
    pub async fn repair(&self, session_key: &str) -> Result<RepairReport, SessionError> {
        let handle = self.acquire(session_key).await?;
        let report = handle.repair.clone();
        handle.persist()?;
        Ok(report)
    }

    /// Explicit maintenance: delete the record. Sessions are never deleted
    /// automatically.
    pub async fn prune(&self, session_key: &str) -> Result<bool, SessionError> {
        let _handle = self.acquire(session_key).await?;
        let path = self.session_path(session_key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(SessionError::Storage(anyhow::Error::new(error).context(
                format!("failed to prune session record {}", path.display()),
            ))),
        }
    }

    /// Session keys with a record on disk.
    pub fn list_session_keys(&self) -> Result<Vec<String>> {
        session_storage::list_session_keys(&self.config.state_dir)
    }

    fn session_path(&self, session_key: &str) -> PathBuf {
        session_record_path(&self.config.state_dir, session_key)
    }
}

/// Exclusive handle over one session. Dropping it releases the write lock;
/// callers persist before dropping so no other run can observe a
/// half-released lock.
pub struct SessionHandle {
    session_key: String,
    path: PathBuf,
    turns: Vec<Turn>,
    degraded: bool,
    repair: RepairReport,
    _guard: session_locking::LockGuard,
}

impl SessionHandle {
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// True when the persisted record was unreadable and the session was
    /// surfaced empty instead of failing.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn repair_report(&self) -> &RepairReport {
        &self.repair
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn append_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn replace_turns(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
    }

    /// Writes the full record atomically. Ordering contract: callers persist
    /// while still holding this handle, then drop it to release the lock.
    pub fn persist(&self) -> Result<()> {
        session_storage::write_session_record(&self.path, &self.session_key, &self.turns)
    }
}

/// Record path for a session key: a sanitized readable prefix plus a key-hash
/// suffix so distinct keys can never collide after sanitization.
pub fn session_record_path(state_dir: &Path, session_key: &str) -> PathBuf {
    let sanitized: String = session_key
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let digest = Sha256::digest(session_key.as_bytes());
    let digest_hex = format!("{digest:x}");
    state_dir.join(format!("{}-{}.jsonl", sanitized, &digest_hex[..12]))
}

/// Suggested wait before retrying a contended acquire.
pub const LOCK_RETRY_HINT: Duration = Duration::from_millis(250);
