//! Child-run bookkeeping: spawn limits, retention sweep, completion
//! announcement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use trellis_core::{current_unix_timestamp_ms, next_id, BoundedBackoff};
use trellis_routing::subagent_session_key;

/// Spawn-time bounds plus the retention window for finished records.
#[derive(Debug, Clone)]
pub struct SubagentLimits {
    /// Maximum depth a spawn chain may reach. A child's depth is its parent's
    /// depth plus one.
    pub max_spawn_depth: usize,
    /// Maximum concurrently active children per parent run.
    pub max_children_per_parent: usize,
    /// How long non-active records survive before the sweep removes them.
    pub retention: Duration,
}

impl Default for SubagentLimits {
    fn default() -> Self {
        Self {
            max_spawn_depth: 1,
            max_children_per_parent: 4,
            retention: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentState {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One tracked child run.
pub struct SubagentRecord {
    pub parent_run_id: String,
    pub child_agent_id: String,
    pub run_id: String,
    pub depth: usize,
    pub created_unix_ms: u64,
    pub state: SubagentState,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Typed spawn rejection, raised synchronously before any child state exists.
pub enum SubagentLimitExceeded {
    #[error("spawn depth {requested} exceeds the configured ceiling of {max}")]
    DepthExceeded { requested: usize, max: usize },
    #[error("parent run '{parent_run_id}' already has {active} active children (max {max})")]
    FanOutExceeded {
        parent_run_id: String,
        active: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
/// What an accepted spawn hands back to the caller.
pub struct SubagentSpawn {
    pub run_id: String,
    pub session_key: String,
    pub depth: usize,
}

#[async_trait]
/// Delivers a finished child's summary back to its parent. Supplied by the
/// embedding runtime; the registry only drives the retry schedule.
pub trait ParentAnnouncer: Send + Sync {
    async fn announce(&self, record: &SubagentRecord, summary: &str) -> anyhow::Result<()>;
}

/// Tracks child runs spawned by executors. All mutation happens under the
/// registry's own mutex; spawn checks and the sweep never touch session
/// state.
pub struct SubagentRegistry {
    limits: SubagentLimits,
    records: Mutex<HashMap<String, SubagentRecord>>,
}

impl SubagentRegistry {
    pub fn new(limits: SubagentLimits) -> Self {
        Self {
            limits,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Admits or rejects one spawn. Accepted spawns get a fresh run id and a
    /// session key that cannot collide with any sibling's.
    pub fn spawn(
        &self,
        parent_run_id: &str,
        parent_depth: usize,
        child_agent_id: &str,
    ) -> Result<SubagentSpawn, SubagentLimitExceeded> {
        let depth = parent_depth + 1;
        if depth > self.limits.max_spawn_depth {
            return Err(SubagentLimitExceeded::DepthExceeded {
                requested: depth,
                max: self.limits.max_spawn_depth,
            });
        }

        let mut records = self.lock_records();
        let active = records
            .values()
            .filter(|record| {
                record.parent_run_id == parent_run_id && record.state == SubagentState::Active
            })
            .count();
        if active >= self.limits.max_children_per_parent {
            return Err(SubagentLimitExceeded::FanOutExceeded {
                parent_run_id: parent_run_id.to_string(),
                active,
                max: self.limits.max_children_per_parent,
            });
        }

        let run_id = next_id("subrun");
        let session_key = subagent_session_key(parent_run_id, child_agent_id, &run_id);
        records.insert(
            run_id.clone(),
            SubagentRecord {
                parent_run_id: parent_run_id.to_string(),
                child_agent_id: child_agent_id.to_string(),
                run_id: run_id.clone(),
                depth,
                created_unix_ms: current_unix_timestamp_ms(),
                state: SubagentState::Active,
            },
        );
        Ok(SubagentSpawn {
            run_id,
            session_key,
            depth,
        })
    }

    /// Marks a child run finished, freeing its slot in the parent's fan-out
    /// budget. Returns the updated record.
    pub fn mark_finished(&self, run_id: &str, state: SubagentState) -> Option<SubagentRecord> {
        let mut records = self.lock_records();
        let record = records.get_mut(run_id)?;
        record.state = state;
        Some(record.clone())
    }

    pub fn record(&self, run_id: &str) -> Option<SubagentRecord> {
        self.lock_records().get(run_id).cloned()
    }

    pub fn active_children(&self, parent_run_id: &str) -> usize {
        self.lock_records()
            .values()
            .filter(|record| {
                record.parent_run_id == parent_run_id && record.state == SubagentState::Active
            })
            .count()
    }

    /// Removes non-active records older than the retention window. Returns
    /// how many were swept.
    pub fn sweep(&self, now_unix_ms: u64) -> usize {
        let retention_ms = self.limits.retention.as_millis() as u64;
        let mut records = self.lock_records();
        let before = records.len();
        records.retain(|_, record| {
            record.state == SubagentState::Active
                || now_unix_ms.saturating_sub(record.created_unix_ms) <= retention_ms
        });
        let swept = before - records.len();
        if swept > 0 {
            debug!(swept, "swept expired subagent records");
        }
        swept
    }

    /// Background sweep loop on a fixed interval.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.sweep(current_unix_timestamp_ms());
            }
        })
    }

    /// Announces a finished child back to its parent with bounded retries.
    /// Exhausting retries is reported but never fails the child's own result.
    pub async fn announce_completion(
        &self,
        announcer: &dyn ParentAnnouncer,
        run_id: &str,
        summary: &str,
        max_attempts: usize,
    ) -> bool {
        let Some(record) = self.record(run_id) else {
            warn!(run_id, "completion announcement for unknown subagent run");
            return false;
        };
        let mut backoff =
            BoundedBackoff::new(Duration::from_millis(500), Duration::from_secs(5));
        for attempt in 1..=max_attempts.max(1) {
            match announcer.announce(&record, summary).await {
                Ok(()) => return true,
                Err(error) => {
                    warn!(
                        run_id,
                        attempt,
                        error = %error,
                        "subagent completion announcement failed"
                    );
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
        false
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<String, SubagentRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
