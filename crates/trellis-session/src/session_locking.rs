//! In-process per-key write locks.
//!
//! A single authoritative process owns all session state, so exclusion is an
//! in-process lock table: one async mutex per active key. Guards release on
//! drop, which covers aborts and panics during finalization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone)]
/// What `acquire` does when the lock is already held.
pub enum LockPolicy {
    /// Fail immediately with retryable contention (the default).
    FailFast,
    /// Wait in a bounded queue; waiters beyond `max_waiters` or waits past
    /// `wait_timeout` fail with contention, so a lock storm cannot queue
    /// unbounded memory.
    Queue {
        max_waiters: usize,
        wait_timeout: Duration,
    },
}

#[derive(Default)]
struct KeyLock {
    mutex: Arc<tokio::sync::Mutex<()>>,
    waiters: Arc<AtomicUsize>,
}

pub(crate) struct LockGuard {
    _inner: OwnedMutexGuard<()>,
}

pub(crate) struct LockRegistry {
    table: Mutex<HashMap<String, KeyLock>>,
}

impl LockRegistry {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `None` on contention (per policy); `Some(guard)` on success.
    pub(crate) async fn acquire(&self, session_key: &str, policy: &LockPolicy) -> Option<LockGuard> {
        let (mutex, waiters) = {
            let mut table = self
                .table
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody references so the table tracks only live keys.
            table.retain(|_, key_lock| {
                Arc::strong_count(&key_lock.mutex) > 1
                    || key_lock.waiters.load(Ordering::SeqCst) > 0
            });
            let key_lock = table.entry(session_key.to_string()).or_default();
            (key_lock.mutex.clone(), key_lock.waiters.clone())
        };

        match policy {
            LockPolicy::FailFast => mutex
                .try_lock_owned()
                .ok()
                .map(|guard| LockGuard { _inner: guard }),
            LockPolicy::Queue {
                max_waiters,
                wait_timeout,
            } => {
                if let Ok(guard) = mutex.clone().try_lock_owned() {
                    return Some(LockGuard { _inner: guard });
                }
                if waiters.fetch_add(1, Ordering::SeqCst) >= *max_waiters {
                    waiters.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
                let acquired = tokio::time::timeout(*wait_timeout, mutex.lock_owned()).await;
                waiters.fetch_sub(1, Ordering::SeqCst);
                acquired.ok().map(|guard| LockGuard { _inner: guard })
            }
        }
    }
}
