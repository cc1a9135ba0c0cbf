//! Process-local id generation for runs, connections, and delivery records.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::time_utils::current_unix_timestamp_ms;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Returns a new id of the shape `{prefix}_{unix_ms:012x}{sequence:06x}`.
///
/// Ids are unique within one process lifetime and sort roughly by creation
/// time, which keeps state-dir listings readable.
pub fn next_id(prefix: &str) -> String {
    let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}_{:012x}{:06x}",
        prefix,
        current_unix_timestamp_ms(),
        sequence & 0xff_ffff
    )
}
