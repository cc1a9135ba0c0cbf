//! JSONL persistence, structural validation, and best-effort repair.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use trellis_ai::{Turn, TurnRole};
use trellis_core::{current_unix_timestamp_ms, write_text_atomic};

use crate::SESSION_SCHEMA_VERSION;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionMetaRecord {
    schema_version: u32,
    session_key: String,
    updated_unix_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "snake_case")]
enum SessionRecord {
    Meta(SessionMetaRecord),
    Turn { turn: Turn },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// What repair-on-read had to change.
pub struct RepairReport {
    pub dropped_malformed_lines: usize,
    pub dropped_orphan_results: usize,
    pub injected_error_results: usize,
    pub truncated_turns: usize,
}

impl RepairReport {
    pub fn repaired_anything(&self) -> bool {
        self.dropped_malformed_lines > 0
            || self.dropped_orphan_results > 0
            || self.injected_error_results > 0
            || self.truncated_turns > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Read-only structural check of a persisted record.
pub struct SessionValidationReport {
    pub readable: bool,
    pub turns: usize,
    pub malformed_lines: usize,
    pub orphan_results: usize,
    pub unanswered_calls: usize,
}

impl SessionValidationReport {
    pub fn is_valid(&self) -> bool {
        self.readable
            && self.malformed_lines == 0
            && self.orphan_results == 0
            && self.unanswered_calls == 0
    }
}

pub(crate) struct LoadedSession {
    pub(crate) turns: Vec<Turn>,
    pub(crate) degraded: bool,
    pub(crate) repair: RepairReport,
}

impl LoadedSession {
    fn empty(degraded: bool) -> Self {
        Self {
            turns: Vec::new(),
            degraded,
            repair: RepairReport::default(),
        }
    }
}

/// Reads a session record, repairing what it can. Never errors: an unreadable
/// record comes back empty with the degraded flag set.
pub(crate) fn read_session_record(path: &Path, max_turns: usize) -> LoadedSession {
    if !path.exists() {
        return LoadedSession::empty(false);
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path.display(), error = %error, "failed to read session record");
            return LoadedSession::empty(true);
        }
    };

    let mut repair = RepairReport::default();
    let mut turns = Vec::new();
    let mut saw_meta = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionRecord>(line) {
            Ok(SessionRecord::Meta(meta)) => {
                if meta.schema_version != SESSION_SCHEMA_VERSION {
                    warn!(
                        path = %path.display(),
                        found = meta.schema_version,
                        "unsupported session record schema; degrading to empty"
                    );
                    return LoadedSession::empty(true);
                }
                saw_meta = true;
            }
            Ok(SessionRecord::Turn { turn }) => turns.push(turn),
            Err(_) => repair.dropped_malformed_lines += 1,
        }
    }

    // A file with content but no parseable meta record is not trustworthy
    // enough to write back over; degrade instead of guessing. This covers
    // both stray turn records and a file where every line is garbage.
    if !saw_meta && (!turns.is_empty() || repair.dropped_malformed_lines > 0) {
        return LoadedSession::empty(true);
    }

    let turns = repair_tool_pairing(turns, &mut repair);
    let turns = apply_turn_window(turns, max_turns, &mut repair);

    LoadedSession {
        turns,
        degraded: false,
        repair,
    }
}

/// Re-pairs tool calls and results: orphaned results are dropped, unanswered
/// calls get a synthetic error result so invariant pairing holds.
fn repair_tool_pairing(turns: Vec<Turn>, repair: &mut RepairReport) -> Vec<Turn> {
    let mut repaired: Vec<Turn> = Vec::with_capacity(turns.len());
    let mut pending: Vec<(String, String)> = Vec::new();

    for turn in turns {
        match turn.role {
            TurnRole::Tool => {
                let call_id = turn.tool_call_id.clone().unwrap_or_default();
                if let Some(position) = pending.iter().position(|(id, _)| *id == call_id) {
                    pending.remove(position);
                    repaired.push(turn);
                } else {
                    repair.dropped_orphan_results += 1;
                }
            }
            _ => {
                flush_pending_calls(&mut repaired, &mut pending, repair);
                if turn.role == TurnRole::Assistant {
                    for call in turn.tool_calls() {
                        pending.push((call.id, call.name));
                    }
                }
                repaired.push(turn);
            }
        }
    }
    flush_pending_calls(&mut repaired, &mut pending, repair);
    repaired
}

fn flush_pending_calls(
    repaired: &mut Vec<Turn>,
    pending: &mut Vec<(String, String)>,
    repair: &mut RepairReport,
) {
    for (call_id, tool_name) in pending.drain(..) {
        repaired.push(Turn::tool_result(
            call_id,
            tool_name,
            "tool result was lost before it could be recorded",
            true,
        ));
        repair.injected_error_results += 1;
    }
}

/// Truncates from the oldest end, never splitting a call/result pair: the
/// window start is advanced past any leading tool results.
fn apply_turn_window(turns: Vec<Turn>, max_turns: usize, repair: &mut RepairReport) -> Vec<Turn> {
    if max_turns == 0 || turns.len() <= max_turns {
        return turns;
    }
    let mut start = turns.len() - max_turns;
    while start < turns.len() && turns[start].role == TurnRole::Tool {
        start += 1;
    }
    repair.truncated_turns = start;
    turns.into_iter().skip(start).collect()
}

/// Read-only structural validation, used by maintenance commands.
pub(crate) fn validate_session_record(path: &Path) -> SessionValidationReport {
    let mut report = SessionValidationReport::default();
    if !path.exists() {
        report.readable = true;
        return report;
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return report,
    };
    report.readable = true;

    let mut pending: Vec<String> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionRecord>(line) {
            Ok(SessionRecord::Meta(_)) => {}
            Ok(SessionRecord::Turn { turn }) => {
                report.turns += 1;
                match turn.role {
                    TurnRole::Tool => {
                        let call_id = turn.tool_call_id.clone().unwrap_or_default();
                        if let Some(position) = pending.iter().position(|id| *id == call_id) {
                            pending.remove(position);
                        } else {
                            report.orphan_results += 1;
                        }
                    }
                    TurnRole::Assistant => {
                        report.unanswered_calls += pending.len();
                        pending = turn.tool_calls().into_iter().map(|call| call.id).collect();
                    }
                    _ => {
                        report.unanswered_calls += pending.len();
                        pending.clear();
                    }
                }
            }
            Err(_) => report.malformed_lines += 1,
        }
    }
    report.unanswered_calls += pending.len();
    report
}

/// Serializes the full record and promotes it atomically.
pub(crate) fn write_session_record(path: &Path, session_key: &str, turns: &[Turn]) -> Result<()> {
    let mut lines = Vec::with_capacity(turns.len() + 1);
    lines.push(
        serde_json::to_string(&SessionRecord::Meta(SessionMetaRecord {
            schema_version: SESSION_SCHEMA_VERSION,
            session_key: session_key.to_string(),
            updated_unix_ms: current_unix_timestamp_ms(),
        }))
        .context("failed to serialize session meta record")?,
    );
    for turn in turns {
        lines.push(
            serde_json::to_string(&SessionRecord::Turn { turn: turn.clone() })
                .context("failed to serialize session turn record")?,
        );
    }
    let mut content = lines.join("\n");
    content.push('\n');
    write_text_atomic(path, &content)
}

/// Session keys recoverable from record files in the state dir.
pub(crate) fn list_session_keys(state_dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
        Err(error) => {
            return Err(anyhow::Error::new(error)
                .context(format!("failed to list {}", state_dir.display())))
        }
    };
    for entry in entries {
        let entry = entry.context("failed to read state dir entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Some(first_line) = raw.lines().find(|line| !line.trim().is_empty()) else {
            continue;
        };
        if let Ok(SessionRecord::Meta(meta)) = serde_json::from_str::<SessionRecord>(first_line) {
            keys.push(meta.session_key);
        }
    }
    keys.sort();
    Ok(keys)
}
