//! Repeated-invocation guard for the tool loop.

use std::collections::HashMap;

use serde_json::Value;
use trellis_ai::ToolCall;

/// Counts identical tool invocations (name plus canonicalized arguments)
/// within one run. The guard trips on the Nth identical invocation for a
/// threshold of N, forcing the run to finalize as `LoopDetected` instead of
/// burning turns indefinitely.
pub(crate) struct ToolLoopGuard {
    threshold: usize,
    counts: HashMap<String, usize>,
}

impl ToolLoopGuard {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: HashMap::new(),
        }
    }

    /// Records one invocation; returns the repeat count on the Nth identical
    /// invocation, where N is the configured threshold.
    pub(crate) fn observe(&mut self, call: &ToolCall) -> Option<usize> {
        let key = invocation_key(&call.name, &call.arguments);
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        (*count >= self.threshold).then_some(*count)
    }
}

// serde_json serializes object keys in sorted order (BTreeMap-backed), so the
// rendered string is a stable canonical form.
fn invocation_key(name: &str, arguments: &Value) -> String {
    let rendered = serde_json::to_string(arguments).unwrap_or_else(|_| arguments.to_string());
    format!("{name}\n{rendered}")
}
