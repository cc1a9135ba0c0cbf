//! Bounded exponential backoff schedule for reconnects and delivery retries.

use std::time::Duration;

/// Deterministic doubling backoff clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct BoundedBackoff {
    min: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl BoundedBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: None,
        }
    }

    /// Returns the next delay in the schedule, doubling until the upper bound.
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.min,
            Some(previous) => previous.saturating_mul(2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    /// Resets the schedule after a successful attempt.
    pub fn reset(&mut self) {
        self.current = None;
    }
}
