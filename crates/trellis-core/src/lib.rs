//! Foundational low-level utilities shared across Trellis crates.
//!
//! Provides atomic file-write helpers, unix-time utilities, monotonic id
//! generation, and bounded backoff schedules used by the gateway runtime,
//! session persistence, and delivery retries.

pub mod atomic_io;
pub mod backoff;
pub mod ids;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use backoff::BoundedBackoff;
pub use ids::next_id;
pub use time_utils::{current_unix_timestamp_ms, is_stale_unix_ms};
