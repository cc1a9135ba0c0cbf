/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `observed_unix_ms` is older than `threshold_ms` relative
/// to `now_unix_ms`. Used for heartbeat staleness and retention sweeps.
pub fn is_stale_unix_ms(observed_unix_ms: u64, now_unix_ms: u64, threshold_ms: u64) -> bool {
    now_unix_ms.saturating_sub(observed_unix_ms) > threshold_ms
}
