//! Deterministic session-key derivation. The string formats are part of the
//! wire contract and stable across restarts.

/// Channel-level session shared by all traffic routed without a narrower scope.
pub fn channel_session_key(agent_id: &str, channel_id: &str) -> String {
    format!("agent:{agent_id}:channel:{channel_id}")
}

/// Direct-conversation session with one counterpart.
pub fn peer_session_key(agent_id: &str, channel_id: &str, peer_id: &str) -> String {
    format!("agent:{agent_id}:channel:{channel_id}:peer:{peer_id}")
}

/// Group session per guild.
pub fn guild_session_key(agent_id: &str, channel_id: &str, guild_id: &str) -> String {
    format!("agent:{agent_id}:channel:{channel_id}:guild:{guild_id}")
}

/// Isolated child-run session; the fresh `run_id` component guarantees no
/// collision across sibling spawns.
pub fn subagent_session_key(parent_run_id: &str, child_agent_id: &str, run_id: &str) -> String {
    format!("subagent:{parent_run_id}:{child_agent_id}:{run_id}")
}
