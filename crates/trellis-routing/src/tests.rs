use trellis_channel::InboundEvent;

use super::*;

fn binding(scope: BindingScope, match_key: &str, agent_id: &str) -> Binding {
    Binding {
        scope,
        match_key: match_key.to_string(),
        roles: Vec::new(),
        agent_id: agent_id.to_string(),
    }
}

fn table(bindings: Vec<Binding>) -> BindingTable {
    BindingTable {
        schema_version: BINDING_TABLE_SCHEMA_VERSION,
        bindings,
    }
}

#[test]
fn peer_binding_beats_default() {
    let table = table(vec![
        binding(BindingScope::Peer, "alice", "A1"),
        binding(BindingScope::Default, "", "A0"),
    ]);

    let alice = resolve_route(&InboundEvent::direct("C", "alice", "hi"), &table).expect("route");
    assert_eq!(alice.agent_id, "A1");
    assert_eq!(alice.session_key, "agent:A1:channel:C:peer:alice");
    assert_eq!(alice.matched_scope, BindingScope::Peer);

    let bob = resolve_route(&InboundEvent::direct("C", "bob", "hi"), &table).expect("route");
    assert_eq!(bob.agent_id, "A0");
    assert_eq!(bob.session_key, "agent:A0:channel:C");
    assert_eq!(bob.matched_scope, BindingScope::Default);
}

#[test]
fn peer_binding_beats_peer_parent_and_guild() {
    let table = table(vec![
        binding(BindingScope::Guild, "G", "A-guild"),
        binding(BindingScope::PeerParent, "alice", "A-parent"),
        binding(BindingScope::Peer, "alice", "A-peer"),
    ]);
    let event = InboundEvent::direct("C", "alice", "hi");
    let resolution = resolve_route(&event, &table).expect("route");
    assert_eq!(resolution.agent_id, "A-peer");
}

#[test]
fn thread_reply_inherits_parent_binding_and_session() {
    let table = table(vec![binding(BindingScope::PeerParent, "alice", "A1")]);
    let mut event = InboundEvent::direct("C", "charlie", "reply in thread");
    event.thread_parent_id = Some("alice".to_string());

    let resolution = resolve_route(&event, &table).expect("route");
    assert_eq!(resolution.agent_id, "A1");
    assert_eq!(resolution.session_key, "agent:A1:channel:C:peer:alice");
}

#[test]
fn guild_role_binding_requires_matching_role() {
    let mut role_binding = binding(BindingScope::GuildRoles, "G", "A-mods");
    role_binding.roles = vec!["moderator".to_string()];
    let table = table(vec![role_binding, binding(BindingScope::Guild, "G", "A-all")]);

    let mut mod_event = InboundEvent::direct("C", "alice", "hi");
    mod_event.guild_id = Some("G".to_string());
    mod_event.peer_roles = vec!["moderator".to_string()];
    assert_eq!(
        resolve_route(&mod_event, &table).expect("route").agent_id,
        "A-mods"
    );

    let mut member_event = InboundEvent::direct("C", "bob", "hi");
    member_event.guild_id = Some("G".to_string());
    assert_eq!(
        resolve_route(&member_event, &table).expect("route").agent_id,
        "A-all"
    );
}

#[test]
fn broader_scopes_resolve_in_order() {
    let mut event = InboundEvent::direct("C", "dave", "hi");
    event.guild_id = Some("G".to_string());
    event.team_id = Some("T".to_string());
    event.account_id = Some("acct".to_string());

    let team_table = table(vec![
        binding(BindingScope::Account, "acct", "A-account"),
        binding(BindingScope::Team, "T", "A-team"),
    ]);
    assert_eq!(
        resolve_route(&event, &team_table).expect("route").agent_id,
        "A-team"
    );

    let account_table = table(vec![
        binding(BindingScope::Channel, "C", "A-channel"),
        binding(BindingScope::Account, "acct", "A-account"),
    ]);
    assert_eq!(
        resolve_route(&event, &account_table).expect("route").agent_id,
        "A-account"
    );
}

#[test]
fn guild_traffic_with_broad_binding_keeps_per_guild_sessions() {
    let table = table(vec![binding(BindingScope::Default, "", "A0")]);
    let mut event = InboundEvent::direct("C", "bob", "hi");
    event.guild_id = Some("G".to_string());

    let resolution = resolve_route(&event, &table).expect("route");
    assert_eq!(resolution.session_key, "agent:A0:channel:C:guild:G");
}

#[test]
fn no_binding_and_no_default_is_route_not_found() {
    let table = table(vec![binding(BindingScope::Peer, "alice", "A1")]);
    let result = resolve_route(&InboundEvent::direct("C", "mallory", "hi"), &table);
    assert_eq!(result, Err(RouteNotFound));
}

#[test]
fn routing_is_deterministic() {
    let table = table(vec![
        binding(BindingScope::Peer, "alice", "A1"),
        binding(BindingScope::Default, "", "A0"),
    ]);
    let event = InboundEvent::direct("C", "alice", "hi");
    let first = resolve_route(&event, &table).expect("route");
    let second = resolve_route(&event, &table).expect("route");
    assert_eq!(first, second);
}

#[test]
fn subagent_keys_are_collision_free_across_siblings() {
    let first = subagent_session_key("run-1", "child", "run-2");
    let second = subagent_session_key("run-1", "child", "run-3");
    assert_eq!(first, "subagent:run-1:child:run-2");
    assert_ne!(first, second);
}

#[test]
fn binding_table_round_trips_through_disk() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let path = tempdir.path().join(BINDING_TABLE_FILE_NAME);
    let original = table(vec![
        binding(BindingScope::Peer, "alice", "A1"),
        binding(BindingScope::Default, "", "A0"),
    ]);
    save_binding_table(&path, &original).expect("save");
    let loaded = load_binding_table(&path).expect("load");
    assert_eq!(loaded, original);
}

#[test]
fn missing_binding_table_loads_empty() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let loaded = load_binding_table(&tempdir.path().join("absent.json")).expect("load");
    assert!(loaded.bindings.is_empty());
}

#[test]
fn binding_table_rejects_empty_match_key_for_scoped_bindings() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let path = tempdir.path().join(BINDING_TABLE_FILE_NAME);
    let bad = table(vec![binding(BindingScope::Peer, "", "A1")]);
    save_binding_table(&path, &bad).expect("save");
    assert!(load_binding_table(&path).is_err());
}
