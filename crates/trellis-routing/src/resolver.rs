//! The pure routing resolver.

use serde::Serialize;
use thiserror::Error;
use trellis_channel::InboundEvent;

use crate::binding_table::{Binding, BindingScope, BindingTable};
use crate::session_keys::{channel_session_key, guild_session_key, peer_session_key};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no binding matched and no default agent is configured")]
/// Routing failure. The caller audits and drops the message; this never
/// propagates as a process fault.
pub struct RouteNotFound;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Outcome of routing one inbound event.
pub struct RouteResolution {
    pub agent_id: String,
    pub session_key: String,
    pub matched_scope: BindingScope,
}

/// Resolves an inbound event against the binding table.
///
/// Candidate bindings are evaluated in strict scope priority order (peer,
/// peer-parent, guild+roles, guild, team, account, channel, default); within
/// one scope, table order wins. The session key is derived from the resolved
/// agent, the channel, and the matched scope, so identical inputs always
/// address the same session.
pub fn resolve_route(
    event: &InboundEvent,
    table: &BindingTable,
) -> Result<RouteResolution, RouteNotFound> {
    for scope in BindingScope::PRIORITY {
        if let Some(binding) = table
            .bindings_for_scope(scope)
            .find(|binding| binding_matches(binding, event))
        {
            return Ok(RouteResolution {
                agent_id: binding.agent_id.clone(),
                session_key: derive_session_key(&binding.agent_id, scope, event),
                matched_scope: scope,
            });
        }
    }
    Err(RouteNotFound)
}

fn binding_matches(binding: &Binding, event: &InboundEvent) -> bool {
    let key = binding.match_key.trim();
    match binding.scope {
        // Exact direct-conversation counterpart; guild traffic never matches.
        BindingScope::Peer => event.guild_id.is_none() && event.peer_id == key,
        // A thread/reply inherits its parent's binding.
        BindingScope::PeerParent => event.thread_parent_id.as_deref() == Some(key),
        BindingScope::GuildRoles => {
            event.guild_id.as_deref() == Some(key)
                && event
                    .peer_roles
                    .iter()
                    .any(|role| binding.roles.iter().any(|wanted| wanted == role))
        }
        BindingScope::Guild => event.guild_id.as_deref() == Some(key),
        BindingScope::Team => event.team_id.as_deref() == Some(key),
        BindingScope::Account => event.account_id.as_deref() == Some(key),
        BindingScope::Channel => event.channel_id == key,
        BindingScope::Default => true,
    }
}

fn derive_session_key(agent_id: &str, matched_scope: BindingScope, event: &InboundEvent) -> String {
    match matched_scope {
        BindingScope::Peer => peer_session_key(agent_id, &event.channel_id, &event.peer_id),
        // The thread shares its parent's session.
        BindingScope::PeerParent => match event.thread_parent_id.as_deref() {
            Some(parent) => peer_session_key(agent_id, &event.channel_id, parent),
            None => channel_session_key(agent_id, &event.channel_id),
        },
        BindingScope::GuildRoles | BindingScope::Guild => match event.guild_id.as_deref() {
            Some(guild) => guild_session_key(agent_id, &event.channel_id, guild),
            None => channel_session_key(agent_id, &event.channel_id),
        },
        // Broad-scope matches on guild traffic still isolate per guild;
        // everything else shares the channel-level session.
        BindingScope::Team | BindingScope::Account | BindingScope::Channel
        | BindingScope::Default => match event.guild_id.as_deref() {
            Some(guild) => guild_session_key(agent_id, &event.channel_id, guild),
            None => channel_session_key(agent_id, &event.channel_id),
        },
    }
}
