//! Contract types shared between the core and external channel adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CHANNEL_EVENT_SCHEMA_VERSION: u32 = 1;

fn channel_event_schema_version() -> u32 {
    CHANNEL_EVENT_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Media reference attached to an inbound message; transcription happens
/// outside the core.
pub struct MediaAttachment {
    pub attachment_id: String,
    pub url: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One message delivered by a channel adapter into the core.
pub struct InboundEvent {
    #[serde(default = "channel_event_schema_version")]
    pub schema_version: u32,
    pub channel_id: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_parent_id: Option<String>,
    /// Messaging account the adapter received this under, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Workspace/team grouping, for surfaces that have one (e.g. Slack).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    /// Guild roles held by the sender, when the surface has roles at all.
    #[serde(default)]
    pub peer_roles: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    pub timestamp_ms: u64,
}

impl InboundEvent {
    pub fn direct(channel_id: impl Into<String>, peer_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            schema_version: CHANNEL_EVENT_SCHEMA_VERSION,
            channel_id: channel_id.into(),
            peer_id: peer_id.into(),
            guild_id: None,
            thread_parent_id: None,
            account_id: None,
            team_id: None,
            peer_roles: Vec::new(),
            text: text.into(),
            media: Vec::new(),
            timestamp_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
/// Where an outbound chunk goes: a peer, optionally inside a guild.
pub struct DeliveryTarget {
    pub channel_id: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Adapter acknowledgement for one delivered chunk.
pub struct DeliveryReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[error("delivery failed ({code}): {message}")]
/// Adapter-reported send failure. `retryable` drives the retry loop.
pub struct DeliveryError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl DeliveryError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

#[async_trait]
/// Wire-level messaging surface. Implementations live outside the core; the
/// registry holds them keyed by `channel_id`.
pub trait ChannelAdapter: Send + Sync {
    fn channel_id(&self) -> &str;

    /// Maximum characters the surface accepts per message.
    fn chunk_limit(&self) -> usize {
        4_000
    }

    async fn send(
        &self,
        target: &DeliveryTarget,
        chunk: &str,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}
