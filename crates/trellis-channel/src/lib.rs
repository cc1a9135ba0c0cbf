//! Channel-adapter boundary of the gateway core.
//!
//! Defines the inbound/outbound contract every messaging surface implements
//! (`receive -> InboundEvent`, `send -> DeliveryReceipt`) plus the outbound
//! delivery pipeline: chunking to the adapter's limit, short-window dedupe,
//! bounded retry, and a receipt log. Platform wire adapters themselves live
//! outside the core.

mod channel_contract;
mod channel_outbound;

pub use channel_contract::{
    ChannelAdapter, DeliveryError, DeliveryReceipt, DeliveryTarget, InboundEvent, MediaAttachment,
    CHANNEL_EVENT_SCHEMA_VERSION,
};
pub use channel_outbound::{chunk_text, OutboundDelivery, OutboundDeliveryConfig, OutboundReport};

#[cfg(test)]
mod tests;
