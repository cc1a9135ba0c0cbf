//! Connection registry and fan-out event broadcasting.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use trellis_access::ScopeSet;

use crate::wire::{event_class, event_frame, Frame};

struct Outbound {
    seq: u64,
    sender: mpsc::UnboundedSender<Frame>,
}

/// One registered, authenticated connection.
///
/// The sequence counter and the outbound queue share a mutex so an assigned
/// sequence number is enqueued before the next one is assigned: the peer
/// observes strictly increasing, gap-free numbering.
pub struct RegisteredConnection {
    connection_id: String,
    identity: String,
    scopes: ScopeSet,
    subscriptions: Option<BTreeSet<String>>,
    outbound: Mutex<Outbound>,
}

impl RegisteredConnection {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    pub(crate) fn subscribed_to(&self, event: &str) -> bool {
        match &self.subscriptions {
            None => true,
            Some(classes) => classes.contains(event_class(event)),
        }
    }

    /// Queues a sequenced event for this connection. Returns false once the
    /// connection task has gone away.
    pub fn send_event(&self, event: &str, payload: Value) -> bool {
        let mut outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        outbound.seq += 1;
        let frame = event_frame(Some(outbound.seq), event, payload);
        outbound.sender.send(frame).is_ok()
    }

    /// Queues an unsequenced frame (responses, handshake traffic).
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .send(frame)
            .is_ok()
    }
}

#[derive(Default)]
/// All currently-registered connections, keyed by connection id.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<RegisteredConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an authenticated connection for event delivery.
    /// `subscriptions = None` means every event class.
    pub fn register(
        &self,
        connection_id: impl Into<String>,
        identity: impl Into<String>,
        scopes: ScopeSet,
        subscriptions: Option<BTreeSet<String>>,
        sender: mpsc::UnboundedSender<Frame>,
    ) -> Arc<RegisteredConnection> {
        let connection = Arc::new(RegisteredConnection {
            connection_id: connection_id.into(),
            identity: identity.into(),
            scopes,
            subscriptions,
            outbound: Mutex::new(Outbound { seq: 0, sender }),
        });
        self.lock()
            .insert(connection.connection_id.clone(), connection.clone());
        connection
    }

    pub fn unregister(&self, connection_id: &str) {
        self.lock().remove(connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    pub fn identities(&self) -> Vec<String> {
        self.lock()
            .values()
            .map(|connection| connection.identity.clone())
            .collect()
    }

    /// Pushes one event to every connection subscribed to its class. Closed
    /// connections are dropped from the registry on the spot.
    pub fn broadcast(&self, event: &str, payload: Value) {
        let connections: Vec<Arc<RegisteredConnection>> = self.lock().values().cloned().collect();
        let mut closed = Vec::new();
        for connection in connections {
            if !connection.subscribed_to(event) {
                continue;
            }
            if !connection.send_event(event, payload.clone()) {
                closed.push(connection.connection_id.clone());
            }
        }
        if !closed.is_empty() {
            let mut table = self.lock();
            for connection_id in closed {
                debug!(connection_id, "dropping closed connection from registry");
                table.remove(&connection_id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<RegisteredConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
