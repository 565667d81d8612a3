//! Outbound delivery to connected participants
//!
//! Each joined connection registers a bounded outlet. Delivery never blocks:
//! a full or closed outlet drops the message and the drop is counted. Messages
//! pushed into one outlet are delivered in push order.

use crate::protocol::{ServerEnvelope, ServerMessage};
use chrono::{DateTime, Utc};
use classcast_core::{ConnectionKey, ParticipantId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Sending half of a connection's outbound queue
pub type Outlet = mpsc::Sender<ServerEnvelope>;

/// Result of handing one message to an outlet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the connection
    Delivered,
    /// Not queued
    Dropped(DropReason),
}

impl Delivery {
    /// Whether the message was queued
    pub fn is_delivered(self) -> bool {
        matches!(self, Delivery::Delivered)
    }
}

/// Why a delivery was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Target has no registered outlet
    NotConnected,
    /// Target's outbound queue is full
    Backpressure,
    /// Target's transport is gone
    Closed,
}

#[derive(Debug)]
struct OutletEntry {
    sender: Outlet,
    next_server_seq: u64,
}

/// Registry of outbound queues keyed by connection
#[derive(Debug, Default)]
pub struct DeliveryHub {
    outlets: DashMap<ConnectionKey, OutletEntry>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Outlets currently registered
    pub outlets: usize,
    /// Messages queued so far
    pub delivered: u64,
    /// Messages dropped so far
    pub dropped: u64,
}

impl DeliveryHub {
    /// Empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the outlet for a connection
    pub fn attach(&self, key: ConnectionKey, sender: Outlet) {
        self.outlets.insert(
            key,
            OutletEntry {
                sender,
                next_server_seq: 1,
            },
        );
    }

    /// Remove a connection's outlet. Anything not yet queued is lost.
    pub fn detach(&self, key: &ConnectionKey) -> bool {
        self.outlets.remove(key).is_some()
    }

    /// Whether the connection has an outlet
    pub fn is_attached(&self, key: &ConnectionKey) -> bool {
        self.outlets.contains_key(key)
    }

    /// Queue a server-originated message, stamped with the next server sequence
    /// number of the target connection
    pub fn send_server(&self, key: &ConnectionKey, message: ServerMessage) -> Delivery {
        let Some(mut entry) = self.outlets.get_mut(key) else {
            return self.count(Delivery::Dropped(DropReason::NotConnected));
        };
        let envelope = ServerEnvelope {
            session_id: key.session_id.clone(),
            from: None,
            seq: entry.next_server_seq,
            received_at: Utc::now(),
            message,
        };
        let delivery = Self::push(&entry.sender, envelope);
        if delivery.is_delivered() {
            entry.next_server_seq += 1;
        }
        self.count(delivery)
    }

    /// Queue a message relayed from another participant
    pub fn forward(
        &self,
        key: &ConnectionKey,
        from: &ParticipantId,
        seq: u64,
        received_at: DateTime<Utc>,
        message: ServerMessage,
    ) -> Delivery {
        let Some(entry) = self.outlets.get(key) else {
            return self.count(Delivery::Dropped(DropReason::NotConnected));
        };
        let envelope = ServerEnvelope {
            session_id: key.session_id.clone(),
            from: Some(from.clone()),
            seq,
            received_at,
            message,
        };
        let delivery = Self::push(&entry.sender, envelope);
        self.count(delivery)
    }

    /// Delivery counters
    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            outlets: self.outlets.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn push(sender: &Outlet, envelope: ServerEnvelope) -> Delivery {
        match sender.try_send(envelope) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(envelope)) => {
                tracing::warn!(
                    "Outbound queue full for {} in session {}, dropping message",
                    envelope.from.as_ref().map_or("server", |p| p.as_str()),
                    envelope.session_id
                );
                Delivery::Dropped(DropReason::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Delivery::Dropped(DropReason::Closed),
        }
    }

    fn count(&self, delivery: Delivery) -> Delivery {
        match delivery {
            Delivery::Delivered => self.delivered.fetch_add(1, Ordering::Relaxed),
            Delivery::Dropped(_) => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(p: &str) -> ConnectionKey {
        ConnectionKey::new("s1".into(), p.into())
    }

    #[test]
    fn test_server_sequence_numbers_increase_per_connection() {
        let hub = DeliveryHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.attach(key("a"), tx);

        for _ in 0..3 {
            let message = ServerMessage::SessionStopped { reason: "done".into() };
            assert_eq!(hub.send_server(&key("a"), message), Delivery::Delivered);
        }
        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_outlet_drops_without_blocking() {
        let hub = DeliveryHub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.attach(key("a"), tx);

        let payload = ServerMessage::Offer { payload: serde_json::json!({}) };
        let now = Utc::now();
        assert!(hub.forward(&key("a"), &"b".into(), 1, now, payload.clone()).is_delivered());
        assert_eq!(
            hub.forward(&key("a"), &"b".into(), 2, now, payload),
            Delivery::Dropped(DropReason::Backpressure)
        );
        assert_eq!(hub.stats().dropped, 1);
    }

    #[test]
    fn test_detached_or_closed_outlets() {
        let hub = DeliveryHub::new();
        let message = ServerMessage::SessionStopped { reason: "done".into() };
        assert_eq!(
            hub.send_server(&key("ghost"), message.clone()),
            Delivery::Dropped(DropReason::NotConnected)
        );

        let (tx, rx) = mpsc::channel(4);
        hub.attach(key("a"), tx);
        drop(rx);
        assert_eq!(hub.send_server(&key("a"), message), Delivery::Dropped(DropReason::Closed));
        assert!(hub.detach(&key("a")));
        assert!(!hub.is_attached(&key("a")));
    }
}
