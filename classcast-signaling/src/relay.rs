//! Message routing
//!
//! Every inbound envelope is routed by its kind:
//!
//! | kind                     | handled by                          |
//! |--------------------------|-------------------------------------|
//! | `join`, `leave`          | session registry                    |
//! | `offer`, `answer`        | connection state, then forwarded    |
//! | `ice-candidate`          | forwarded; completion flag advances |
//! | `quality-report`         | quality store and tier controller   |
//! | `floor-request`/`-revoke`| floor controller                    |
//! | `floor-grant`, `directive` | rejected, server-only             |
//!
//! Messages with a stale sequence number, messages for a stopped session and
//! messages whose state transition is illegal are discarded and logged.

use crate::connection::ConnectionEvent;
use crate::floor::FloorEvent;
use crate::hub::{Delivery, Outlet};
use crate::protocol::{ClientMessage, Envelope, MessageKind, Notice, ServerMessage, Target};
use crate::registry::{QualityOutcome, SessionRegistry};
use chrono::Utc;
use classcast_core::{ClassroomError, ConnectionKey, ParticipantId, Result, Role};
use std::sync::Arc;
use std::time::Instant;

/// Why a message was dropped without a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Sequence number not newer than the last accepted one
    StaleSequence,
    /// Session stopped while the message was in flight
    SessionNotLive,
    /// Message implies a transition the connection cannot make
    InvalidState,
}

/// What routing a message did
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// Sender admitted to the session
    Joined(ConnectionKey),
    /// Sender removed from the session
    Left,
    /// Message relayed to its recipients
    Forwarded {
        /// Recipients whose queue accepted the message
        delivered: usize,
        /// Recipients the message could not be handed to
        dropped: Vec<ParticipantId>,
    },
    /// Quality report processed
    Quality(QualityOutcome),
    /// Floor request or release processed
    Floor(Vec<FloorEvent>),
    /// Message dropped and logged
    Discarded(DiscardReason),
}

/// Routes client messages to the component that owns them
#[derive(Debug, Clone)]
pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
    report_dropped: bool,
}

impl SignalingRelay {
    /// Create a relay over a registry
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let report_dropped = registry.config().session.report_dropped_deliveries;
        Self {
            registry,
            report_dropped,
        }
    }

    /// Underlying registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Route one inbound message. `outlet` is the outbound queue of the
    /// connection the message arrived on; it is registered on `join`.
    ///
    /// Errors are structured rejections to report back to the sender.
    pub fn route(&self, envelope: Envelope, outlet: &Outlet) -> Result<RelayOutcome> {
        let now = Instant::now();
        let Envelope {
            session_id,
            sender,
            target,
            seq,
            message,
        } = envelope;
        let key = ConnectionKey::new(session_id, sender);
        let kind = message.kind();

        if kind != MessageKind::Join && !kind.is_server_only() {
            if let Some(reason) = self.admit(&key, kind, seq, now)? {
                return Ok(RelayOutcome::Discarded(reason));
            }
        }

        let result = match message {
            ClientMessage::Join { role } => self.join(&key, role, seq, outlet, now),
            ClientMessage::Leave => self
                .registry
                .leave(&key.session_id, &key.participant_id)
                .map(|()| RelayOutcome::Left),
            ClientMessage::Offer { payload } => self.forward(
                &key,
                &target,
                seq,
                ServerMessage::Offer { payload },
                Some(ConnectionEvent::NegotiationStarted),
                now,
            ),
            ClientMessage::Answer { payload } => self.forward(
                &key,
                &target,
                seq,
                ServerMessage::Answer { payload },
                Some(ConnectionEvent::NegotiationStarted),
                now,
            ),
            ClientMessage::IceCandidate { payload, complete } => self.forward(
                &key,
                &target,
                seq,
                ServerMessage::IceCandidate { payload, complete },
                complete.then_some(ConnectionEvent::NegotiationCompleted),
                now,
            ),
            ClientMessage::QualityReport {
                rtt_ms,
                bandwidth_kbps,
                packet_loss,
            } => self
                .registry
                .record_quality(&key, rtt_ms, bandwidth_kbps, packet_loss, now)
                .map(RelayOutcome::Quality),
            ClientMessage::FloorRequest => self
                .registry
                .floor_request(&key, now)
                .map(RelayOutcome::Floor),
            ClientMessage::FloorRevoke => self
                .registry
                .floor_release(&key, now)
                .map(RelayOutcome::Floor),
            ClientMessage::FloorGrant | ClientMessage::Directive => {
                tracing::warn!("{} sent server-only message {}", key, kind);
                Err(ClassroomError::ServerOnlyMessage {
                    kind: kind.to_string(),
                })
            }
        };

        match result {
            Err(e @ ClassroomError::InvalidState { .. }) => {
                tracing::warn!("Discarding {} from {}: {}", kind, key, e);
                Ok(RelayOutcome::Discarded(DiscardReason::InvalidState))
            }
            other => other,
        }
    }

    /// Transport-level liveness signal
    pub fn heartbeat(&self, key: &ConnectionKey) {
        self.registry.heartbeat(key, Instant::now());
    }

    /// Transport closed
    pub fn disconnect(&self, key: &ConnectionKey) {
        self.registry.disconnect(key);
    }

    fn admit(
        &self,
        key: &ConnectionKey,
        kind: MessageKind,
        seq: u64,
        now: Instant,
    ) -> Result<Option<DiscardReason>> {
        match self.registry.accept_inbound(key, seq, now) {
            Ok(()) => Ok(None),
            Err(ClassroomError::StaleSequence { last_accepted, .. }) => {
                tracing::debug!(
                    "Discarding {} #{} from {}: last accepted #{}",
                    kind,
                    seq,
                    key,
                    last_accepted
                );
                Ok(Some(DiscardReason::StaleSequence))
            }
            Err(ClassroomError::SessionNotLive { state, .. }) => {
                tracing::debug!("Discarding {} from {}: session is {}", kind, key, state);
                Ok(Some(DiscardReason::SessionNotLive))
            }
            Err(e) => Err(e),
        }
    }

    fn join(
        &self,
        key: &ConnectionKey,
        role: Role,
        seq: u64,
        outlet: &Outlet,
        now: Instant,
    ) -> Result<RelayOutcome> {
        self.registry
            .join(&key.session_id, &key.participant_id, role, outlet.clone())?;
        self.registry.accept_inbound(key, seq, now)?;
        Ok(RelayOutcome::Joined(key.clone()))
    }

    fn forward(
        &self,
        key: &ConnectionKey,
        target: &Target,
        seq: u64,
        message: ServerMessage,
        event: Option<ConnectionEvent>,
        now: Instant,
    ) -> Result<RelayOutcome> {
        if let Some(event) = event {
            self.registry.apply_event(key, event, now)?;
        }

        let recipients = self.registry.resolve_targets(key, target)?;
        let received_at = Utc::now();
        let hub = self.registry.hub();

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for recipient in recipients {
            let to = ConnectionKey::new(key.session_id.clone(), recipient.clone());
            match hub.forward(&to, &key.participant_id, seq, received_at, message.clone()) {
                Delivery::Delivered => delivered += 1,
                Delivery::Dropped(reason) => {
                    tracing::debug!("Relay {} -> {} dropped: {:?}", key, to, reason);
                    dropped.push(recipient);
                }
            }
        }

        if self.report_dropped {
            for target in &dropped {
                hub.send_server(
                    key,
                    ServerMessage::Notice {
                        notice: Notice::DeliveryDropped {
                            target: target.clone(),
                            seq,
                        },
                    },
                );
            }
        }

        Ok(RelayOutcome::Forwarded { delivered, dropped })
    }
}
