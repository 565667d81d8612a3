//! Per-participant connection lifecycle
//!
//! ```text
//!  joining ──offer/answer──▶ negotiating ──complete / report──▶ connected ◀──▶ degraded
//!     ▲                          │                                  │            │
//!     └──── negotiation timeout ─┘                                  └─ silence ──┴──▶ reconnecting
//!                                                                                       │
//!        reconnecting ──complete──▶ connected          reconnecting ──grace──▶ left
//! ```
//!
//! Every state may move to `left` on an explicit leave. `left` is terminal.

use chrono::{DateTime, Utc};
use classcast_core::{ClassroomError, ConnectionKey, QualityTier, Result, Role};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Admitted, no negotiation yet
    Joining,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Media flowing at an acceptable tier
    Connected,
    /// Media flowing below the connected floor tier
    Degraded,
    /// Liveness lapsed; waiting for the participant to renegotiate
    Reconnecting,
    /// Gone for good
    Left,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Joining => "joining",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Left => "left",
        };
        write!(f, "{}", name)
    }
}

/// Stimulus applied to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// Offer or answer sent by the participant
    NegotiationStarted,
    /// Final ICE acknowledgement sent by the participant
    NegotiationCompleted,
    /// Quality report received
    QualityReported,
    /// Current tier fell below the connected floor
    QualityDegraded,
    /// Current tier is at or above the connected floor
    QualityRecovered,
    /// No inbound traffic for the liveness window
    LivenessExpired,
    /// Negotiation did not complete in time
    NegotiationExpired,
    /// Reconnect grace (or stale-join allowance) ran out
    GraceExpired,
    /// Explicit leave or transport closed
    LeaveRequested,
}

impl ConnectionState {
    /// Transition table. `None` means the event is illegal in this state.
    pub fn next(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Left, _) => None,
            (_, E::LeaveRequested) => Some(S::Left),

            (S::Joining, E::NegotiationStarted) => Some(S::Negotiating),
            (S::Joining, E::GraceExpired) => Some(S::Left),
            (S::Joining, _) => None,

            (S::Negotiating, E::NegotiationStarted) => Some(S::Negotiating),
            (S::Negotiating, E::NegotiationCompleted | E::QualityReported) => Some(S::Connected),
            (S::Negotiating, E::NegotiationExpired) => Some(S::Joining),
            (S::Negotiating, _) => None,

            (
                S::Connected | S::Degraded,
                E::NegotiationStarted | E::NegotiationCompleted | E::QualityReported,
            ) => Some(self),
            (S::Connected | S::Degraded, E::QualityDegraded) => Some(S::Degraded),
            (S::Connected | S::Degraded, E::QualityRecovered) => Some(S::Connected),
            (S::Connected | S::Degraded, E::LivenessExpired) => Some(S::Reconnecting),
            (S::Connected | S::Degraded, _) => None,

            (S::Reconnecting, E::NegotiationCompleted) => Some(S::Connected),
            (
                S::Reconnecting,
                E::NegotiationStarted | E::QualityReported | E::QualityDegraded | E::QualityRecovered,
            ) => Some(S::Reconnecting),
            (S::Reconnecting, E::GraceExpired) => Some(S::Left),
            (S::Reconnecting, _) => None,
        }
    }

    /// Whether media is expected to be flowing
    pub fn is_media_active(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the event
    pub from: ConnectionState,
    /// State after the event
    pub to: ConnectionState,
}

impl Transition {
    /// Whether the state actually changed
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Signaling-side record of one participant's connection
#[derive(Debug, Clone)]
pub struct ParticipantConnection {
    /// Session and participant
    pub key: ConnectionKey,
    /// Role granted on join
    pub role: Role,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Current quality tier
    pub tier: QualityTier,
    /// Whether the participant may currently speak
    pub has_floor: bool,
    /// Wall-clock join time
    pub joined_at: DateTime<Utc>,
    /// Last inbound traffic of any kind
    pub last_seen: Instant,
    /// When the current state was entered
    pub state_since: Instant,
    /// Highest accepted sequence number
    pub last_seq: Option<u64>,
    /// Negotiation attempts that expired
    pub negotiation_attempts: u32,
}

impl ParticipantConnection {
    /// Fresh connection in `joining`
    pub fn new(key: ConnectionKey, role: Role, tier: QualityTier, now: Instant) -> Self {
        Self {
            key,
            role,
            state: ConnectionState::Joining,
            tier,
            has_floor: false,
            joined_at: Utc::now(),
            last_seen: now,
            state_since: now,
            last_seq: None,
            negotiation_attempts: 0,
        }
    }

    /// Apply an event, moving to the next state or failing with `InvalidState`
    pub fn apply(&mut self, event: ConnectionEvent, now: Instant) -> Result<Transition> {
        let from = self.state;
        let to = from.next(event).ok_or_else(|| ClassroomError::InvalidState {
            expected: format!("a state accepting {:?}", event),
            actual: from.to_string(),
        })?;

        if to != from {
            self.state = to;
            self.state_since = now;
            tracing::debug!("Connection {} {} -> {} on {:?}", self.key, from, to, event);
        }
        Ok(Transition { from, to })
    }

    /// Record inbound traffic
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Accept a sequence number if it is newer than every previous one
    pub fn accept_seq(&mut self, seq: u64) -> Result<()> {
        match self.last_seq {
            Some(last) if seq <= last => Err(ClassroomError::StaleSequence {
                participant_id: self.key.participant_id.clone(),
                seq,
                last_accepted: last,
            }),
            _ => {
                self.last_seq = Some(seq);
                Ok(())
            }
        }
    }

    /// Time since the last inbound traffic
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Time spent in the current state
    pub fn in_state_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;
    use ConnectionState as S;

    fn connection() -> ParticipantConnection {
        ParticipantConnection::new(
            ConnectionKey::new("s1".into(), "carol".into()),
            Role::Student,
            QualityTier::Medium,
            Instant::now(),
        )
    }

    #[test]
    fn test_happy_path() {
        let mut conn = connection();
        let now = Instant::now();
        assert_eq!(conn.apply(E::NegotiationStarted, now).unwrap().to, S::Negotiating);
        assert_eq!(conn.apply(E::NegotiationCompleted, now).unwrap().to, S::Connected);
        assert_eq!(conn.apply(E::QualityDegraded, now).unwrap().to, S::Degraded);
        assert_eq!(conn.apply(E::QualityRecovered, now).unwrap().to, S::Connected);
        assert_eq!(conn.apply(E::LeaveRequested, now).unwrap().to, S::Left);
    }

    #[test]
    fn test_left_is_terminal() {
        for event in [
            E::NegotiationStarted,
            E::NegotiationCompleted,
            E::QualityReported,
            E::LivenessExpired,
            E::GraceExpired,
            E::LeaveRequested,
        ] {
            assert_eq!(S::Left.next(event), None);
        }
    }

    #[test]
    fn test_quality_report_completes_negotiation() {
        assert_eq!(S::Negotiating.next(E::QualityReported), Some(S::Connected));
        assert_eq!(S::Joining.next(E::QualityReported), None);
    }

    #[test]
    fn test_reconnect_requires_completed_negotiation() {
        assert_eq!(S::Connected.next(E::LivenessExpired), Some(S::Reconnecting));
        assert_eq!(S::Degraded.next(E::LivenessExpired), Some(S::Reconnecting));
        assert_eq!(S::Reconnecting.next(E::QualityReported), Some(S::Reconnecting));
        assert_eq!(S::Reconnecting.next(E::NegotiationStarted), Some(S::Reconnecting));
        assert_eq!(S::Reconnecting.next(E::NegotiationCompleted), Some(S::Connected));
        assert_eq!(S::Reconnecting.next(E::GraceExpired), Some(S::Left));
    }

    #[test]
    fn test_negotiation_timeout_returns_to_joining() {
        assert_eq!(S::Negotiating.next(E::NegotiationExpired), Some(S::Joining));
        assert_eq!(S::Connected.next(E::NegotiationExpired), None);
    }

    #[test]
    fn test_illegal_transition_leaves_state_untouched() {
        let mut conn = connection();
        let err = conn.apply(E::NegotiationCompleted, Instant::now()).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");
        assert_eq!(conn.state, S::Joining);
    }

    #[test]
    fn test_self_transition_keeps_state_timer() {
        let mut conn = connection();
        let start = Instant::now();
        conn.apply(E::NegotiationStarted, start).unwrap();
        let later = start + Duration::from_secs(4);
        let transition = conn.apply(E::NegotiationStarted, later).unwrap();
        assert!(!transition.changed());
        assert_eq!(conn.in_state_for(later), Duration::from_secs(4));
    }

    #[test]
    fn test_sequence_numbers_must_increase() {
        let mut conn = connection();
        conn.accept_seq(1).unwrap();
        conn.accept_seq(5).unwrap();
        assert!(conn.accept_seq(5).is_err());
        assert!(conn.accept_seq(3).is_err());
        assert_eq!(conn.last_seq, Some(5));
    }
}
