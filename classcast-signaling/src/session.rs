//! Session record and lifecycle

use chrono::{DateTime, Utc};
use classcast_core::{ClassroomError, ParticipantId, Result, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, not yet accepting participants
    Created,
    /// Accepting participants
    Live,
    /// Ended; terminal
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Live => write!(f, "live"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One live class instance
#[derive(Debug, Clone)]
pub struct Session {
    /// Session ID
    pub id: SessionId,
    /// Owning teacher
    pub teacher_id: ParticipantId,
    /// Lifecycle state
    pub state: SessionState,
    /// Current roster in join order
    pub participants: Vec<ParticipantId>,
    /// Maximum roster size, teacher included
    pub max_participants: usize,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the session went live
    pub started_at: Option<DateTime<Utc>>,
    /// When the session stopped
    pub stopped_at: Option<DateTime<Utc>>,
    stopped_instant: Option<Instant>,
}

impl Session {
    /// New session in `created`
    pub fn new(id: SessionId, teacher_id: ParticipantId, max_participants: usize) -> Self {
        Self {
            id,
            teacher_id,
            state: SessionState::Created,
            participants: Vec::new(),
            max_participants,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            stopped_instant: None,
        }
    }

    /// Move `created` to `live`
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(ClassroomError::InvalidState {
                expected: SessionState::Created.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.state = SessionState::Live;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Move to `stopped`. Returns false if already stopped.
    pub fn stop(&mut self, now: Instant) -> bool {
        if self.state == SessionState::Stopped {
            return false;
        }
        self.state = SessionState::Stopped;
        self.stopped_at = Some(Utc::now());
        self.stopped_instant = Some(now);
        true
    }

    /// Whether the session accepts participants and traffic
    pub fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }

    /// Whether a stopped session has been kept for at least `retention`
    pub fn is_expired(&self, now: Instant, retention: std::time::Duration) -> bool {
        self.stopped_instant
            .is_some_and(|at| now.saturating_duration_since(at) >= retention)
    }

    /// Whether the participant is on the roster
    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.participants.contains(participant_id)
    }

    /// Whether the roster is at capacity
    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    /// Check that the session is live
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(ClassroomError::SessionNotLive {
                session_id: self.id.clone(),
                state: self.state.to_string(),
            })
        }
    }

    /// Remove a participant from the roster. Returns false if absent.
    pub fn remove_participant(&mut self, participant_id: &ParticipantId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p != participant_id);
        self.participants.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lifecycle() {
        let mut session = Session::new("s1".into(), "t".into(), 10);
        assert_eq!(session.state, SessionState::Created);
        assert!(session.ensure_live().is_err());

        session.start().unwrap();
        assert!(session.is_live());
        assert!(session.start().is_err());

        let now = Instant::now();
        assert!(session.stop(now));
        assert!(!session.stop(now));
        assert_eq!(session.state, SessionState::Stopped);
        assert!(session.start().is_err());
    }

    #[test]
    fn test_retention() {
        let mut session = Session::new("s1".into(), "t".into(), 10);
        let now = Instant::now();
        assert!(!session.is_expired(now, Duration::ZERO));
        session.stop(now);
        assert!(!session.is_expired(now + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(session.is_expired(now + Duration::from_secs(5), Duration::from_secs(5)));
    }

    #[test]
    fn test_roster() {
        let mut session = Session::new("s1".into(), "t".into(), 2);
        session.participants.push("a".into());
        assert!(!session.is_full());
        session.participants.push("b".into());
        assert!(session.is_full());
        assert!(session.remove_participant(&"a".into()));
        assert!(!session.remove_participant(&"a".into()));
        assert!(!session.contains(&"a".into()));
    }
}
