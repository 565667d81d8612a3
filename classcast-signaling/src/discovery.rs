//! Read-only roster discovery for sessions

use crate::connection::ConnectionState;
use crate::registry::SessionRegistry;
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use classcast_core::{ParticipantId, QualityTier, Result, Role, SessionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One participant in a roster snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Participant ID
    pub participant_id: ParticipantId,
    /// Role
    pub role: Role,
    /// Connection state
    pub state: ConnectionState,
    /// Current quality tier
    pub tier: QualityTier,
    /// Whether the participant may currently speak
    pub has_floor: bool,
    /// Join time
    pub joined_at: DateTime<Utc>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    /// Session ID
    pub session_id: SessionId,
    /// Owning teacher
    pub teacher_id: ParticipantId,
    /// Lifecycle state
    pub state: SessionState,
    /// Maximum roster size
    pub max_participants: usize,
    /// Student holding the floor
    pub floor_holder: Option<ParticipantId>,
    /// Students waiting for the floor, front first
    pub floor_queue: Vec<ParticipantId>,
    /// Members in join order
    pub participants: Vec<RosterEntry>,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl RosterSnapshot {
    /// Entry for one participant
    pub fn participant(&self, participant_id: &ParticipantId) -> Option<&RosterEntry> {
        self.participants
            .iter()
            .find(|p| &p.participant_id == participant_id)
    }

    /// Members currently in a given connection state
    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.participants.iter().filter(|p| p.state == state).count()
    }
}

/// Discovery service handed to the lecture layer and dashboards
#[derive(Debug, Clone)]
pub struct SessionDirectory {
    registry: Arc<SessionRegistry>,
}

impl SessionDirectory {
    /// Create a directory over a registry
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Roster of one session
    pub fn snapshot(&self, session_id: &SessionId) -> Result<RosterSnapshot> {
        self.registry.snapshot(session_id)
    }

    /// Live sessions with their rosters
    pub fn live_sessions(&self) -> Vec<RosterSnapshot> {
        self.registry
            .live_sessions()
            .iter()
            .filter_map(|id| self.registry.snapshot(id).ok())
            .collect()
    }

    /// Session a participant is currently in
    pub fn locate(&self, participant_id: &ParticipantId) -> Option<SessionId> {
        self.registry.session_of(participant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classcast_core::ClassroomConfig;
    use tokio::sync::mpsc;

    #[test]
    fn test_snapshot_lists_members_in_join_order() {
        let registry = Arc::new(SessionRegistry::new(ClassroomConfig::default()));
        let id = registry
            .create_session_with_id("s1".into(), "teacher".into())
            .unwrap();
        registry.start(&id).unwrap();

        let (tx, _rx) = mpsc::channel(16);
        registry
            .join(&id, &"teacher".into(), Role::Teacher, tx.clone())
            .unwrap();
        registry.join(&id, &"ana".into(), Role::Student, tx).unwrap();

        let directory = SessionDirectory::new(Arc::clone(&registry));
        let snapshot = directory.snapshot(&id).unwrap();
        let ids: Vec<&str> = snapshot
            .participants
            .iter()
            .map(|p| p.participant_id.as_str())
            .collect();
        assert_eq!(ids, vec!["teacher", "ana"]);
        assert_eq!(snapshot.count_in(ConnectionState::Joining), 2);
        assert_eq!(snapshot.participant(&"ana".into()).unwrap().role, Role::Student);
        assert_eq!(directory.live_sessions().len(), 1);
        assert_eq!(directory.locate(&"ana".into()), Some(id));
    }

    #[test]
    fn test_unknown_session() {
        let registry = Arc::new(SessionRegistry::new(ClassroomConfig::default()));
        let directory = SessionDirectory::new(registry);
        let err = directory.snapshot(&"missing".into()).unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }
}
