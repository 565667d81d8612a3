//! Error types for ClassCast

use crate::types::{ParticipantId, SessionId};
use thiserror::Error;

/// Main error type for ClassCast operations
#[derive(Error, Debug)]
pub enum ClassroomError {
    /// Operation illegal in the current session or connection state
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Session not found
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// Session ID that was not found
        session_id: SessionId,
    },

    /// Session exists but is not accepting participants
    #[error("Session {session_id} is not live (state: {state})")]
    SessionNotLive {
        /// Session ID
        session_id: SessionId,
        /// Current lifecycle state
        state: String,
    },

    /// Teacher already owns an active session, or the id is taken
    #[error("Duplicate session {session_id} for teacher {teacher_id}")]
    DuplicateSession {
        /// Teacher that attempted the creation
        teacher_id: ParticipantId,
        /// Session that already exists
        session_id: SessionId,
    },

    /// Session is full
    #[error("Session {session_id} is full (max participants: {max_participants})")]
    CapacityExceeded {
        /// Session ID that is full
        session_id: SessionId,
        /// Maximum participants allowed
        max_participants: usize,
    },

    /// Participant already belongs to a session
    #[error("Participant {participant_id} already joined session {session_id}")]
    ParticipantAlreadyJoined {
        /// Participant ID
        participant_id: ParticipantId,
        /// Session the participant currently belongs to
        session_id: SessionId,
    },

    /// Participant not found
    #[error("Participant {participant_id} not found in session {session_id}")]
    ParticipantNotFound {
        /// Session ID
        session_id: SessionId,
        /// Participant ID that was not found
        participant_id: ParticipantId,
    },

    /// Sequence number not greater than the last accepted one from this sender
    #[error("Stale sequence {seq} from {participant_id} (last accepted {last_accepted})")]
    StaleSequence {
        /// Sender
        participant_id: ParticipantId,
        /// Received sequence number
        seq: u64,
        /// Highest sequence number accepted so far
        last_accepted: u64,
    },

    /// Message kind a client is not allowed to send
    #[error("Message type {kind} is server-only")]
    ServerOnlyMessage {
        /// Offending message kind
        kind: String,
    },

    /// Invalid message format
    #[error("Invalid message format: {message}, error: {source}")]
    InvalidMessage {
        /// Invalid message content
        message: String,
        /// Parsing error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Configuration rejected during load or validation
    #[error("Invalid configuration: {reason}")]
    Configuration {
        /// Reason the configuration was rejected
        reason: String,
    },

    /// Server start failed
    #[error("Failed to start server on {address}: {source}")]
    ServerStartFailed {
        /// Address that failed to bind
        address: std::net::SocketAddr,
        /// Underlying error
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Internal bookkeeping of a session is inconsistent
    #[error("Internal fault in session {session_id}: {reason}")]
    Internal {
        /// Affected session
        session_id: SessionId,
        /// What was found to be inconsistent
        reason: String,
    },
}

impl ClassroomError {
    /// Get error code for programmatic handling
    pub fn error_code(&self) -> String {
        match self {
            ClassroomError::InvalidState { .. } => "INVALID_STATE".to_string(),
            ClassroomError::SessionNotFound { .. } => "SESSION_NOT_FOUND".to_string(),
            ClassroomError::SessionNotLive { .. } => "SESSION_NOT_LIVE".to_string(),
            ClassroomError::DuplicateSession { .. } => "DUPLICATE_SESSION".to_string(),
            ClassroomError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED".to_string(),
            ClassroomError::ParticipantAlreadyJoined { .. } => {
                "PARTICIPANT_ALREADY_JOINED".to_string()
            }
            ClassroomError::ParticipantNotFound { .. } => "PARTICIPANT_NOT_FOUND".to_string(),
            ClassroomError::StaleSequence { .. } => "STALE_SEQUENCE".to_string(),
            ClassroomError::ServerOnlyMessage { .. } => "SERVER_ONLY_MESSAGE".to_string(),
            ClassroomError::InvalidMessage { .. } => "INVALID_MESSAGE".to_string(),
            ClassroomError::Configuration { .. } => "INVALID_CONFIGURATION".to_string(),
            ClassroomError::ServerStartFailed { .. } => "SERVER_START_FAILED".to_string(),
            ClassroomError::Internal { .. } => "INTERNAL_FAULT".to_string(),
        }
    }

    /// Whether the error is a structured rejection that should be reported to
    /// the caller, as opposed to a fault recovered locally by discarding the
    /// message and logging.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ClassroomError::SessionNotFound { .. }
                | ClassroomError::SessionNotLive { .. }
                | ClassroomError::DuplicateSession { .. }
                | ClassroomError::CapacityExceeded { .. }
                | ClassroomError::ParticipantAlreadyJoined { .. }
                | ClassroomError::ParticipantNotFound { .. }
                | ClassroomError::ServerOnlyMessage { .. }
                | ClassroomError::InvalidMessage { .. }
        )
    }
}

/// Result alias used across the workspace
pub type Result<T, E = ClassroomError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ClassroomError::CapacityExceeded {
            session_id: "s1".into(),
            max_participants: 3,
        };
        assert_eq!(err.error_code(), "CAPACITY_EXCEEDED");
        assert!(err.is_rejection());
        assert_eq!(err.to_string(), "Session s1 is full (max participants: 3)");
    }

    #[test]
    fn test_invalid_state_is_recovered_locally() {
        let err = ClassroomError::InvalidState {
            expected: "joining".to_string(),
            actual: "left".to_string(),
        };
        assert!(!err.is_rejection());
        assert_eq!(err.error_code(), "INVALID_STATE");
    }
}
