//! Identifiers and small value types shared by every ClassCast crate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a live session (one class instance)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier, typically one issued by the lecture layer
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a teacher or student
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Composite key of a participant connection: `(session_id, participant_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// Session the participant joined
    pub session_id: SessionId,
    /// Participant within that session
    pub participant_id: ParticipantId,
}

impl ConnectionKey {
    /// Build a key from its two halves
    pub fn new(session_id: SessionId, participant_id: ParticipantId) -> Self {
        Self {
            session_id,
            participant_id,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.participant_id)
    }
}

/// Role of a participant in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Session owner; always allowed to speak
    Teacher,
    /// Regular attendee; subject to floor control
    Student,
}

impl Role {
    /// Whether this role bypasses floor arbitration
    pub fn is_teacher(self) -> bool {
        matches!(self, Role::Teacher)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => write!(f, "teacher"),
            Role::Student => write!(f, "student"),
        }
    }
}

/// Discrete classification of a participant's network condition.
///
/// Variants are declared worst-first so the derived ordering reads naturally:
/// `AudioOnly < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityTier {
    /// Video disabled, audio only
    AudioOnly,
    /// Low-resolution video
    Low,
    /// Standard video
    Medium,
    /// Full quality video
    High,
}

impl QualityTier {
    /// All tiers, best first
    pub const ALL: [QualityTier; 4] = [
        QualityTier::High,
        QualityTier::Medium,
        QualityTier::Low,
        QualityTier::AudioOnly,
    ];

    /// Whether video should be sent at this tier
    pub fn video_enabled(self) -> bool {
        !matches!(self, QualityTier::AudioOnly)
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::High => "high",
            QualityTier::Medium => "medium",
            QualityTier::Low => "low",
            QualityTier::AudioOnly => "audio-only",
        };
        write!(f, "{}", name)
    }
}

/// One network quality measurement reported by a participant's client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    /// Session the measurement belongs to
    pub session_id: SessionId,
    /// Participant that reported it
    pub participant_id: ParticipantId,
    /// Server-observed time the report arrived
    pub taken_at: DateTime<Utc>,
    /// Measured round-trip latency in milliseconds
    pub rtt_ms: u32,
    /// Estimated available bandwidth in kbps
    pub bandwidth_kbps: u32,
    /// Packet loss ratio (0.0 to 1.0)
    pub packet_loss: f32,
}

impl QualitySample {
    /// Build a sample stamped with the current time
    pub fn new(
        key: &ConnectionKey,
        rtt_ms: u32,
        bandwidth_kbps: u32,
        packet_loss: f32,
    ) -> Self {
        Self {
            session_id: key.session_id.clone(),
            participant_id: key.participant_id.clone(),
            taken_at: Utc::now(),
            rtt_ms,
            bandwidth_kbps,
            packet_loss: packet_loss.clamp(0.0, 1.0),
        }
    }
}
