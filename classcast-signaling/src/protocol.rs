//! Signaling protocol messages
//!
//! Clients send [`Envelope`]s and receive [`ServerEnvelope`]s, both encoded
//! as JSON text frames. Message kinds form a closed set; negotiation payloads
//! are opaque JSON and are forwarded untouched.

use crate::floor::FloorRevokeReason;
use chrono::{DateTime, Utc};
use classcast_core::{ClassroomError, ParticipantId, QualityTier, Role, SessionId};
use classcast_diagnostics::MediaPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Addressee of a client message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Every other participant of the session
    #[default]
    Broadcast,
    /// One specific participant
    Participant(ParticipantId),
}

/// Message sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Sending participant
    pub sender: ParticipantId,
    /// Addressee; defaults to broadcast
    #[serde(default)]
    pub target: Target,
    /// Per-sender sequence number, strictly increasing
    pub seq: u64,
    /// Message body
    pub message: ClientMessage,
}

/// Body of a client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join the session
    Join {
        /// Role authorised upstream
        role: Role,
    },
    /// Leave the session
    Leave,
    /// Session description offer
    Offer {
        /// Opaque negotiation payload
        payload: serde_json::Value,
    },
    /// Session description answer
    Answer {
        /// Opaque negotiation payload
        payload: serde_json::Value,
    },
    /// ICE candidate, or the end-of-candidates acknowledgement
    IceCandidate {
        /// Opaque candidate payload
        payload: serde_json::Value,
        /// Set on the final candidate exchange acknowledgement
        #[serde(default)]
        complete: bool,
    },
    /// Network quality measurement; also serves as heartbeat
    QualityReport {
        /// Round-trip latency in milliseconds
        rtt_ms: u32,
        /// Available bandwidth estimate in kbps
        bandwidth_kbps: u32,
        /// Packet loss ratio (0.0 to 1.0)
        packet_loss: f32,
    },
    /// Ask for permission to speak
    FloorRequest,
    /// Give up the floor, or withdraw a pending request
    FloorRevoke,
    /// Server-only; rejected when sent by a client
    FloorGrant,
    /// Server-only; rejected when sent by a client
    Directive,
}

impl ClientMessage {
    /// Kind tag of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Join { .. } => MessageKind::Join,
            ClientMessage::Leave => MessageKind::Leave,
            ClientMessage::Offer { .. } => MessageKind::Offer,
            ClientMessage::Answer { .. } => MessageKind::Answer,
            ClientMessage::IceCandidate { .. } => MessageKind::IceCandidate,
            ClientMessage::QualityReport { .. } => MessageKind::QualityReport,
            ClientMessage::FloorRequest => MessageKind::FloorRequest,
            ClientMessage::FloorRevoke => MessageKind::FloorRevoke,
            ClientMessage::FloorGrant => MessageKind::FloorGrant,
            ClientMessage::Directive => MessageKind::Directive,
        }
    }
}

/// Closed set of signaling message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// join
    Join,
    /// leave
    Leave,
    /// offer
    Offer,
    /// answer
    Answer,
    /// ice-candidate
    IceCandidate,
    /// quality-report
    QualityReport,
    /// floor-request
    FloorRequest,
    /// floor-grant
    FloorGrant,
    /// floor-revoke
    FloorRevoke,
    /// directive
    Directive,
}

impl MessageKind {
    /// Whether only the server may emit this kind
    pub fn is_server_only(self) -> bool {
        matches!(self, MessageKind::FloorGrant | MessageKind::Directive)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::QualityReport => "quality-report",
            MessageKind::FloorRequest => "floor-request",
            MessageKind::FloorGrant => "floor-grant",
            MessageKind::FloorRevoke => "floor-revoke",
            MessageKind::Directive => "directive",
        };
        write!(f, "{}", name)
    }
}

/// Message delivered to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Original sender for relayed messages; `None` when the server speaks
    pub from: Option<ParticipantId>,
    /// Sender's sequence number for relayed messages, otherwise a per-connection
    /// server sequence starting at 1. Zero marks an unsequenced direct reply.
    pub seq: u64,
    /// Server-observed receive (or emission) time
    pub received_at: DateTime<Utc>,
    /// Message body
    pub message: ServerMessage,
}

impl ServerEnvelope {
    /// Unsequenced reply sent straight back on a connection, e.g. a rejection
    /// before the connection has joined
    pub fn direct(session_id: SessionId, message: ServerMessage) -> Self {
        Self {
            session_id,
            from: None,
            seq: 0,
            received_at: Utc::now(),
            message,
        }
    }
}

/// Summary of a participant already present, sent to a new joiner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Participant ID
    pub participant_id: ParticipantId,
    /// Participant role
    pub role: Role,
}

/// Why a participant left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Explicit leave message
    Requested,
    /// Transport closed
    Disconnected,
    /// Liveness and grace windows expired
    TimedOut,
}

/// Media instruction issued by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Directive {
    /// Switch to a quality tier
    Quality {
        /// New tier
        tier: QualityTier,
        /// Outgoing bitrate ceiling in kbps
        max_bitrate_kbps: u32,
        /// Whether video should be sent
        video_enabled: bool,
        /// Whether the connection now counts as degraded
        degraded: bool,
    },
    /// Negotiation timed out; start a new offer/answer exchange
    RetryNegotiation {
        /// Number of expired attempts so far
        attempt: u32,
    },
}

impl Directive {
    /// Quality directive for a media policy
    pub fn quality(policy: MediaPolicy, degraded: bool) -> Self {
        Directive::Quality {
            tier: policy.tier,
            max_bitrate_kbps: policy.max_bitrate_kbps,
            video_enabled: policy.video_enabled,
            degraded,
        }
    }
}

/// Soft notices that are not errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Notice {
    /// A relayed message could not be handed to its target
    DeliveryDropped {
        /// Intended target
        target: ParticipantId,
        /// Sequence number of the dropped message
        seq: u64,
    },
}

/// Body of a server message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// A participant joined; the joiner's own copy lists existing peers
    Joined {
        /// Participant that joined
        participant_id: ParticipantId,
        /// Its role
        role: Role,
        /// Participants already present (joiner's copy only)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        peers: Vec<PeerSummary>,
    },
    /// A participant left
    Left {
        /// Participant that left
        participant_id: ParticipantId,
        /// Why it left
        reason: LeaveReason,
    },
    /// Relayed offer
    Offer {
        /// Opaque negotiation payload
        payload: serde_json::Value,
    },
    /// Relayed answer
    Answer {
        /// Opaque negotiation payload
        payload: serde_json::Value,
    },
    /// Relayed ICE candidate
    IceCandidate {
        /// Opaque candidate payload
        payload: serde_json::Value,
        /// End-of-candidates acknowledgement
        complete: bool,
    },
    /// Media directive
    Directive {
        /// Instruction
        directive: Directive,
    },
    /// Permission to speak granted
    FloorGrant {
        /// Participant now allowed to speak
        participant_id: ParticipantId,
    },
    /// Permission to speak withdrawn
    FloorRevoke {
        /// Participant that lost the floor
        participant_id: ParticipantId,
        /// Why the floor was withdrawn
        reason: FloorRevokeReason,
    },
    /// The session ended; the connection has been evicted
    SessionStopped {
        /// Human-readable reason
        reason: String,
    },
    /// Structured rejection of a client message
    Rejected {
        /// Error message
        error: String,
        /// Error code for programmatic handling
        error_code: String,
        /// Sequence number of the rejected message, when known
        seq: Option<u64>,
    },
    /// Soft notice
    Notice {
        /// Notice body
        notice: Notice,
    },
}

impl ServerMessage {
    /// Rejection body for an error
    pub fn rejected(error: &ClassroomError, seq: Option<u64>) -> Self {
        ServerMessage::Rejected {
            error: error.to_string(),
            error_code: error.error_code(),
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let text = r#"{
            "session_id": "s1",
            "sender": "alice",
            "target": {"participant": "bob"},
            "seq": 4,
            "message": {"type": "offer", "payload": {"sdp": "v=0"}}
        }"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.target, Target::Participant("bob".into()));
        assert_eq!(envelope.message.kind(), MessageKind::Offer);
        match envelope.message {
            ClientMessage::Offer { payload } => assert_eq!(payload, json!({"sdp": "v=0"})),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_target_defaults_to_broadcast() {
        let text = r#"{"session_id":"s1","sender":"alice","seq":1,"message":{"type":"floor-request"}}"#;
        let envelope: Envelope = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.target, Target::Broadcast);
        assert_eq!(envelope.message, ClientMessage::FloorRequest);
    }

    #[test]
    fn test_ice_candidate_completion_flag_is_optional() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type":"ice-candidate","payload":"candidate:1"}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::IceCandidate {
                payload: json!("candidate:1"),
                complete: false
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"mute-everyone"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_server_only_kinds() {
        assert!(MessageKind::FloorGrant.is_server_only());
        assert!(MessageKind::Directive.is_server_only());
        assert!(!MessageKind::FloorRevoke.is_server_only());
        assert_eq!(MessageKind::QualityReport.to_string(), "quality-report");
    }

    #[test]
    fn test_directive_serialization() {
        let message = ServerMessage::Directive {
            directive: Directive::Quality {
                tier: QualityTier::AudioOnly,
                max_bitrate_kbps: 48,
                video_enabled: false,
                degraded: true,
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "directive");
        assert_eq!(json["directive"]["kind"], "quality");
        assert_eq!(json["directive"]["tier"], "audio-only");

        let back: ServerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_joined_omits_empty_peers() {
        let message = ServerMessage::Joined {
            participant_id: "carol".into(),
            role: Role::Student,
            peers: vec![],
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("peers"));
        assert!(json.contains(r#""type":"joined""#));
    }

    #[test]
    fn test_rejection_body() {
        let err = ClassroomError::SessionNotLive {
            session_id: "s1".into(),
            state: "stopped".to_string(),
        };
        match ServerMessage::rejected(&err, Some(7)) {
            ServerMessage::Rejected {
                error_code, seq, ..
            } => {
                assert_eq!(error_code, "SESSION_NOT_LIVE");
                assert_eq!(seq, Some(7));
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }
}
