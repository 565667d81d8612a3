//! # ClassCast Core
//!
//! Shared vocabulary of the live-session real-time communication layer:
//! identifiers, roles, quality tiers, the error taxonomy and the
//! configuration surface consumed by the signaling and diagnostics crates.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod types;

// Re-export main types
pub use config::{
    ClassroomConfig, LoggingConfig, QualityConfig, QualityThresholds, ServerConfig,
    SessionConfig, TierBitrates, TierThreshold, TimeoutConfig,
};
pub use error::{ClassroomError, Result};
pub use types::{ConnectionKey, ParticipantId, QualitySample, QualityTier, Role, SessionId};
