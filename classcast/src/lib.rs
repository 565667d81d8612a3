//! # ClassCast - live classroom communication core
//!
//! ClassCast runs the real-time side of a live class on poor networks:
//! session membership, WebRTC signaling relay, per-student adaptive quality
//! and floor control.
//!
//! ## Key Features
//!
//! - **Session registry**: one authoritative owner of rosters and connection state
//! - **Adaptive quality**: immediate downgrades, hysteresis on upgrades, audio-only fallback
//! - **Floor control**: FIFO student queue, teacher preemption, maximum hold time
//! - **Failure detection**: liveness, reconnect grace and negotiation timeouts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use classcast::ClassCast;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let classcast = ClassCast::init()?;
//!
//!     // The lecture layer opens a session for an authorised teacher
//!     let session_id = classcast.open_session("teacher-42".into())?;
//!     println!("Session {} is live", session_id);
//!
//!     // Serve WebSocket signaling until the process is stopped
//!     classcast.serve().await?;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use classcast_core::{
    ClassroomConfig, ClassroomError, ConnectionKey, ParticipantId, QualitySample, QualityTier,
    Result, Role, SessionId,
};

pub use classcast_diagnostics::{
    init_logging, AdaptiveQualityController, MediaPolicy, QualitySampleStore, QualitySummary,
    TierChange,
};

pub use classcast_signaling::{
    ClientMessage, ConnectionState, Directive, Envelope, FloorRevokeReason, RegistryStats,
    RosterSnapshot, ServerEnvelope, ServerMessage, SessionDirectory, SessionRegistry,
    SessionState, SignalingRelay, SignalingServer, SweepReport,
};

use std::sync::Arc;

/// Main entry point for ClassCast
#[derive(Debug, Clone)]
pub struct ClassCast {
    inner: Arc<ClassCastInner>,
}

#[derive(Debug)]
struct ClassCastInner {
    config: ClassroomConfig,
    registry: Arc<SessionRegistry>,
    relay: Arc<SignalingRelay>,
}

impl ClassCast {
    /// Initialize from defaults, overridden by `CLASSCAST__*` environment variables
    ///
    /// # Example
    /// ```rust,no_run
    /// use classcast::ClassCast;
    ///
    /// let classcast = ClassCast::init()?;
    /// # Ok::<(), classcast::ClassroomError>(())
    /// ```
    pub fn init() -> Result<Self> {
        Self::init_with(ClassroomConfig::load(None)?)
    }

    /// Initialize with an explicit configuration
    pub fn init_with(config: ClassroomConfig) -> Result<Self> {
        config.validate()?;
        init_logging(&config.logging)?;

        let registry = Arc::new(SessionRegistry::new(config.clone()));
        let relay = Arc::new(SignalingRelay::new(Arc::clone(&registry)));
        tracing::info!(
            "ClassCast initialised (max {} participants per session)",
            config.session.max_participants
        );

        Ok(Self {
            inner: Arc::new(ClassCastInner {
                config,
                registry,
                relay,
            }),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ClassroomConfig {
        &self.inner.config
    }

    /// Session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Message relay
    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.inner.relay
    }

    /// Read-only roster discovery
    pub fn directory(&self) -> SessionDirectory {
        SessionDirectory::new(Arc::clone(&self.inner.registry))
    }

    /// Create and start a session for a teacher
    pub fn open_session(&self, teacher_id: ParticipantId) -> Result<SessionId> {
        let session_id = self.inner.registry.create_session(teacher_id)?;
        self.inner.registry.start(&session_id)?;
        Ok(session_id)
    }

    /// Stop a session. Returns false if it was already stopped.
    pub fn stop_session(&self, session_id: &SessionId) -> Result<bool> {
        self.inner.registry.stop(session_id)
    }

    /// Run the timeout supervisor and the WebSocket server on the configured address
    pub async fn serve(&self) -> Result<()> {
        let addr = self.inner.config.server.socket_addr()?;
        let server = SignalingServer::new(addr, Arc::clone(&self.inner.relay));
        let supervisor = self.inner.registry.spawn_supervisor();

        let result = server.start().await;
        supervisor.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_stop_session() {
        let classcast = ClassCast::init_with(ClassroomConfig::default()).unwrap();
        let session_id = classcast.open_session("teacher".into()).unwrap();

        let snapshot = classcast.directory().snapshot(&session_id).unwrap();
        assert_eq!(snapshot.state, SessionState::Live);
        assert_eq!(snapshot.teacher_id.as_str(), "teacher");

        assert!(classcast.stop_session(&session_id).unwrap());
        assert!(!classcast.stop_session(&session_id).unwrap());
        assert_eq!(classcast.registry().stats().stopped_sessions, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = ClassroomConfig::default();
        config.session.max_participants = 0;
        let err = ClassCast::init_with(config).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ClassroomConfig::default();
        config.server.bind_addr = listener.local_addr().unwrap().to_string();

        let classcast = ClassCast::init_with(config).unwrap();
        let err = classcast.serve().await.unwrap_err();
        assert_eq!(err.error_code(), "SERVER_START_FAILED");
    }
}
