//! Session registry
//!
//! Owns every session, every participant connection record, the quality
//! sample store and the outbound delivery hub.
//!
//! ## Locking
//! Each session sits behind its own mutex; roster changes, floor changes and
//! lifecycle changes for one session are serialised on it while different
//! sessions proceed independently. Connection records live in a concurrent map
//! so per-message work (heartbeats, sequence checks, quality reports) does not
//! take the session mutex. Lock order is session mutex first, then map entries.
//! No map guard is ever held while a session mutex is acquired.

use crate::connection::{ConnectionEvent, ConnectionState, ParticipantConnection, Transition};
use crate::discovery::{RosterEntry, RosterSnapshot};
use crate::floor::{FloorController, FloorEvent};
use crate::hub::{DeliveryHub, DeliveryStats, Outlet};
use crate::protocol::{Directive, LeaveReason, PeerSummary, ServerMessage, Target};
use crate::session::{Session, SessionState};
use classcast_core::{
    ClassroomConfig, ClassroomError, ConnectionKey, ParticipantId, QualitySample, QualityTier,
    Result, Role, SessionId,
};
use classcast_diagnostics::{AdaptiveQualityController, QualitySampleStore, TierChange};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct SessionSlot {
    live: AtomicBool,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    session: Session,
    floor: FloorController,
}

/// Outcome of a quality report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityOutcome {
    /// Connection state after the report
    pub state: ConnectionState,
    /// Tier after the report
    pub tier: QualityTier,
    /// Tier change, if one was decided
    pub change: Option<TierChange>,
}

/// What one supervisor pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections moved to `reconnecting`
    pub reconnecting: Vec<ConnectionKey>,
    /// Connections evicted after their grace expired
    pub evicted: Vec<ConnectionKey>,
    /// Connections sent back to `joining` after a negotiation timeout
    pub negotiation_retries: Vec<ConnectionKey>,
    /// Floors revoked on maximum hold time
    pub floors_expired: Vec<ConnectionKey>,
    /// Sessions force-stopped after an internal fault
    pub faulted: Vec<SessionId>,
    /// Stopped sessions dropped after their retention period
    pub purged: Vec<SessionId>,
}

impl SweepReport {
    /// Whether the pass changed nothing
    pub fn is_empty(&self) -> bool {
        self.reconnecting.is_empty()
            && self.evicted.is_empty()
            && self.negotiation_retries.is_empty()
            && self.floors_expired.is_empty()
            && self.faulted.is_empty()
            && self.purged.is_empty()
    }
}

/// Registry counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions in `created`
    pub created_sessions: usize,
    /// Sessions in `live`
    pub live_sessions: usize,
    /// Stopped sessions still retained
    pub stopped_sessions: usize,
    /// Participant connection records
    pub connections: usize,
    /// Participants currently allowed to speak
    pub floor_holders: usize,
    /// Connections with a quality window
    pub quality_windows: usize,
    /// Outbound delivery counters
    pub delivery: DeliveryStats,
}

/// Authoritative registry of sessions and participant connections
pub struct SessionRegistry {
    config: Arc<ClassroomConfig>,
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    owners: DashMap<ParticipantId, SessionId>,
    memberships: DashMap<ParticipantId, SessionId>,
    connections: DashMap<ConnectionKey, ParticipantConnection>,
    purged: DashSet<SessionId>,
    quality: QualitySampleStore,
    controller: AdaptiveQualityController,
    hub: DeliveryHub,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new(config: ClassroomConfig) -> Self {
        let quality = QualitySampleStore::from_config(&config.quality);
        let controller = AdaptiveQualityController::new(&config.quality);
        Self {
            config: Arc::new(config),
            sessions: DashMap::new(),
            owners: DashMap::new(),
            memberships: DashMap::new(),
            connections: DashMap::new(),
            purged: DashSet::new(),
            quality,
            controller,
            hub: DeliveryHub::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ClassroomConfig {
        &self.config
    }

    /// Quality sample store
    pub fn quality(&self) -> &QualitySampleStore {
        &self.quality
    }

    /// Tier controller
    pub fn controller(&self) -> &AdaptiveQualityController {
        &self.controller
    }

    /// Outbound delivery hub
    pub fn hub(&self) -> &DeliveryHub {
        &self.hub
    }

    /// Register a new session with a generated ID
    pub fn create_session(&self, teacher_id: ParticipantId) -> Result<SessionId> {
        self.create_session_with_id(SessionId::generate(), teacher_id)
    }

    /// Register a new session under an ID issued by the caller.
    ///
    /// Fails with `DuplicateSession` if the teacher already owns a session that
    /// has not stopped, or if the ID is taken.
    pub fn create_session_with_id(
        &self,
        session_id: SessionId,
        teacher_id: ParticipantId,
    ) -> Result<SessionId> {
        match self.owners.entry(teacher_id.clone()) {
            Entry::Occupied(existing) => Err(ClassroomError::DuplicateSession {
                teacher_id,
                session_id: existing.get().clone(),
            }),
            Entry::Vacant(owner) => {
                match self.sessions.entry(session_id.clone()) {
                    Entry::Occupied(_) => {
                        return Err(ClassroomError::DuplicateSession {
                            teacher_id,
                            session_id,
                        })
                    }
                    Entry::Vacant(slot) => {
                        let session = Session::new(
                            session_id.clone(),
                            teacher_id.clone(),
                            self.config.session.max_participants,
                        );
                        slot.insert(Arc::new(SessionSlot {
                            live: AtomicBool::new(false),
                            inner: Mutex::new(SessionInner {
                                session,
                                floor: FloorController::new(self.config.timeouts.floor_max_hold()),
                            }),
                        }));
                    }
                }
                owner.insert(session_id.clone());
                self.purged.remove(&session_id);
                tracing::info!("Session {} created by teacher {}", session_id, teacher_id);
                Ok(session_id)
            }
        }
    }

    /// Open a created session to participants
    pub fn start(&self, session_id: &SessionId) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut inner = slot.inner.lock();
        inner.session.start()?;
        slot.live.store(true, Ordering::Release);
        tracing::info!("Session {} is live", session_id);
        Ok(())
    }

    /// End a session, evicting every participant.
    ///
    /// Idempotent: stopping a stopped session returns `Ok(false)` and has no
    /// side effects, including after the sweep has purged it.
    pub fn stop(&self, session_id: &SessionId) -> Result<bool> {
        if self.purged.contains(session_id) {
            tracing::debug!("Session {} already stopped and purged", session_id);
            return Ok(false);
        }
        let slot = self.slot(session_id)?;
        let mut inner = slot.inner.lock();
        if inner.session.state == SessionState::Stopped {
            tracing::debug!("Session {} already stopped", session_id);
            return Ok(false);
        }
        self.shutdown_locked(&slot, &mut inner, "session ended", Instant::now());
        Ok(true)
    }

    /// Stop a session because its bookkeeping can no longer be trusted
    pub fn force_stop(&self, session_id: &SessionId, reason: &str) -> Result<()> {
        if self.purged.contains(session_id) {
            return Ok(());
        }
        let slot = self.slot(session_id)?;
        let mut inner = slot.inner.lock();
        if inner.session.state != SessionState::Stopped {
            tracing::error!("Force-stopping session {}: {}", session_id, reason);
            self.shutdown_locked(&slot, &mut inner, reason, Instant::now());
        }
        Ok(())
    }

    /// Admit a participant and register its outbound queue.
    ///
    /// The joiner receives a `joined` message listing the peers already present;
    /// every peer receives a `joined` message announcing the joiner.
    pub fn join(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        role: Role,
        outlet: Outlet,
    ) -> Result<ParticipantConnection> {
        let slot = self.slot(session_id)?;
        let mut inner = slot.inner.lock();
        inner.session.ensure_live()?;

        if inner.session.contains(participant_id) {
            return Err(ClassroomError::ParticipantAlreadyJoined {
                participant_id: participant_id.clone(),
                session_id: session_id.clone(),
            });
        }
        if inner.session.is_full() {
            tracing::warn!(
                "Rejecting {} from session {}: at capacity ({})",
                participant_id,
                session_id,
                inner.session.max_participants
            );
            return Err(ClassroomError::CapacityExceeded {
                session_id: session_id.clone(),
                max_participants: inner.session.max_participants,
            });
        }
        match self.memberships.entry(participant_id.clone()) {
            Entry::Occupied(other) => {
                return Err(ClassroomError::ParticipantAlreadyJoined {
                    participant_id: participant_id.clone(),
                    session_id: other.get().clone(),
                })
            }
            Entry::Vacant(membership) => {
                membership.insert(session_id.clone());
            }
        }

        let key = ConnectionKey::new(session_id.clone(), participant_id.clone());
        let connection = ParticipantConnection::new(
            key.clone(),
            role,
            self.controller.initial_tier(),
            Instant::now(),
        );

        let peers: Vec<PeerSummary> = inner
            .session
            .participants
            .iter()
            .filter_map(|peer| {
                self.connections
                    .get(&ConnectionKey::new(session_id.clone(), peer.clone()))
                    .map(|c| PeerSummary {
                        participant_id: peer.clone(),
                        role: c.role,
                    })
            })
            .collect();

        inner.session.participants.push(participant_id.clone());
        self.connections.insert(key.clone(), connection.clone());
        self.hub.attach(key.clone(), outlet);

        self.hub.send_server(
            &key,
            ServerMessage::Joined {
                participant_id: participant_id.clone(),
                role,
                peers,
            },
        );
        self.notify_peers(
            &inner.session,
            participant_id,
            ServerMessage::Joined {
                participant_id: participant_id.clone(),
                role,
                peers: Vec::new(),
            },
        );

        tracing::info!(
            "Participant {} joined session {} as {} ({}/{})",
            participant_id,
            session_id,
            role,
            inner.session.participants.len(),
            inner.session.max_participants
        );
        Ok(connection)
    }

    /// Remove a participant at its own request
    pub fn leave(&self, session_id: &SessionId, participant_id: &ParticipantId) -> Result<()> {
        let key = ConnectionKey::new(session_id.clone(), participant_id.clone());
        self.remove(&key, LeaveReason::Requested)
    }

    /// Remove a participant whose transport closed. Unknown connections are ignored.
    pub fn disconnect(&self, key: &ConnectionKey) {
        match self.remove(key, LeaveReason::Disconnected) {
            Ok(()) => {}
            Err(e) => tracing::debug!("Disconnect of {} ignored: {}", key, e),
        }
    }

    fn remove(&self, key: &ConnectionKey, reason: LeaveReason) -> Result<()> {
        let slot = self.slot(&key.session_id)?;
        let mut inner = slot.inner.lock();
        self.evict_locked(&mut inner, key, reason, Instant::now())
    }

    /// Check that an inbound message may be processed: the session is live,
    /// the sender is a member and the sequence number is fresh. Any inbound
    /// message counts as a heartbeat, stale ones included.
    pub fn accept_inbound(&self, key: &ConnectionKey, seq: u64, now: Instant) -> Result<()> {
        let slot = self.slot(&key.session_id)?;
        if !slot.live.load(Ordering::Acquire) {
            let state = slot.inner.lock().session.state;
            return Err(ClassroomError::SessionNotLive {
                session_id: key.session_id.clone(),
                state: state.to_string(),
            });
        }

        let mut connection = self
            .connections
            .get_mut(key)
            .ok_or_else(|| not_a_member(key))?;
        connection.touch(now);
        connection.accept_seq(seq)
    }

    /// Record transport-level liveness (e.g. a WebSocket ping)
    pub fn heartbeat(&self, key: &ConnectionKey, now: Instant) {
        if let Some(mut connection) = self.connections.get_mut(key) {
            connection.touch(now);
        }
    }

    /// Apply a negotiation event to a connection
    pub fn apply_event(
        &self,
        key: &ConnectionKey,
        event: ConnectionEvent,
        now: Instant,
    ) -> Result<Transition> {
        let mut connection = self
            .connections
            .get_mut(key)
            .ok_or_else(|| not_a_member(key))?;
        let mut transition = connection.apply(event, now)?;

        // A completed (re)negotiation lands in whichever of connected/degraded
        // matches the current tier
        if transition.changed() && transition.to.is_media_active() {
            let settle = self.tier_event(connection.tier);
            transition.to = connection.apply(settle, now)?.to;
        }
        Ok(transition)
    }

    /// Store a quality report, re-evaluate the tier and send a directive to the
    /// reporting participant if the tier changed
    pub fn record_quality(
        &self,
        key: &ConnectionKey,
        rtt_ms: u32,
        bandwidth_kbps: u32,
        packet_loss: f32,
        now: Instant,
    ) -> Result<QualityOutcome> {
        let mut connection = self
            .connections
            .get_mut(key)
            .ok_or_else(|| not_a_member(key))?;
        connection.apply(ConnectionEvent::QualityReported, now)?;

        let sample = QualitySample::new(key, rtt_ms, bandwidth_kbps, packet_loss);
        let window = self.quality.record(key, sample, now);
        let change = self.controller.evaluate(connection.tier, &window);
        if let Some(change) = change {
            connection.tier = change.to;
        }

        if connection.state.is_media_active() {
            let event = self.tier_event(connection.tier);
            connection.apply(event, now)?;
        }

        let outcome = QualityOutcome {
            state: connection.state,
            tier: connection.tier,
            change,
        };
        drop(connection);

        if let Some(change) = change {
            tracing::info!(
                "Connection {} tier {} -> {} ({:?})",
                key,
                change.from,
                change.to,
                change.direction
            );
            let degraded = self.controller.is_degraded(change.to);
            let policy = self.controller.media_policy(change.to);
            self.hub.send_server(
                key,
                ServerMessage::Directive {
                    directive: Directive::quality(policy, degraded),
                },
            );
        }
        Ok(outcome)
    }

    /// Handle a floor request from a member of a live session
    pub fn floor_request(&self, key: &ConnectionKey, now: Instant) -> Result<Vec<FloorEvent>> {
        let slot = self.slot(&key.session_id)?;
        let mut inner = slot.inner.lock();
        inner.session.ensure_live()?;
        let role = self
            .connections
            .get(key)
            .map(|c| c.role)
            .ok_or_else(|| not_a_member(key))?;

        let events = inner.floor.request(&key.participant_id, role, now);
        self.publish_floor_events(&key.session_id, &events);
        Ok(events)
    }

    /// Handle a floor release (or withdrawal of a pending request)
    pub fn floor_release(&self, key: &ConnectionKey, now: Instant) -> Result<Vec<FloorEvent>> {
        let slot = self.slot(&key.session_id)?;
        let mut inner = slot.inner.lock();
        inner.session.ensure_live()?;
        if !inner.session.contains(&key.participant_id) {
            return Err(not_a_member(key));
        }

        let events = inner.floor.release(&key.participant_id, now);
        self.publish_floor_events(&key.session_id, &events);
        Ok(events)
    }

    /// Resolve the recipients of a relayed message, excluding the sender
    pub fn resolve_targets(&self, sender: &ConnectionKey, target: &Target) -> Result<Vec<ParticipantId>> {
        let slot = self.slot(&sender.session_id)?;
        let inner = slot.inner.lock();
        inner.session.ensure_live()?;

        Ok(match target {
            Target::Broadcast => inner
                .session
                .participants
                .iter()
                .filter(|p| **p != sender.participant_id)
                .cloned()
                .collect(),
            Target::Participant(p) if *p == sender.participant_id => Vec::new(),
            Target::Participant(p) => vec![p.clone()],
        })
    }

    /// Copy of a connection record
    pub fn connection(&self, key: &ConnectionKey) -> Option<ParticipantConnection> {
        self.connections.get(key).map(|c| c.clone())
    }

    /// Copy of a session record
    pub fn session(&self, session_id: &SessionId) -> Option<Session> {
        let slot = self.sessions.get(session_id).map(|s| Arc::clone(s.value()))?;
        let session = slot.inner.lock().session.clone();
        Some(session)
    }

    /// Session a participant currently belongs to
    pub fn session_of(&self, participant_id: &ParticipantId) -> Option<SessionId> {
        self.memberships.get(participant_id).map(|s| s.clone())
    }

    /// IDs of all live sessions
    pub fn live_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().live.load(Ordering::Acquire))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Roster of a session with each member's connection state
    pub fn snapshot(&self, session_id: &SessionId) -> Result<RosterSnapshot> {
        let slot = self.slot(session_id)?;
        let inner = slot.inner.lock();
        let participants = inner
            .session
            .participants
            .iter()
            .filter_map(|p| {
                let key = ConnectionKey::new(session_id.clone(), p.clone());
                self.connections.get(&key).map(|c| RosterEntry {
                    participant_id: p.clone(),
                    role: c.role,
                    state: c.state,
                    tier: c.tier,
                    has_floor: c.has_floor,
                    joined_at: c.joined_at,
                })
            })
            .collect();

        Ok(RosterSnapshot {
            session_id: session_id.clone(),
            teacher_id: inner.session.teacher_id.clone(),
            state: inner.session.state,
            max_participants: inner.session.max_participants,
            floor_holder: inner.floor.holder().cloned(),
            floor_queue: inner.floor.queue().cloned().collect(),
            participants,
            taken_at: chrono::Utc::now(),
        })
    }

    /// Registry counters
    pub fn stats(&self) -> RegistryStats {
        let slots: Vec<Arc<SessionSlot>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut stats = RegistryStats {
            connections: self.connections.len(),
            quality_windows: self.quality.connection_count(),
            delivery: self.hub.stats(),
            ..RegistryStats::default()
        };
        for slot in slots {
            let inner = slot.inner.lock();
            match inner.session.state {
                SessionState::Created => stats.created_sessions += 1,
                SessionState::Live => stats.live_sessions += 1,
                SessionState::Stopped => stats.stopped_sessions += 1,
            }
            stats.floor_holders += inner.floor.speaking_teachers().count()
                + usize::from(inner.floor.holder().is_some());
        }
        stats
    }

    /// One supervisor pass: liveness, grace, negotiation and floor timers, plus
    /// purging of stopped sessions past their retention
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let slots: Vec<(SessionId, Arc<SessionSlot>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let retention = self.config.session.stopped_retention();
        for (session_id, slot) in slots {
            let mut inner = slot.inner.lock();
            match inner.session.state {
                SessionState::Created => {}
                SessionState::Live => self.sweep_session(&slot, &mut inner, now, &mut report),
                SessionState::Stopped => {
                    if inner.session.is_expired(now, retention) {
                        report.purged.push(session_id);
                    }
                }
            }
        }

        for session_id in &report.purged {
            self.sessions.remove(session_id);
            self.purged.insert(session_id.clone());
            tracing::debug!("Purged stopped session {}", session_id);
        }
        report
    }

    /// Run `sweep` periodically until the registry is dropped
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.timeouts.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let report = registry.sweep(tokio::time::Instant::now().into_std());
                if !report.is_empty() {
                    tracing::debug!("Supervisor pass: {:?}", report);
                }
            }
            tracing::debug!("Supervisor stopped");
        })
    }

    fn sweep_session(
        &self,
        slot: &SessionSlot,
        inner: &mut SessionInner,
        now: Instant,
        report: &mut SweepReport,
    ) {
        let timeouts = &self.config.timeouts;
        let liveness = timeouts.liveness();
        let grace = timeouts.grace();
        let negotiation = timeouts.negotiation();
        let session_id = inner.session.id.clone();

        let mut evict = Vec::new();
        let mut silent = Vec::new();
        let mut fault = None;

        for participant_id in &inner.session.participants {
            let key = ConnectionKey::new(session_id.clone(), participant_id.clone());
            let Some(mut connection) = self.connections.get_mut(&key) else {
                fault = Some(format!("roster member {} has no connection record", participant_id));
                break;
            };

            match connection.state {
                ConnectionState::Connected | ConnectionState::Degraded
                    if connection.silent_for(now) >= liveness =>
                {
                    if connection.apply(ConnectionEvent::LivenessExpired, now).is_ok() {
                        tracing::info!("Connection {} silent, now reconnecting", key);
                        silent.push(participant_id.clone());
                        report.reconnecting.push(key);
                    }
                }
                ConnectionState::Reconnecting if connection.in_state_for(now) >= grace => {
                    evict.push(key);
                }
                ConnectionState::Negotiating if connection.in_state_for(now) >= negotiation => {
                    if connection.apply(ConnectionEvent::NegotiationExpired, now).is_ok() {
                        connection.negotiation_attempts += 1;
                        let attempt = connection.negotiation_attempts;
                        tracing::info!("Negotiation for {} timed out (attempt {})", key, attempt);
                        self.hub.send_server(
                            &key,
                            ServerMessage::Directive {
                                directive: Directive::RetryNegotiation { attempt },
                            },
                        );
                        report.negotiation_retries.push(key);
                    }
                }
                ConnectionState::Joining if connection.silent_for(now) >= liveness + grace => {
                    evict.push(key);
                }
                _ => {}
            }
        }

        if let Some(reason) = fault {
            tracing::error!("Force-stopping session {}: {}", session_id, reason);
            self.shutdown_locked(slot, inner, &reason, now);
            report.faulted.push(session_id);
            return;
        }

        // A silent participant cannot hold the floor or its place in the queue
        for participant_id in silent {
            let events = inner.floor.remove(&participant_id, now);
            self.publish_floor_events(&session_id, &events);
        }

        for key in evict {
            match self.evict_locked(inner, &key, LeaveReason::TimedOut, now) {
                Ok(()) => report.evicted.push(key),
                Err(e) => tracing::warn!("Failed to evict {}: {}", key, e),
            }
        }

        let events = inner.floor.expire(now);
        for event in &events {
            if let FloorEvent::Revoked { participant_id, .. } = event {
                report
                    .floors_expired
                    .push(ConnectionKey::new(session_id.clone(), participant_id.clone()));
            }
        }
        self.publish_floor_events(&session_id, &events);
    }

    fn slot(&self, session_id: &SessionId) -> Result<Arc<SessionSlot>> {
        self.sessions
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| ClassroomError::SessionNotFound {
                session_id: session_id.clone(),
            })
    }

    fn tier_event(&self, tier: QualityTier) -> ConnectionEvent {
        if self.controller.is_degraded(tier) {
            ConnectionEvent::QualityDegraded
        } else {
            ConnectionEvent::QualityRecovered
        }
    }

    fn evict_locked(
        &self,
        inner: &mut SessionInner,
        key: &ConnectionKey,
        reason: LeaveReason,
        now: Instant,
    ) -> Result<()> {
        if !inner.session.remove_participant(&key.participant_id) {
            return Err(not_a_member(key));
        }

        // Connection record before quality window, so a concurrent report
        // cannot recreate the window after removal
        if let Some((_, mut connection)) = self.connections.remove(key) {
            if let Err(e) = connection.apply(leave_event(reason), now) {
                tracing::debug!("Connection {} removed from state {}: {}", key, connection.state, e);
            }
        }
        self.memberships
            .remove_if(&key.participant_id, |_, session| *session == key.session_id);
        self.quality.remove(key);

        let events = inner.floor.remove(&key.participant_id, now);
        self.publish_floor_events(&key.session_id, &events);

        let left = ServerMessage::Left {
            participant_id: key.participant_id.clone(),
            reason,
        };
        if reason == LeaveReason::Requested {
            self.hub.send_server(key, left.clone());
        }
        self.hub.detach(key);
        self.notify_peers(&inner.session, &key.participant_id, left);

        tracing::info!(
            "Participant {} left session {} ({:?})",
            key.participant_id,
            key.session_id,
            reason
        );
        Ok(())
    }

    fn shutdown_locked(&self, slot: &SessionSlot, inner: &mut SessionInner, reason: &str, now: Instant) {
        let session_id = inner.session.id.clone();
        inner.session.stop(now);
        slot.live.store(false, Ordering::Release);

        for participant_id in std::mem::take(&mut inner.session.participants) {
            let key = ConnectionKey::new(session_id.clone(), participant_id.clone());
            self.hub.send_server(
                &key,
                ServerMessage::SessionStopped {
                    reason: reason.to_string(),
                },
            );
            self.hub.detach(&key);
            self.connections.remove(&key);
            self.memberships
                .remove_if(&participant_id, |_, session| *session == session_id);
        }
        // Members whose connection record went missing still need cleaning up
        self.connections.retain(|key, _| key.session_id != session_id);
        self.quality.remove_session(&session_id);
        inner.floor.reset();
        self.owners
            .remove_if(&inner.session.teacher_id, |_, session| *session == session_id);

        tracing::info!("Session {} stopped: {}", session_id, reason);
    }

    fn publish_floor_events(&self, session_id: &SessionId, events: &[FloorEvent]) {
        for event in events {
            match event {
                FloorEvent::Granted { participant_id } => {
                    let key = ConnectionKey::new(session_id.clone(), participant_id.clone());
                    if let Some(mut connection) = self.connections.get_mut(&key) {
                        connection.has_floor = true;
                    }
                    tracing::info!("Floor granted to {} in session {}", participant_id, session_id);
                    self.hub.send_server(
                        &key,
                        ServerMessage::FloorGrant {
                            participant_id: participant_id.clone(),
                        },
                    );
                }
                FloorEvent::Revoked {
                    participant_id,
                    reason,
                } => {
                    let key = ConnectionKey::new(session_id.clone(), participant_id.clone());
                    if let Some(mut connection) = self.connections.get_mut(&key) {
                        connection.has_floor = false;
                    }
                    tracing::info!(
                        "Floor revoked from {} in session {} ({:?})",
                        participant_id,
                        session_id,
                        reason
                    );
                    self.hub.send_server(
                        &key,
                        ServerMessage::FloorRevoke {
                            participant_id: participant_id.clone(),
                            reason: *reason,
                        },
                    );
                }
                FloorEvent::Queued {
                    participant_id,
                    position,
                } => {
                    tracing::debug!(
                        "Floor request from {} queued at position {}",
                        participant_id,
                        position
                    );
                }
                FloorEvent::Withdrawn { participant_id } => {
                    tracing::debug!("Floor request from {} withdrawn", participant_id);
                }
            }
        }
    }

    fn notify_peers(&self, session: &Session, except: &ParticipantId, message: ServerMessage) {
        for peer in session.participants.iter().filter(|p| *p != except) {
            let key = ConnectionKey::new(session.id.clone(), peer.clone());
            self.hub.send_server(&key, message.clone());
        }
    }
}

fn leave_event(reason: LeaveReason) -> ConnectionEvent {
    match reason {
        LeaveReason::TimedOut => ConnectionEvent::GraceExpired,
        LeaveReason::Requested | LeaveReason::Disconnected => ConnectionEvent::LeaveRequested,
    }
}

fn not_a_member(key: &ConnectionKey) -> ClassroomError {
    ClassroomError::ParticipantNotFound {
        session_id: key.session_id.clone(),
        participant_id: key.participant_id.clone(),
    }
}
