//! Floor control: who may speak
//!
//! Teachers always get the floor and preempt any student holding it. Students
//! are served first-come-first-served, one at a time, and only while no teacher
//! is speaking. Any floor, teacher or student, expires after the configured
//! maximum hold.

use classcast_core::{ParticipantId, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Why the floor was withdrawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloorRevokeReason {
    /// The holder gave it up
    Released,
    /// A teacher took the floor
    Preempted,
    /// Maximum hold time elapsed
    Expired,
    /// The holder left the session
    Disconnected,
}

/// Change produced by a floor operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloorEvent {
    /// Participant may now speak
    Granted {
        /// New speaker
        participant_id: ParticipantId,
    },
    /// Participant may no longer speak
    Revoked {
        /// Former speaker
        participant_id: ParticipantId,
        /// Why
        reason: FloorRevokeReason,
    },
    /// Request queued behind the current speaker
    Queued {
        /// Waiting participant
        participant_id: ParticipantId,
        /// 1-based position in the queue
        position: usize,
    },
    /// Pending request removed from the queue
    Withdrawn {
        /// Participant that no longer waits
        participant_id: ParticipantId,
    },
}

#[derive(Debug, Clone)]
struct StudentHolder {
    participant_id: ParticipantId,
    granted_at: Instant,
}

/// Floor arbitration for one session
#[derive(Debug, Clone)]
pub struct FloorController {
    holder: Option<StudentHolder>,
    teachers: BTreeMap<ParticipantId, Instant>,
    queue: VecDeque<ParticipantId>,
    max_hold: Duration,
}

impl FloorController {
    /// Create an idle floor
    pub fn new(max_hold: Duration) -> Self {
        Self {
            holder: None,
            teachers: BTreeMap::new(),
            queue: VecDeque::new(),
            max_hold,
        }
    }

    /// Handle a floor request. Repeated requests are no-ops.
    pub fn request(&mut self, participant_id: &ParticipantId, role: Role, now: Instant) -> Vec<FloorEvent> {
        let mut events = Vec::new();

        if role.is_teacher() {
            if self.teachers.contains_key(participant_id) {
                return events;
            }
            self.teachers.insert(participant_id.clone(), now);
            if let Some(student) = self.holder.take() {
                events.push(FloorEvent::Revoked {
                    participant_id: student.participant_id,
                    reason: FloorRevokeReason::Preempted,
                });
            }
            events.push(FloorEvent::Granted {
                participant_id: participant_id.clone(),
            });
            return events;
        }

        if self.is_holder(participant_id) || self.queue.contains(participant_id) {
            return events;
        }

        if self.holder.is_none() && self.teachers.is_empty() {
            self.grant(participant_id.clone(), now, &mut events);
        } else {
            self.queue.push_back(participant_id.clone());
            events.push(FloorEvent::Queued {
                participant_id: participant_id.clone(),
                position: self.queue.len(),
            });
        }
        events
    }

    /// Participant gives up the floor or withdraws its pending request
    pub fn release(&mut self, participant_id: &ParticipantId, now: Instant) -> Vec<FloorEvent> {
        self.withdraw(participant_id, FloorRevokeReason::Released, now)
    }

    /// Participant left the session
    pub fn remove(&mut self, participant_id: &ParticipantId, now: Instant) -> Vec<FloorEvent> {
        self.withdraw(participant_id, FloorRevokeReason::Disconnected, now)
    }

    /// Revoke every floor held longer than the maximum hold time
    pub fn expire(&mut self, now: Instant) -> Vec<FloorEvent> {
        let mut events = Vec::new();
        let max_hold = self.max_hold;
        let held_too_long = |granted_at: Instant| now.saturating_duration_since(granted_at) >= max_hold;

        let expired_teachers: Vec<ParticipantId> = self
            .teachers
            .iter()
            .filter(|(_, granted_at)| held_too_long(**granted_at))
            .map(|(id, _)| id.clone())
            .collect();
        for teacher in expired_teachers {
            self.teachers.remove(&teacher);
            events.push(FloorEvent::Revoked {
                participant_id: teacher,
                reason: FloorRevokeReason::Expired,
            });
        }

        if self.holder.as_ref().is_some_and(|h| held_too_long(h.granted_at)) {
            if let Some(student) = self.holder.take() {
                events.push(FloorEvent::Revoked {
                    participant_id: student.participant_id,
                    reason: FloorRevokeReason::Expired,
                });
            }
        }

        if !events.is_empty() {
            self.advance(now, &mut events);
        }
        events
    }

    /// Drop every holder and queued request
    pub fn reset(&mut self) {
        self.holder = None;
        self.teachers.clear();
        self.queue.clear();
    }

    /// Student currently holding the floor
    pub fn holder(&self) -> Option<&ParticipantId> {
        self.holder.as_ref().map(|h| &h.participant_id)
    }

    /// Teachers currently speaking
    pub fn speaking_teachers(&self) -> impl Iterator<Item = &ParticipantId> {
        self.teachers.keys()
    }

    /// Pending student requests, front first
    pub fn queue(&self) -> impl Iterator<Item = &ParticipantId> {
        self.queue.iter()
    }

    /// Whether the participant may currently speak
    pub fn has_floor(&self, participant_id: &ParticipantId) -> bool {
        self.teachers.contains_key(participant_id) || self.is_holder(participant_id)
    }

    fn is_holder(&self, participant_id: &ParticipantId) -> bool {
        self.holder
            .as_ref()
            .is_some_and(|h| &h.participant_id == participant_id)
    }

    fn withdraw(
        &mut self,
        participant_id: &ParticipantId,
        reason: FloorRevokeReason,
        now: Instant,
    ) -> Vec<FloorEvent> {
        let mut events = Vec::new();

        if self.teachers.remove(participant_id).is_some() {
            events.push(FloorEvent::Revoked {
                participant_id: participant_id.clone(),
                reason,
            });
        } else if self.is_holder(participant_id) {
            self.holder = None;
            events.push(FloorEvent::Revoked {
                participant_id: participant_id.clone(),
                reason,
            });
        } else if let Some(pos) = self.queue.iter().position(|p| p == participant_id) {
            self.queue.remove(pos);
            events.push(FloorEvent::Withdrawn {
                participant_id: participant_id.clone(),
            });
            return events;
        } else {
            return events;
        }

        self.advance(now, &mut events);
        events
    }

    fn advance(&mut self, now: Instant, events: &mut Vec<FloorEvent>) {
        if self.holder.is_some() || !self.teachers.is_empty() {
            return;
        }
        if let Some(next) = self.queue.pop_front() {
            self.grant(next, now, events);
        }
    }

    fn grant(&mut self, participant_id: ParticipantId, now: Instant, events: &mut Vec<FloorEvent>) {
        events.push(FloorEvent::Granted {
            participant_id: participant_id.clone(),
        });
        self.holder = Some(StudentHolder {
            participant_id,
            granted_at: now,
        });
    }
}
