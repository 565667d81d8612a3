//! Rolling network-quality windows per participant connection
//!
//! Each connection keeps a bounded window of its most recent quality reports.
//! A window is capped both by sample count and by sample age; the oldest
//! samples are evicted first. Windows are independent entries of a
//! concurrent map, so one participant's writer never blocks another's.

use classcast_core::{ConnectionKey, QualityConfig, QualitySample, SessionId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded window of quality samples for one connection
#[derive(Debug, Clone)]
pub struct QualityWindow {
    samples: VecDeque<(Instant, QualitySample)>,
    capacity: usize,
    max_age: Duration,
}

impl QualityWindow {
    /// Create an empty window
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            max_age,
        }
    }

    /// Append a sample observed at `now`, evicting by age and capacity
    pub fn push(&mut self, sample: QualitySample, now: Instant) {
        self.samples.push_back((now, sample));
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        self.prune(now);
    }

    /// Drop samples older than the window's maximum age
    pub fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.max_age {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Samples oldest-first
    pub fn samples(&self) -> impl Iterator<Item = &QualitySample> {
        self.samples.iter().map(|(_, s)| s)
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<&QualitySample> {
        self.samples.back().map(|(_, s)| s)
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window holds no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Averages over the window
    pub fn summary(&self) -> Option<QualitySummary> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as f64;
        let mean_rtt = self.samples().map(|s| f64::from(s.rtt_ms)).sum::<f64>() / n;
        let mean_bandwidth = self.samples().map(|s| f64::from(s.bandwidth_kbps)).sum::<f64>() / n;
        let mean_loss = self.samples().map(|s| f64::from(s.packet_loss)).sum::<f64>() / n;

        // Jitter approximated from RTT spread
        let variance = self
            .samples()
            .map(|s| {
                let diff = f64::from(s.rtt_ms) - mean_rtt;
                diff * diff
            })
            .sum::<f64>()
            / n;

        Some(QualitySummary {
            sample_count: self.samples.len(),
            mean_rtt_ms: mean_rtt,
            mean_bandwidth_kbps: mean_bandwidth,
            mean_packet_loss: mean_loss,
            rtt_jitter_ms: variance.sqrt(),
        })
    }
}

/// Aggregated view of a quality window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    /// Number of samples aggregated
    pub sample_count: usize,
    /// Mean round-trip time in milliseconds
    pub mean_rtt_ms: f64,
    /// Mean available bandwidth in kbps
    pub mean_bandwidth_kbps: f64,
    /// Mean packet loss ratio
    pub mean_packet_loss: f64,
    /// Standard deviation of the round-trip time
    pub rtt_jitter_ms: f64,
}

/// Quality sample store for every connection of every session
#[derive(Debug)]
pub struct QualitySampleStore {
    windows: DashMap<ConnectionKey, QualityWindow>,
    capacity: usize,
    max_age: Duration,
}

impl QualitySampleStore {
    /// Create a store with the given per-connection bounds
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            capacity,
            max_age,
        }
    }

    /// Create a store from the quality configuration
    pub fn from_config(config: &QualityConfig) -> Self {
        Self::new(config.window_capacity, config.window_duration())
    }

    /// Append a sample and return the connection's window, oldest first
    pub fn record(
        &self,
        key: &ConnectionKey,
        sample: QualitySample,
        now: Instant,
    ) -> Vec<QualitySample> {
        let mut entry = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| QualityWindow::new(self.capacity, self.max_age));
        entry.push(sample, now);
        entry.samples().cloned().collect()
    }

    /// Snapshot of a connection's window, oldest first
    pub fn window(&self, key: &ConnectionKey) -> Vec<QualitySample> {
        self.windows
            .get(key)
            .map(|w| w.samples().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent sample for a connection
    pub fn latest(&self, key: &ConnectionKey) -> Option<QualitySample> {
        self.windows.get(key).and_then(|w| w.latest().cloned())
    }

    /// Averages for a connection
    pub fn summary(&self, key: &ConnectionKey) -> Option<QualitySummary> {
        self.windows.get(key).and_then(|w| w.summary())
    }

    /// Forget a connection's samples
    pub fn remove(&self, key: &ConnectionKey) {
        self.windows.remove(key);
    }

    /// Forget every connection of a session
    pub fn remove_session(&self, session_id: &SessionId) {
        self.windows.retain(|key, _| &key.session_id != session_id);
    }

    /// Number of tracked connections
    pub fn connection_count(&self) -> usize {
        self.windows.len()
    }
}
