//! Adaptive quality classification with hysteresis
//!
//! ## Classification
//! A sample qualifies for the best tier whose threshold it satisfies
//! (RTT ceiling, bandwidth floor, loss ceiling). Samples failing the `low`
//! threshold classify as audio-only.
//!
//! ## Hysteresis
//! - Downgrade: immediate, on the latest sample alone.
//! - Upgrade: only when the last `upgrade_samples` samples all classify above
//!   the current tier; the new tier is the lowest tier among them.

use classcast_core::{QualityConfig, QualitySample, QualityThresholds, QualityTier, TierBitrates};
use serde::{Deserialize, Serialize};

/// Direction of a tier change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierDirection {
    /// Worse conditions, fewer media
    Downgrade,
    /// Sustained improvement
    Upgrade,
}

/// Tier change decided by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierChange {
    /// Previous tier
    pub from: QualityTier,
    /// New tier
    pub to: QualityTier,
    /// Whether this is an upgrade or a downgrade
    pub direction: TierDirection,
}

/// Media behaviour a client should adopt for a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPolicy {
    /// Tier the policy belongs to
    pub tier: QualityTier,
    /// Outgoing bitrate ceiling in kbps
    pub max_bitrate_kbps: u32,
    /// Whether video should be sent
    pub video_enabled: bool,
}

/// Turns quality windows into tier decisions
#[derive(Debug, Clone)]
pub struct AdaptiveQualityController {
    thresholds: QualityThresholds,
    bitrates: TierBitrates,
    upgrade_samples: usize,
    initial_tier: QualityTier,
    connected_floor: QualityTier,
}

impl AdaptiveQualityController {
    /// Build a controller from the quality configuration
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            bitrates: config.bitrates.clone(),
            upgrade_samples: config.upgrade_samples.max(1),
            initial_tier: config.initial_tier,
            connected_floor: config.connected_floor,
        }
    }

    /// Tier assigned to a connection before its first report
    pub fn initial_tier(&self) -> QualityTier {
        self.initial_tier
    }

    /// Classify a single sample
    pub fn classify(&self, sample: &QualitySample) -> QualityTier {
        QualityTier::ALL
            .into_iter()
            .find(|tier| match self.thresholds.for_tier(*tier) {
                Some(t) => t.admits(sample.rtt_ms, sample.bandwidth_kbps, sample.packet_loss),
                None => true,
            })
            .unwrap_or(QualityTier::AudioOnly)
    }

    /// Decide whether the window warrants leaving `current`.
    ///
    /// `window` is oldest-first and must end with the newest sample.
    pub fn evaluate(&self, current: QualityTier, window: &[QualitySample]) -> Option<TierChange> {
        let latest = window.last()?;
        let latest_tier = self.classify(latest);

        if latest_tier < current {
            return Some(TierChange {
                from: current,
                to: latest_tier,
                direction: TierDirection::Downgrade,
            });
        }

        if window.len() < self.upgrade_samples {
            return None;
        }

        let recent = &window[window.len() - self.upgrade_samples..];
        let sustained = recent
            .iter()
            .map(|s| self.classify(s))
            .try_fold(QualityTier::High, |lowest, tier| {
                (tier > current).then(|| lowest.min(tier))
            })?;

        Some(TierChange {
            from: current,
            to: sustained,
            direction: TierDirection::Upgrade,
        })
    }

    /// Whether a tier counts as degraded for the connection state machine
    pub fn is_degraded(&self, tier: QualityTier) -> bool {
        tier < self.connected_floor
    }

    /// Media policy to announce for a tier
    pub fn media_policy(&self, tier: QualityTier) -> MediaPolicy {
        MediaPolicy {
            tier,
            max_bitrate_kbps: self.bitrates.for_tier(tier),
            video_enabled: tier.video_enabled(),
        }
    }
}

impl Default for AdaptiveQualityController {
    fn default() -> Self {
        Self::new(&QualityConfig::default())
    }
}
