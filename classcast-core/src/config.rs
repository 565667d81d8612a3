//! Configuration types and defaults
//!
//! Every numeric policy value of the live-session core is configuration:
//! capacity, timeouts, quality thresholds and hysteresis. Defaults are tuned
//! for classrooms on constrained mobile links and can be overridden from a
//! TOML file and `CLASSCAST__`-prefixed environment variables.

use crate::error::{ClassroomError, Result};
use crate::types::QualityTier;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides, e.g. `CLASSCAST__TIMEOUTS__LIVENESS_MS`
pub const ENV_PREFIX: &str = "CLASSCAST";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassroomConfig {
    /// Session capacity and delivery settings
    pub session: SessionConfig,
    /// Liveness, negotiation and floor timeouts
    pub timeouts: TimeoutConfig,
    /// Quality classification policy
    pub quality: QualityConfig,
    /// Transport listener
    pub server: ServerConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl ClassroomConfig {
    /// Load configuration: defaults, then an optional TOML file, then environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(Self::defaults_source()?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        Self::finish(builder)
    }

    /// Load configuration from TOML text layered over the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(Self::defaults_source()?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::finish(builder)
    }

    fn defaults_source() -> Result<config::Config> {
        config::Config::try_from(&ClassroomConfig::default()).map_err(config_error)
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let loaded: ClassroomConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;
        loaded.validate()?;
        tracing::debug!(
            max_participants = loaded.session.max_participants,
            liveness_ms = loaded.timeouts.liveness_ms,
            upgrade_samples = loaded.quality.upgrade_samples,
            "Configuration loaded"
        );
        Ok(loaded)
    }

    /// Reject values that would make the policy meaningless
    pub fn validate(&self) -> Result<()> {
        if self.session.max_participants == 0 {
            return Err(invalid("session.max_participants must be at least 1"));
        }
        if self.session.outbound_buffer == 0 {
            return Err(invalid("session.outbound_buffer must be at least 1"));
        }
        for (name, value) in [
            ("timeouts.liveness_ms", self.timeouts.liveness_ms),
            ("timeouts.grace_ms", self.timeouts.grace_ms),
            ("timeouts.negotiation_ms", self.timeouts.negotiation_ms),
            ("timeouts.floor_max_hold_ms", self.timeouts.floor_max_hold_ms),
            ("timeouts.sweep_interval_ms", self.timeouts.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(invalid(&format!("{} must be greater than zero", name)));
            }
        }
        if self.timeouts.negotiation_ms > self.timeouts.liveness_ms {
            return Err(invalid(
                "timeouts.negotiation_ms must not exceed timeouts.liveness_ms",
            ));
        }
        if self.quality.upgrade_samples == 0 {
            return Err(invalid("quality.upgrade_samples must be at least 1"));
        }
        if self.quality.window_capacity < self.quality.upgrade_samples {
            return Err(invalid(
                "quality.window_capacity must hold at least upgrade_samples samples",
            ));
        }
        if self.quality.window_secs == 0 {
            return Err(invalid("quality.window_secs must be greater than zero"));
        }
        self.quality.thresholds.validate()
    }
}

fn invalid(reason: &str) -> ClassroomError {
    ClassroomError::Configuration {
        reason: reason.to_string(),
    }
}

fn config_error(e: config::ConfigError) -> ClassroomError {
    ClassroomError::Configuration {
        reason: e.to_string(),
    }
}

/// Session capacity and delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum participants per session, teacher included
    pub max_participants: usize,
    /// Per-connection outbound queue length before messages are dropped
    pub outbound_buffer: usize,
    /// Send a `notice` back to the sender when a relayed message is dropped
    pub report_dropped_deliveries: bool,
    /// How long a stopped session stays archived before it is purged
    pub stopped_retention_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_participants: 60,
            outbound_buffer: 256,
            report_dropped_deliveries: false,
            stopped_retention_secs: 300,
        }
    }
}

impl SessionConfig {
    /// Retention period for stopped sessions
    pub fn stopped_retention(&self) -> Duration {
        Duration::from_secs(self.stopped_retention_secs)
    }
}

/// Liveness, negotiation and floor timeouts (milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Silence after which a connected participant is marked reconnecting
    pub liveness_ms: u64,
    /// Time a reconnecting participant has to renegotiate before eviction
    pub grace_ms: u64,
    /// Time allowed for an offer/answer exchange to complete
    pub negotiation_ms: u64,
    /// Longest a student may hold the floor
    pub floor_max_hold_ms: u64,
    /// Period of the supervisor sweep
    pub sweep_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            liveness_ms: 15_000,
            grace_ms: 30_000,
            negotiation_ms: 10_000,
            floor_max_hold_ms: 120_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl TimeoutConfig {
    /// Liveness timeout
    pub fn liveness(&self) -> Duration {
        Duration::from_millis(self.liveness_ms)
    }

    /// Reconnect grace window
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Negotiation timeout
    pub fn negotiation(&self) -> Duration {
        Duration::from_millis(self.negotiation_ms)
    }

    /// Maximum floor hold
    pub fn floor_max_hold(&self) -> Duration {
        Duration::from_millis(self.floor_max_hold_ms)
    }

    /// Supervisor sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Quality classification policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Maximum samples kept per participant
    pub window_capacity: usize,
    /// Maximum sample age in seconds
    pub window_secs: u64,
    /// Consecutive better samples required before upgrading a tier
    pub upgrade_samples: usize,
    /// Tier assigned before any sample arrives
    pub initial_tier: QualityTier,
    /// Lowest tier still considered `connected`; anything below is `degraded`
    pub connected_floor: QualityTier,
    /// Per-tier admission thresholds
    pub thresholds: QualityThresholds,
    /// Bitrate ceiling announced with each tier
    pub bitrates: TierBitrates,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            window_capacity: 20,
            window_secs: 30,
            upgrade_samples: 3,
            initial_tier: QualityTier::Medium,
            connected_floor: QualityTier::Medium,
            thresholds: QualityThresholds::default(),
            bitrates: TierBitrates::default(),
        }
    }
}

impl QualityConfig {
    /// Maximum sample age
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Limits a sample must satisfy to qualify for a tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThreshold {
    /// Maximum round-trip latency in milliseconds
    pub max_rtt_ms: u32,
    /// Minimum available bandwidth in kbps
    pub min_bandwidth_kbps: u32,
    /// Maximum packet loss ratio
    pub max_packet_loss: f32,
}

impl TierThreshold {
    /// Whether the measurement satisfies this threshold
    pub fn admits(&self, rtt_ms: u32, bandwidth_kbps: u32, packet_loss: f32) -> bool {
        rtt_ms <= self.max_rtt_ms
            && bandwidth_kbps >= self.min_bandwidth_kbps
            && packet_loss <= self.max_packet_loss
    }
}

/// Threshold table; samples failing `low` classify as audio-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Requirements for the high tier
    pub high: TierThreshold,
    /// Requirements for the medium tier
    pub medium: TierThreshold,
    /// Requirements for the low tier
    pub low: TierThreshold,
}

impl QualityThresholds {
    /// Thresholds for cellular and rural links (default)
    pub fn low_bandwidth() -> Self {
        Self {
            high: TierThreshold {
                max_rtt_ms: 150,
                min_bandwidth_kbps: 1_500,
                max_packet_loss: 0.02,
            },
            medium: TierThreshold {
                max_rtt_ms: 300,
                min_bandwidth_kbps: 500,
                max_packet_loss: 0.05,
            },
            low: TierThreshold {
                max_rtt_ms: 600,
                min_bandwidth_kbps: 150,
                max_packet_loss: 0.10,
            },
        }
    }

    /// Thresholds for wired or campus networks
    pub fn broadband() -> Self {
        Self {
            high: TierThreshold {
                max_rtt_ms: 100,
                min_bandwidth_kbps: 3_000,
                max_packet_loss: 0.01,
            },
            medium: TierThreshold {
                max_rtt_ms: 200,
                min_bandwidth_kbps: 1_200,
                max_packet_loss: 0.03,
            },
            low: TierThreshold {
                max_rtt_ms: 400,
                min_bandwidth_kbps: 400,
                max_packet_loss: 0.08,
            },
        }
    }

    /// Threshold for a video tier; `None` for audio-only, which admits everything
    pub fn for_tier(&self, tier: QualityTier) -> Option<&TierThreshold> {
        match tier {
            QualityTier::High => Some(&self.high),
            QualityTier::Medium => Some(&self.medium),
            QualityTier::Low => Some(&self.low),
            QualityTier::AudioOnly => None,
        }
    }

    /// Each tier must be at least as strict as the one below it
    pub fn validate(&self) -> Result<()> {
        let tiers = [("high", &self.high), ("medium", &self.medium), ("low", &self.low)];
        for (name, t) in tiers {
            if !(0.0..=1.0).contains(&t.max_packet_loss) {
                return Err(invalid(&format!(
                    "quality.thresholds.{}.max_packet_loss must be within 0.0..=1.0",
                    name
                )));
            }
        }
        for pair in tiers.windows(2) {
            let (upper_name, upper) = pair[0];
            let (lower_name, lower) = pair[1];
            if upper.max_rtt_ms > lower.max_rtt_ms
                || upper.min_bandwidth_kbps < lower.min_bandwidth_kbps
                || upper.max_packet_loss > lower.max_packet_loss
            {
                return Err(invalid(&format!(
                    "quality.thresholds.{} must be at least as strict as {}",
                    upper_name, lower_name
                )));
            }
        }
        Ok(())
    }
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self::low_bandwidth()
    }
}

/// Outgoing bitrate ceilings announced to clients, per tier (kbps)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBitrates {
    /// High tier ceiling
    pub high_kbps: u32,
    /// Medium tier ceiling
    pub medium_kbps: u32,
    /// Low tier ceiling
    pub low_kbps: u32,
    /// Audio-only ceiling
    pub audio_only_kbps: u32,
}

impl TierBitrates {
    /// Ceiling for the given tier
    pub fn for_tier(&self, tier: QualityTier) -> u32 {
        match tier {
            QualityTier::High => self.high_kbps,
            QualityTier::Medium => self.medium_kbps,
            QualityTier::Low => self.low_kbps,
            QualityTier::AudioOnly => self.audio_only_kbps,
        }
    }
}

impl Default for TierBitrates {
    fn default() -> Self {
        Self {
            high_kbps: 1_200,
            medium_kbps: 500,
            low_kbps: 150,
            audio_only_kbps: 48,
        }
    }
}

/// Transport listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8765".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse the bind address
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        self.bind_addr.parse().map_err(|_| ClassroomError::Configuration {
            reason: format!("server.bind_addr is not a socket address: {}", self.bind_addr),
        })
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence when set
    pub filter: String,
    /// Colourise terminal output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClassroomConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.max_participants, 60);
        assert_eq!(config.timeouts.liveness(), Duration::from_secs(15));
        assert_eq!(config.quality.upgrade_samples, 3);
        assert_eq!(config.quality.bitrates.for_tier(QualityTier::AudioOnly), 48);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(QualityThresholds::low_bandwidth().validate().is_ok());
        assert!(QualityThresholds::broadband().validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = ClassroomConfig::from_toml_str(
            r#"
            [session]
            max_participants = 4

            [timeouts]
            liveness_ms = 2000
            negotiation_ms = 1000

            [quality]
            initial_tier = "high"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.max_participants, 4);
        assert_eq!(config.timeouts.liveness_ms, 2000);
        assert_eq!(config.timeouts.grace_ms, 30_000);
        assert_eq!(config.quality.initial_tier, QualityTier::High);
    }

    #[test]
    fn test_rejects_window_smaller_than_hysteresis() {
        let mut config = ClassroomConfig::default();
        config.quality.window_capacity = 2;
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut thresholds = QualityThresholds::low_bandwidth();
        thresholds.high.min_bandwidth_kbps = 100;
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_capacity_from_toml() {
        let result = ClassroomConfig::from_toml_str("[session]\nmax_participants = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_threshold_admission() {
        let t = QualityThresholds::low_bandwidth();
        assert!(t.high.admits(100, 2_000, 0.01));
        assert!(!t.high.admits(100, 2_000, 0.03));
        assert!(t.for_tier(QualityTier::AudioOnly).is_none());
    }

    #[test]
    fn test_bind_addr_parsing() {
        let server = ServerConfig::default();
        assert_eq!(server.socket_addr().unwrap().port(), 8765);
        let bad = ServerConfig {
            bind_addr: "not-an-addr".to_string(),
        };
        assert!(bad.socket_addr().is_err());
    }
}
