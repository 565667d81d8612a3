//! # ClassCast Diagnostics
//!
//! Network quality tooling for live sessions.
//! Provides rolling quality windows, adaptive tier classification and
//! structured logging setup.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod logging;
pub mod quality_controller;
pub mod quality_store;

// Re-export main types
pub use logging::init_logging;
pub use quality_controller::{AdaptiveQualityController, MediaPolicy, TierChange, TierDirection};
pub use quality_store::{QualitySampleStore, QualitySummary, QualityWindow};
