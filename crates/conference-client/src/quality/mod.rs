//! Adaptive quality control.
//!
//! - [`backoff`] - pure multi-stage backoff state machine
//! - [`controller`] - actor that drives it and publishes the limit

pub mod backoff;
pub mod controller;

pub use backoff::{ArmedTimer, BackoffConfig, DowngradeOutcome, QualityBackoff, TimerKind};
pub use controller::{QualityBackoffController, QualityBackoffHandle};
