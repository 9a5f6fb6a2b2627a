//! Error taxonomy for the recurrent engine.
//!
//! Every error is detected synchronously at (or shortly after) call issuance
//! and returned to the caller. Nothing is retried internally.

use std::time::Duration;

use crate::precision::Precision;

/// Errors returned by handle construction and the recurrent entry points.
#[derive(Debug, thiserror::Error)]
pub enum RecurrentError {
    /// Invalid or unsupported problem handle, including persistence requests
    /// beyond the device's residency capacity.
    #[error("invalid recurrent configuration: {0}")]
    Configuration(String),
    #[error("{name} shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("{name} precision mismatch: expected {expected}, found {found}")]
    PrecisionMismatch {
        name: &'static str,
        expected: Precision,
        found: Precision,
    },
    #[error("invalid tensor view: {0}")]
    InvalidView(String),
    #[error("scratch buffer too small: need {required} bytes, have {available}")]
    ScratchTooSmall { required: usize, available: usize },
    /// Backward call with scratch that no matching forward call populated.
    #[error("stale scratch: {0}")]
    StaleScratch(String),
    #[error("launch capacity exceeded: requested {requested} units, {available} of {total} free")]
    LaunchCapacity {
        requested: usize,
        available: usize,
        total: usize,
    },
    /// A unit did not reach an expected barrier epoch in time. Fatal for the call.
    #[error("barrier timed out at epoch {epoch}: {arrived}/{expected} arrivals after {waited:?}")]
    DeadlockTimeout {
        epoch: usize,
        arrived: usize,
        expected: usize,
        waited: Duration,
    },
    #[error("device configuration: {0}")]
    DeviceConfig(#[from] ConfigError),
}

/// Errors loading a [`DeviceConfig`](crate::device::DeviceConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read device config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse device config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid device config: {0}")]
    Invalid(String),
}

pub type Result<T, E = RecurrentError> = std::result::Result<T, E>;
