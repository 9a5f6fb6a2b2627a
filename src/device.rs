//! The execution substrate: a fixed set of cooperating units.
//!
//! A [`Device`] owns the unit budget. Every launch claims a [`UnitLease`]
//! for its grid and returns it on drop, so independent operations can share
//! a device only as long as their grids fit side by side.
//!
//! Each unit can keep a bounded number of bytes resident (its weight tile)
//! for the whole call; that bound caps the layer size usable with
//! persistence.

use std::{
    path::Path,
    sync::{Arc, Condvar, LazyLock, Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{ConfigError, RecurrentError, Result},
    precision::Precision,
    sync::SpinPolicy,
};

/// Names a JSON file holding a [`DeviceConfig`].
pub const ENV_DEVICE_CONFIG: &str = "PRNN_DEVICE_CONFIG";
pub const ENV_UNITS: &str = "PRNN_UNITS";
pub const ENV_UNIT_RESIDENCY_BYTES: &str = "PRNN_UNIT_RESIDENCY_BYTES";
pub const ENV_BARRIER_TIMEOUT_MS: &str = "PRNN_BARRIER_TIMEOUT_MS";

/// Device configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Number of cooperating execution units.
    pub units: usize,
    /// Bytes of weight tile one unit may keep resident.
    pub unit_residency_bytes: usize,
    /// How long a unit may wait at a barrier before the call fails.
    pub barrier_timeout_ms: u64,
    /// Busy-wait iterations before a waiting unit starts yielding.
    pub spin_iterations: u32,
    /// Yields before a waiting unit starts sleeping between polls.
    pub yield_iterations: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            units: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            unit_residency_bytes: 256 * 1024,
            barrier_timeout_ms: 10_000,
            spin_iterations: 1 << 10,
            yield_iterations: 64,
        }
    }
}

impl DeviceConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the file named by `PRNN_DEVICE_CONFIG`, then the
    /// individual `PRNN_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(ENV_DEVICE_CONFIG) {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        if let Some(units) = lookup(ENV_UNITS) {
            config.units = parse_var(ENV_UNITS, &units)?;
        }
        if let Some(bytes) = lookup(ENV_UNIT_RESIDENCY_BYTES) {
            config.unit_residency_bytes = parse_var(ENV_UNIT_RESIDENCY_BYTES, &bytes)?;
        }
        if let Some(ms) = lookup(ENV_BARRIER_TIMEOUT_MS) {
            config.barrier_timeout_ms = parse_var(ENV_BARRIER_TIMEOUT_MS, &ms)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.units == 0 {
            return Err(ConfigError::Invalid("units must be > 0".into()));
        }
        if self.unit_residency_bytes == 0 {
            return Err(ConfigError::Invalid("unit_residency_bytes must be > 0".into()));
        }
        if self.barrier_timeout_ms == 0 {
            return Err(ConfigError::Invalid("barrier_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn spin_policy(&self) -> SpinPolicy {
        SpinPolicy {
            spin_iterations: self.spin_iterations,
            yield_iterations: self.yield_iterations,
            timeout: self.barrier_timeout(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{key}={value:?}: {e}")))
}

/// A pool of cooperating execution units.
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    free_units: Mutex<usize>,
    idle: Condvar,
}

static DEFAULT_DEVICE: LazyLock<Arc<Device>> = LazyLock::new(|| {
    let config = DeviceConfig::from_env().unwrap_or_else(|e| {
        warn!("ignoring device configuration from environment: {e}");
        DeviceConfig::default()
    });
    debug!(
        units = config.units,
        unit_residency_bytes = config.unit_residency_bytes,
        "initialized default device"
    );
    Arc::new(Device::from_valid_config(config))
});

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self::from_valid_config(config)))
    }

    fn from_valid_config(config: DeviceConfig) -> Self {
        Self {
            free_units: Mutex::new(config.units),
            config,
            idle: Condvar::new(),
        }
    }

    /// The process-wide device, configured from the environment on first use.
    pub fn default_device() -> Arc<Self> {
        Arc::clone(&DEFAULT_DEVICE)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn units(&self) -> usize {
        self.config.units
    }

    pub fn free_units(&self) -> usize {
        *self.free_units.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Largest layer size whose weight tiles stay resident across all units.
    pub fn max_layer_size(&self, precision: Precision) -> usize {
        self.max_layer_size_for_units(precision, self.units())
    }

    /// Largest layer size whose weight tiles stay resident on a grid of
    /// `units` units (clamped to the device).
    pub fn max_layer_size_for_units(&self, precision: Precision, units: usize) -> usize {
        let units = units.clamp(1, self.units()) as u128;
        let capacity = self.config.unit_residency_bytes as u128;
        let width = precision.size_bytes() as u128;

        // Resident bytes of the largest tile; monotone in the layer size.
        let tile_bytes = |layer: u128| {
            let grid = units.min(layer.max(1));
            layer.div_ceil(grid) * layer * width
        };

        let (mut lo, mut hi) = (0u128, 1u128);
        while tile_bytes(hi) <= capacity {
            lo = hi;
            hi *= 2;
        }
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if tile_bytes(mid) <= capacity {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo as usize
    }

    /// Claim `units` execution units for one launch.
    pub fn try_claim(&self, units: usize) -> Result<UnitLease<'_>> {
        let mut free = self.free_units.lock().unwrap_or_else(PoisonError::into_inner);
        if units > *free {
            return Err(RecurrentError::LaunchCapacity {
                requested: units,
                available: *free,
                total: self.units(),
            });
        }
        *free -= units;
        Ok(UnitLease {
            device: self,
            units,
        })
    }

    /// Block until every outstanding lease on this device has been returned.
    pub fn synchronize(&self) {
        let mut free = self.free_units.lock().unwrap_or_else(PoisonError::into_inner);
        while *free < self.units() {
            free = self.idle.wait(free).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self, units: usize) {
        let mut free = self.free_units.lock().unwrap_or_else(PoisonError::into_inner);
        *free += units;
        self.idle.notify_all();
    }
}

/// Units claimed for one launch. Returned to the device on drop.
#[derive(Debug)]
pub struct UnitLease<'d> {
    device: &'d Device,
    units: usize,
}

impl UnitLease<'_> {
    pub fn units(&self) -> usize {
        self.units
    }
}

impl Drop for UnitLease<'_> {
    fn drop(&mut self) {
        self.device.release(self.units);
    }
}

/// Maximum persistent layer size on the default device.
pub fn maximum_layer_size(precision: Precision) -> usize {
    Device::default_device().max_layer_size(precision)
}

/// Wait for all in-flight operations on the default device.
pub fn synchronize() {
    Device::default_device().synchronize();
}
