//! Problem handle: the immutable shape and mode of one recurrent problem.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    activation::RecurrentActivation,
    device::Device,
    error::{RecurrentError, Result},
    precision::Precision,
};

/// Order in which the recurrence walks the time axis.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum RecurrentDirection {
    /// Step `s` processes timestep `s`.
    #[default]
    Forward,
    /// Step `s` processes timestep `timesteps - 1 - s`.
    Reverse,
}

impl RecurrentDirection {
    pub(crate) const fn code(self) -> u32 {
        match self {
            Self::Forward => 1,
            Self::Reverse => 2,
        }
    }
}

/// Shape and execution mode shared by the forward, backward-deltas and
/// backward-gradients calls of one problem.
///
/// Built once per shape and reused across calls; there is no mutation after
/// construction.
#[derive(Clone, Debug)]
pub struct RecurrentOpsHandle {
    layer_size: usize,
    mini_batch_size: usize,
    timesteps: usize,
    direction: RecurrentDirection,
    use_persistent: bool,
    activation: RecurrentActivation,
    precision: Precision,
    units: usize,
    device: Arc<Device>,
}

impl RecurrentOpsHandle {
    /// Single precision handle on the default device using all of its units.
    pub fn new(
        layer_size: usize,
        mini_batch_size: usize,
        timesteps: usize,
        activation: RecurrentActivation,
        direction: RecurrentDirection,
        use_persistent: bool,
    ) -> Result<Self> {
        Self::builder(layer_size, mini_batch_size, timesteps)
            .activation(activation)
            .direction(direction)
            .persistent(use_persistent)
            .build()
    }

    pub fn builder(
        layer_size: usize,
        mini_batch_size: usize,
        timesteps: usize,
    ) -> RecurrentOpsHandleBuilder {
        RecurrentOpsHandleBuilder {
            layer_size,
            mini_batch_size,
            timesteps,
            direction: RecurrentDirection::default(),
            use_persistent: true,
            activation: RecurrentActivation::default(),
            precision: Precision::default(),
            units: None,
            device: None,
        }
    }

    pub fn layer_size(&self) -> usize {
        self.layer_size
    }

    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn direction(&self) -> RecurrentDirection {
        self.direction
    }

    pub fn use_persistent(&self) -> bool {
        self.use_persistent
    }

    pub fn activation(&self) -> RecurrentActivation {
        self.activation
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Units requested for the grid. The launch uses at most one unit per layer row.
    pub fn units(&self) -> usize {
        self.units
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Timestep processed at recurrence step `step`.
    #[inline]
    pub fn time_index(&self, step: usize) -> usize {
        debug_assert!(step < self.timesteps);
        match self.direction {
            RecurrentDirection::Forward => step,
            RecurrentDirection::Reverse => self.timesteps - 1 - step,
        }
    }

    pub fn activations_shape(&self) -> [usize; 3] {
        [self.layer_size, self.mini_batch_size, self.timesteps]
    }

    pub fn weights_shape(&self) -> [usize; 2] {
        [self.layer_size, self.layer_size]
    }

    /// Multiply-add flops of one pass, `2 · L² · B · T`.
    pub fn flop_count(&self) -> f64 {
        2.0 * (self.layer_size as f64).powi(2) * self.mini_batch_size as f64 * self.timesteps as f64
    }
}

/// Builder for [`RecurrentOpsHandle`].
#[derive(Clone, Debug)]
#[must_use]
pub struct RecurrentOpsHandleBuilder {
    layer_size: usize,
    mini_batch_size: usize,
    timesteps: usize,
    direction: RecurrentDirection,
    use_persistent: bool,
    activation: RecurrentActivation,
    precision: Precision,
    units: Option<usize>,
    device: Option<Arc<Device>>,
}

impl RecurrentOpsHandleBuilder {
    pub fn activation(mut self, activation: RecurrentActivation) -> Self {
        self.activation = activation;
        self
    }

    pub fn direction(mut self, direction: RecurrentDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn persistent(mut self, use_persistent: bool) -> Self {
        self.use_persistent = use_persistent;
        self
    }

    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Restrict the grid to `units` units, leaving the rest of the device for
    /// other operations.
    pub fn units(mut self, units: usize) -> Self {
        self.units = Some(units);
        self
    }

    pub fn device(mut self, device: Arc<Device>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn build(self) -> Result<RecurrentOpsHandle> {
        for (name, value) in [
            ("layer_size", self.layer_size),
            ("mini_batch_size", self.mini_batch_size),
            ("timesteps", self.timesteps),
        ] {
            if value == 0 {
                return Err(RecurrentError::Configuration(format!("{name} must be > 0")));
            }
        }

        let device = self.device.unwrap_or_else(Device::default_device);
        let units = self.units.unwrap_or_else(|| device.units());
        if units == 0 {
            return Err(RecurrentError::Configuration("units must be > 0".into()));
        }
        if units > device.units() {
            return Err(RecurrentError::Configuration(format!(
                "requested {units} units but the device has {}",
                device.units()
            )));
        }

        if self.use_persistent {
            let max = device.max_layer_size_for_units(self.precision, units);
            if self.layer_size > max {
                return Err(RecurrentError::Configuration(format!(
                    "layer size {} exceeds the persistent maximum of {max} for {} precision on {units} units",
                    self.layer_size, self.precision
                )));
            }
        }

        Ok(RecurrentOpsHandle {
            layer_size: self.layer_size,
            mini_batch_size: self.mini_batch_size,
            timesteps: self.timesteps,
            direction: self.direction,
            use_persistent: self.use_persistent,
            activation: self.activation,
            precision: self.precision,
            units,
            device,
        })
    }
}
