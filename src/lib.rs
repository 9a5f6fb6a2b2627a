#![warn(clippy::pedantic)]
#![allow(
    clippy::too_many_arguments,
    clippy::similar_names,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::many_single_char_names,
    clippy::module_name_repetitions
)]

//! Persistent recurrent kernels.
//!
//! Forward propagation, backward propagation of deltas and backward
//! propagation of weight gradients for a single-layer recurrence
//!
//! ```text
//! h[t] = f(W · h[t-1] + x[t])
//! ```
//!
//! Each call runs as one long-lived grid of cooperating units. Every unit
//! keeps its stripe of `W` resident for the whole call and the units advance
//! through the timesteps in lock step, separated by a device-wide barrier.
//! Handles with persistence disabled issue one dispatch per timestep instead,
//! which produces the same results.

pub mod activation;
pub mod device;
pub mod error;
pub mod handle;
pub mod ops;
pub mod precision;
pub mod schedule;
pub mod scratch;
pub mod sync;
pub mod view;

pub use activation::RecurrentActivation;
pub use device::{Device, DeviceConfig, maximum_layer_size, synchronize};
pub use error::{ConfigError, RecurrentError, Result};
pub use handle::{RecurrentDirection, RecurrentOpsHandle, RecurrentOpsHandleBuilder};
pub use ops::{back_prop_deltas_recurrent, back_prop_gradients_recurrent, forward_prop_recurrent};
pub use precision::{Element, Precision};
pub use scratch::{
    OperationKind, Scratch, get_back_prop_deltas_scratch, get_back_prop_gradients_scratch,
    get_forward_prop_scratch, scratch_size_for,
};
pub use view::{Layout, ScratchView, TensorView, TensorViewMut};

pub mod prelude {
    pub use half::{bf16, f16};

    pub use crate::{
        Device, DeviceConfig, Element, OperationKind, Precision, RecurrentActivation,
        RecurrentDirection, RecurrentError, RecurrentOpsHandle, Scratch, ScratchView, TensorView,
        TensorViewMut, back_prop_deltas_recurrent, back_prop_gradients_recurrent,
        forward_prop_recurrent,
    };
}
