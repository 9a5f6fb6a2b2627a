//! Pointwise recurrent nonlinearities.
//!
//! A policy is a pure `forward`/`derivative` pair. The derivative takes the
//! pre-activation value, since that is what the forward pass caches.
//!
//! [`RecurrentActivation`] is the runtime tag stored in a handle; the
//! zero-sized [`ActivationFn`] types are what the step kernels are generic
//! over. [`with_activation!`](crate::with_activation) turns the former into the
//! latter once per call, so the per-timestep loop never branches on the tag.

use serde::{Deserialize, Serialize};

/// Compile-time activation policy.
pub trait ActivationFn: Copy + Default + Send + Sync + 'static {
    const KIND: RecurrentActivation;

    fn forward(x: f32) -> f32;

    /// Derivative of [`forward`](Self::forward) at pre-activation `x`.
    fn derivative(x: f32) -> f32;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl ActivationFn for Identity {
    const KIND: RecurrentActivation = RecurrentActivation::Identity;

    #[inline(always)]
    fn forward(x: f32) -> f32 {
        x
    }

    #[inline(always)]
    fn derivative(_x: f32) -> f32 {
        1.0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RectifiedLinear;

impl ActivationFn for RectifiedLinear {
    const KIND: RecurrentActivation = RecurrentActivation::RectifiedLinear;

    #[inline(always)]
    fn forward(x: f32) -> f32 {
        x.max(0.0)
    }

    // Zero at the kink.
    #[inline(always)]
    fn derivative(x: f32) -> f32 {
        if x > 0.0 { 1.0 } else { 0.0 }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HyperbolicTangent;

impl ActivationFn for HyperbolicTangent {
    const KIND: RecurrentActivation = RecurrentActivation::Tanh;

    #[inline(always)]
    fn forward(x: f32) -> f32 {
        x.tanh()
    }

    #[inline(always)]
    fn derivative(x: f32) -> f32 {
        let y = x.tanh();
        1.0 - y * y
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Sigmoid;

impl ActivationFn for Sigmoid {
    const KIND: RecurrentActivation = RecurrentActivation::Sigmoid;

    #[inline(always)]
    fn forward(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    #[inline(always)]
    fn derivative(x: f32) -> f32 {
        let y = Self::forward(x);
        y * (1.0 - y)
    }
}

/// Activation tag carried by a [`RecurrentOpsHandle`](crate::RecurrentOpsHandle).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum RecurrentActivation {
    Identity,
    #[default]
    RectifiedLinear,
    Tanh,
    Sigmoid,
}

impl RecurrentActivation {
    /// Scalar forward, for host-side use. Kernels use [`ActivationFn`].
    pub fn forward(self, x: f32) -> f32 {
        crate::with_activation!(self, A => A::forward(x))
    }

    /// Scalar derivative at pre-activation `x`, for host-side use.
    pub fn derivative(self, x: f32) -> f32 {
        crate::with_activation!(self, A => A::derivative(x))
    }

    pub(crate) const fn code(self) -> u32 {
        match self {
            Self::Identity => 1,
            Self::RectifiedLinear => 2,
            Self::Tanh => 3,
            Self::Sigmoid => 4,
        }
    }
}

impl std::fmt::Display for RecurrentActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::RectifiedLinear => write!(f, "rectified-linear"),
            Self::Tanh => write!(f, "tanh"),
            Self::Sigmoid => write!(f, "sigmoid"),
        }
    }
}

/// Bind the [`ActivationFn`] type for a runtime [`RecurrentActivation`] tag.
///
/// ```ignore
/// with_activation!(handle.activation(), A => launch(&ForwardKernel::<E, A>::new(..)))
/// ```
#[macro_export]
macro_rules! with_activation {
    ($activation:expr, $A:ident => $body:expr) => {
        match $activation {
            $crate::activation::RecurrentActivation::Identity => {
                type $A = $crate::activation::Identity;
                $body
            }
            $crate::activation::RecurrentActivation::RectifiedLinear => {
                type $A = $crate::activation::RectifiedLinear;
                $body
            }
            $crate::activation::RecurrentActivation::Tanh => {
                type $A = $crate::activation::HyperbolicTangent;
                $body
            }
            $crate::activation::RecurrentActivation::Sigmoid => {
                type $A = $crate::activation::Sigmoid;
                $body
            }
        }
    };
}
