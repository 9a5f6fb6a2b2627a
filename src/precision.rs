//! Numeric precision of stored tensors.
//!
//! Storage is one of a closed set of element types; every intermediate sum is
//! carried in `f32`, which is at least as wide as any storage type.

use half::{bf16, f16};
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Width used for intermediate accumulation.
pub type Acc = f32;

/// Storage precision tag.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "kebab-case")]
pub enum Precision {
    #[default]
    Single,
    Half,
    #[cfg_attr(feature = "cli", value(name = "bfloat16"))]
    #[serde(rename = "bfloat16")]
    BFloat16,
}

impl Precision {
    /// Bytes per stored element.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Single => 4,
            Self::Half | Self::BFloat16 => 2,
        }
    }

    /// Bytes per accumulator element.
    pub const fn accumulation_bytes(self) -> usize {
        std::mem::size_of::<Acc>()
    }

    /// Stable numeric code, used in the scratch header.
    pub(crate) const fn code(self) -> u32 {
        match self {
            Self::Single => 1,
            Self::Half => 2,
            Self::BFloat16 => 3,
        }
    }

    /// Suggested absolute tolerance when comparing results of this precision.
    pub fn tolerance(self) -> f32 {
        match self {
            Self::Single => 1e-4,
            Self::Half => 1e-2,
            Self::BFloat16 => 5e-2,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Half => write!(f, "half"),
            Self::BFloat16 => write!(f, "bfloat16"),
        }
    }
}

/// A storage element the engine can operate on.
pub trait Element: Float + bytemuck::Pod + Default + Send + Sync + std::fmt::Debug + 'static {
    const PRECISION: Precision;

    fn to_acc(self) -> Acc;
    fn from_acc(value: Acc) -> Self;
}

impl Element for f32 {
    const PRECISION: Precision = Precision::Single;

    #[inline(always)]
    fn to_acc(self) -> Acc {
        self
    }

    #[inline(always)]
    fn from_acc(value: Acc) -> Self {
        value
    }
}

impl Element for f16 {
    const PRECISION: Precision = Precision::Half;

    #[inline(always)]
    fn to_acc(self) -> Acc {
        self.to_f32()
    }

    #[inline(always)]
    fn from_acc(value: Acc) -> Self {
        f16::from_f32(value)
    }
}

impl Element for bf16 {
    const PRECISION: Precision = Precision::BFloat16;

    #[inline(always)]
    fn to_acc(self) -> Acc {
        self.to_f32()
    }

    #[inline(always)]
    fn from_acc(value: Acc) -> Self {
        bf16::from_f32(value)
    }
}
