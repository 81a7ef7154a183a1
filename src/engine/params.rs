//! Closed integer enums understood by the native engine.
//!
//! Each enum maps to the integer code the engine expects and has a fixed
//! default used when the caller leaves the field unset.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SdError;

/// Sampling method used by the diffusion loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SampleMethod {
    /// Euler ancestral.
    #[default]
    EulerA,
    Euler,
    Heun,
    Dpm2,
    /// DPM++ 2S ancestral.
    Dpmpp2sA,
    /// DPM++ 2M.
    Dpmpp2m,
    /// DPM++ 2M v2.
    Dpmpp2mV2,
    /// Latent consistency sampler.
    Lcm,
}

impl SampleMethod {
    /// Integer code passed across the engine boundary.
    pub fn code(&self) -> i32 {
        match self {
            SampleMethod::EulerA => 0,
            SampleMethod::Euler => 1,
            SampleMethod::Heun => 2,
            SampleMethod::Dpm2 => 3,
            SampleMethod::Dpmpp2sA => 4,
            SampleMethod::Dpmpp2m => 5,
            SampleMethod::Dpmpp2mV2 => 6,
            SampleMethod::Lcm => 7,
        }
    }

    /// Returns the string representation of the sampler.
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleMethod::EulerA => "euler_a",
            SampleMethod::Euler => "euler",
            SampleMethod::Heun => "heun",
            SampleMethod::Dpm2 => "dpm2",
            SampleMethod::Dpmpp2sA => "dpm++2s_a",
            SampleMethod::Dpmpp2m => "dpm++2m",
            SampleMethod::Dpmpp2mV2 => "dpm++2mv2",
            SampleMethod::Lcm => "lcm",
        }
    }

    /// Parses a sampler from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "euler_a" | "eulera" => Some(SampleMethod::EulerA),
            "euler" => Some(SampleMethod::Euler),
            "heun" => Some(SampleMethod::Heun),
            "dpm2" => Some(SampleMethod::Dpm2),
            "dpm++2s_a" | "dpmpp2s_a" => Some(SampleMethod::Dpmpp2sA),
            "dpm++2m" | "dpmpp2m" => Some(SampleMethod::Dpmpp2m),
            "dpm++2mv2" | "dpmpp2mv2" => Some(SampleMethod::Dpmpp2mV2),
            "lcm" => Some(SampleMethod::Lcm),
            _ => None,
        }
    }
}

/// Noise schedule used by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    /// Whatever the model prefers.
    #[default]
    Default,
    Discrete,
    Karras,
}

impl Schedule {
    /// Integer code passed across the engine boundary.
    pub fn code(&self) -> i32 {
        match self {
            Schedule::Default => 0,
            Schedule::Discrete => 1,
            Schedule::Karras => 2,
        }
    }

    /// Returns the string representation of the schedule.
    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Default => "default",
            Schedule::Discrete => "discrete",
            Schedule::Karras => "karras",
        }
    }

    /// Parses a schedule from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "default" => Some(Schedule::Default),
            "discrete" => Some(Schedule::Discrete),
            "karras" => Some(Schedule::Karras),
            _ => None,
        }
    }
}

/// Random number generator used for the initial latent noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RngKind {
    /// Standard library generator, identical on every device.
    #[default]
    StdDefault,
    /// CUDA-compatible generator, reproduces CUDA-based frontends.
    Cuda,
}

impl RngKind {
    /// Integer code passed across the engine boundary.
    pub fn code(&self) -> i32 {
        match self {
            RngKind::StdDefault => 0,
            RngKind::Cuda => 1,
        }
    }

    /// Returns the string representation of the generator.
    pub fn as_str(&self) -> &'static str {
        match self {
            RngKind::StdDefault => "std_default",
            RngKind::Cuda => "cuda",
        }
    }

    /// Parses a generator kind from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "std_default" | "std" | "default" => Some(RngKind::StdDefault),
            "cuda" => Some(RngKind::Cuda),
            _ => None,
        }
    }
}

/// Weight precision (ggml tensor type) the engine converts weights to.
///
/// `Count` is the "unset" sentinel: keep the precision stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeightType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2K,
    Q3K,
    Q4K,
    Q5K,
    Q6K,
    Q8K,
    I8,
    I16,
    I32,
    #[default]
    Count,
}

impl WeightType {
    /// Integer code passed across the engine boundary.
    ///
    /// Codes 4 and 5 belong to quantizations the engine no longer supports.
    pub fn code(&self) -> i32 {
        match self {
            WeightType::F32 => 0,
            WeightType::F16 => 1,
            WeightType::Q4_0 => 2,
            WeightType::Q4_1 => 3,
            WeightType::Q5_0 => 6,
            WeightType::Q5_1 => 7,
            WeightType::Q8_0 => 8,
            WeightType::Q8_1 => 9,
            WeightType::Q2K => 10,
            WeightType::Q3K => 11,
            WeightType::Q4K => 12,
            WeightType::Q5K => 13,
            WeightType::Q6K => 14,
            WeightType::Q8K => 15,
            WeightType::I8 => 16,
            WeightType::I16 => 17,
            WeightType::I32 => 18,
            WeightType::Count => 19,
        }
    }

    /// Parses a weight type from a string such as "f16" or "q8_0".
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "f32" => Some(WeightType::F32),
            "f16" => Some(WeightType::F16),
            "q4_0" => Some(WeightType::Q4_0),
            "q4_1" => Some(WeightType::Q4_1),
            "q5_0" => Some(WeightType::Q5_0),
            "q5_1" => Some(WeightType::Q5_1),
            "q8_0" => Some(WeightType::Q8_0),
            "q8_1" => Some(WeightType::Q8_1),
            "q2_k" => Some(WeightType::Q2K),
            "q3_k" => Some(WeightType::Q3K),
            "q4_k" => Some(WeightType::Q4K),
            "q5_k" => Some(WeightType::Q5K),
            "q6_k" => Some(WeightType::Q6K),
            "q8_k" => Some(WeightType::Q8K),
            "i8" => Some(WeightType::I8),
            "i16" => Some(WeightType::I16),
            "i32" => Some(WeightType::I32),
            "count" | "unset" | "auto" => Some(WeightType::Count),
            _ => None,
        }
    }
}

macro_rules! impl_from_str {
    ($($ty:ident => $what:literal),* $(,)?) => {
        $(
            impl FromStr for $ty {
                type Err = SdError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    $ty::parse(s).ok_or_else(|| {
                        SdError::invalid_argument(format!("unknown {}: {}", $what, s))
                    })
                }
            }
        )*
    };
}

impl_from_str! {
    SampleMethod => "sample method",
    Schedule => "schedule",
    RngKind => "rng type",
    WeightType => "weight type",
}

impl std::fmt::Display for SampleMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for RngKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
