//! Precision modes swept by the benchmark.
//!
//! A precision is either *native* (the base tensors are cast to a real
//! dtype before the backend call) or *simulated* (the base tensors go
//! through a quantize/dequantize round-trip and stay in `f32`).

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric format a sweep cell runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrecisionMode {
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "bfloat16")]
    Bf16,
    /// Native 8-bit float, 4 exponent / 3 mantissa bits. Hardware-conditional.
    #[serde(rename = "float8_e4m3fn")]
    Fp8E4M3,
    /// Native 8-bit float, 5 exponent / 2 mantissa bits. Hardware-conditional.
    #[serde(rename = "float8_e5m2")]
    Fp8E5M2,
    /// E4M3 stand-in through the 8-bit signed fake quantizer.
    #[serde(rename = "fp8_e4m3_fake")]
    Fp8E4M3Sim,
    /// E5M2 stand-in through the 8-bit signed fake quantizer.
    #[serde(rename = "fp8_e5m2_fake")]
    Fp8E5M2Sim,
    /// 4-bit stand-in through the 4-bit signed fake quantizer.
    #[serde(rename = "fp4_fake")]
    Fp4Sim,
}

impl PrecisionMode {
    /// Every mode, in report order.
    pub const ALL: [PrecisionMode; 8] = [
        PrecisionMode::F32,
        PrecisionMode::F16,
        PrecisionMode::Bf16,
        PrecisionMode::Fp8E4M3,
        PrecisionMode::Fp8E5M2,
        PrecisionMode::Fp8E4M3Sim,
        PrecisionMode::Fp8E5M2Sim,
        PrecisionMode::Fp4Sim,
    ];

    /// Label used in tables, config files and the CLI.
    pub const fn label(self) -> &'static str {
        match self {
            PrecisionMode::F32 => "float32",
            PrecisionMode::F16 => "float16",
            PrecisionMode::Bf16 => "bfloat16",
            PrecisionMode::Fp8E4M3 => "float8_e4m3fn",
            PrecisionMode::Fp8E5M2 => "float8_e5m2",
            PrecisionMode::Fp8E4M3Sim => "fp8_e4m3_fake",
            PrecisionMode::Fp8E5M2Sim => "fp8_e5m2_fake",
            PrecisionMode::Fp4Sim => "fp4_fake",
        }
    }

    /// Returns true for the quantize/dequantize stand-ins.
    pub const fn is_simulated(self) -> bool {
        matches!(
            self,
            PrecisionMode::Fp8E4M3Sim | PrecisionMode::Fp8E5M2Sim | PrecisionMode::Fp4Sim
        )
    }

    /// Returns true when native support depends on the running hardware.
    pub const fn is_hardware_conditional(self) -> bool {
        matches!(self, PrecisionMode::Fp8E4M3 | PrecisionMode::Fp8E5M2)
    }

    /// Tensor dtype a native mode casts to.
    ///
    /// `None` for simulated modes and for native formats the tensor runtime
    /// cannot represent (E5M2).
    pub const fn native_dtype(self) -> Option<DType> {
        match self {
            PrecisionMode::F32 => Some(DType::F32),
            PrecisionMode::F16 => Some(DType::F16),
            PrecisionMode::Bf16 => Some(DType::BF16),
            PrecisionMode::Fp8E4M3 => Some(DType::F8E4M3),
            PrecisionMode::Fp8E5M2 => None,
            PrecisionMode::Fp8E4M3Sim | PrecisionMode::Fp8E5M2Sim | PrecisionMode::Fp4Sim => None,
        }
    }

    /// Bit width of the fake quantizer used by a simulated mode.
    pub const fn simulated_bits(self) -> Option<u8> {
        match self {
            PrecisionMode::Fp8E4M3Sim | PrecisionMode::Fp8E5M2Sim => Some(8),
            PrecisionMode::Fp4Sim => Some(4),
            _ => None,
        }
    }

    /// Dtype the backend actually sees once the transform is applied.
    ///
    /// Simulated modes dequantize back to `f32`.
    pub const fn compute_dtype(self) -> Option<DType> {
        if self.is_simulated() {
            Some(DType::F32)
        } else {
            self.native_dtype()
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for PrecisionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "float32" | "f32" | "fp32" => Ok(PrecisionMode::F32),
            "float16" | "f16" | "fp16" => Ok(PrecisionMode::F16),
            "bfloat16" | "bf16" => Ok(PrecisionMode::Bf16),
            "float8_e4m3fn" | "fp8_e4m3" => Ok(PrecisionMode::Fp8E4M3),
            "float8_e5m2" | "fp8_e5m2" => Ok(PrecisionMode::Fp8E5M2),
            "fp8_e4m3_fake" => Ok(PrecisionMode::Fp8E4M3Sim),
            "fp8_e5m2_fake" => Ok(PrecisionMode::Fp8E5M2Sim),
            "fp4_fake" | "fp4" => Ok(PrecisionMode::Fp4Sim),
            other => Err(format!("unknown precision: {other}")),
        }
    }
}
