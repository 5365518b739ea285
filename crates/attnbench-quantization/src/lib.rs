//! Fake quantization for simulated precisions
//!
//! Many low-bit formats of interest cannot be executed natively on
//! commodity hardware. This crate simulates their information loss with a
//! per-tensor symmetric quantize/dequantize round-trip so the sweep can
//! still run a backend on the degraded values:
//!
//! - `Int4`: 4-bit signed, scale = max|x| / 7, codes clamped to `[-8, 7]`
//! - `Int8`: 8-bit signed, scale = max|x| / 127, codes clamped to `[-127, 127]`
//!
//! The simulated values are computed in full precision; only the rounding
//! error is reproduced, not the speed of a native low-bit kernel.

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

pub mod utils;

pub use utils::{RoundTripReport, calculate_mse, calculate_snr, max_abs_error, round_trip_report};

/// Target format of the fake quantizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantFormat {
    /// 4-bit signed symmetric.
    Int4,
    /// 8-bit signed symmetric.
    Int8,
}

impl QuantFormat {
    /// Format for a bit width, if supported.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            4 => Some(QuantFormat::Int4),
            8 => Some(QuantFormat::Int8),
            _ => None,
        }
    }

    /// Magnitude the tensor maximum is mapped to.
    pub const fn max_magnitude(self) -> f32 {
        match self {
            QuantFormat::Int4 => 7.0,
            QuantFormat::Int8 => 127.0,
        }
    }

    /// Inclusive clamp range of the integer codes.
    ///
    /// The 4-bit range keeps the extra negative code even though the scale
    /// divides by 7, so `-8` is reachable only by clamping.
    pub const fn code_range(self) -> (i8, i8) {
        match self {
            QuantFormat::Int4 => (-8, 7),
            QuantFormat::Int8 => (-127, 127),
        }
    }
}

impl std::fmt::Display for QuantFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuantFormat::Int4 => write!(f, "int4"),
            QuantFormat::Int8 => write!(f, "int8"),
        }
    }
}

/// Fake quantization failures.
#[derive(Debug, Error)]
pub enum QuantizationError {
    #[error("non-finite value {value} at index {index}")]
    NonFinite { index: usize, value: f32 },
    #[error("shape {shape:?} holds {expected} elements but {actual} were given")]
    ShapeMismatch { shape: Vec<usize>, expected: usize, actual: usize },
    #[error("length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, QuantizationError>;

/// Integer codes plus the single per-tensor scale.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub codes: Vec<i8>,
    /// Zero when the source tensor was all zeros.
    pub scale: f32,
    pub shape: Vec<usize>,
    pub format: QuantFormat,
}

impl QuantizedTensor {
    pub fn numel(&self) -> usize {
        self.codes.len()
    }

    /// Map the codes back to full precision.
    pub fn dequantize(&self) -> Vec<f32> {
        self.codes.iter().map(|&c| f32::from(c) * self.scale).collect()
    }
}

/// Quantize `data` with a single scale derived from its maximum magnitude.
pub fn quantize(data: &[f32], shape: &[usize], format: QuantFormat) -> Result<QuantizedTensor> {
    let expected: usize = shape.iter().product();
    if expected != data.len() {
        return Err(QuantizationError::ShapeMismatch {
            shape: shape.to_vec(),
            expected,
            actual: data.len(),
        });
    }

    let mut max_abs = 0.0f32;
    for (index, &value) in data.iter().enumerate() {
        if !value.is_finite() {
            return Err(QuantizationError::NonFinite { index, value });
        }
        max_abs = max_abs.max(value.abs());
    }

    let scale = max_abs / format.max_magnitude();
    if scale == 0.0 {
        return Ok(QuantizedTensor {
            codes: vec![0; data.len()],
            scale: 0.0,
            shape: shape.to_vec(),
            format,
        });
    }

    let (lo, hi) = format.code_range();
    let codes = data.iter().map(|&x| quantize_value(x, scale, lo, hi)).collect();
    Ok(QuantizedTensor { codes, scale, shape: shape.to_vec(), format })
}

#[inline]
fn quantize_value(value: f32, scale: f32, lo: i8, hi: i8) -> i8 {
    let q = (value / scale).round_ties_even();
    q.clamp(f32::from(lo), f32::from(hi)) as i8
}

/// Inverse of [`quantize`]; identical to [`QuantizedTensor::dequantize`].
pub fn dequantize(quantized: &QuantizedTensor) -> Vec<f32> {
    quantized.dequantize()
}

/// Copy a tensor to host memory as flat `f32`.
pub fn extract_f32_data(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor.flatten_all()?;
    let flat = if flat.dtype() == DType::F32 { flat } else { flat.to_dtype(DType::F32)? };
    Ok(flat.to_vec1::<f32>()?)
}

/// Quantize a tensor of any float dtype.
pub fn quantize_tensor(tensor: &Tensor, format: QuantFormat) -> Result<QuantizedTensor> {
    let data = extract_f32_data(tensor)?;
    quantize(&data, tensor.dims(), format)
}

/// Dequantize into an `f32` tensor on `device`.
pub fn dequantize_to_tensor(quantized: &QuantizedTensor, device: &Device) -> Result<Tensor> {
    let data = quantized.dequantize();
    Ok(Tensor::from_vec(data, quantized.shape.as_slice(), device)?)
}

/// Quantize then dequantize, returning an `f32` tensor on the input's device.
pub fn fake_quantize(tensor: &Tensor, format: QuantFormat) -> Result<Tensor> {
    let quantized = quantize_tensor(tensor, format)?;
    tracing::trace!(
        %format,
        scale = quantized.scale,
        numel = quantized.numel(),
        "fake quantized tensor"
    );
    dequantize_to_tensor(&quantized, tensor.device())
}
