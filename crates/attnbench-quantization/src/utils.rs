//! Error metrics for the fake quantization round-trip

use crate::{QuantFormat, QuantizationError, Result, quantize};

/// Calculate mean squared error between two tensors
pub fn calculate_mse(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(QuantizationError::LengthMismatch { left: a.len(), right: b.len() });
    }
    if a.is_empty() {
        return Ok(0.0);
    }

    let mse = a.iter().zip(b.iter()).map(|(&x, &y)| (x - y).powi(2)).sum::<f32>() / a.len() as f32;

    Ok(mse)
}

/// Calculate signal-to-noise ratio in dB
pub fn calculate_snr(original: &[f32], quantized: &[f32]) -> Result<f32> {
    let noise_power = calculate_mse(original, quantized)?;
    if noise_power == 0.0 {
        return Ok(f32::INFINITY);
    }
    let signal_power = original.iter().map(|&x| x.powi(2)).sum::<f32>() / original.len() as f32;

    Ok(10.0 * (signal_power / noise_power).log10())
}

/// Largest element-wise absolute difference
pub fn max_abs_error(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(QuantizationError::LengthMismatch { left: a.len(), right: b.len() });
    }
    Ok(a.iter().zip(b).fold(0.0f32, |acc, (&x, &y)| acc.max((x - y).abs())))
}

/// Numerical degradation of one fake quantization round-trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundTripReport {
    pub format: QuantFormat,
    pub scale: f32,
    pub mse: f32,
    pub snr_db: f32,
    pub max_abs_error: f32,
}

/// Quantize and dequantize `data`, then measure what was lost.
pub fn round_trip_report(data: &[f32], format: QuantFormat) -> Result<RoundTripReport> {
    let quantized = quantize(data, &[data.len()], format)?;
    let restored = quantized.dequantize();
    Ok(RoundTripReport {
        format,
        scale: quantized.scale,
        mse: calculate_mse(data, &restored)?,
        snr_db: calculate_snr(data, &restored)?,
        max_abs_error: max_abs_error(data, &restored)?,
    })
}
