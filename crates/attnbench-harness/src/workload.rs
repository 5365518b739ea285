//! Seeded q/k/v generation.
//!
//! The base tensors are drawn once per sweep run in `f32` and every cell
//! transforms its own copy, so all cells of a run see identical values
//! before the precision transform.

use crate::{HarnessError, Result};
use attnbench_common::{PrecisionMode, WorkloadSpec};
use attnbench_quantization::{
    QuantFormat, RoundTripReport, extract_f32_data, fake_quantize, round_trip_report,
};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Query, key and value of one sweep run, BHLD.
#[derive(Debug, Clone)]
pub struct BaseTensors {
    pub spec: WorkloadSpec,
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
}

/// Draw independent standard-normal q, k and v for `spec`.
///
/// Values come from a host-side `StdRng` so the same seed gives the same
/// inputs on every device.
pub fn generate(
    spec: WorkloadSpec,
    dtype: DType,
    seed: u64,
    device: &Device,
) -> Result<BaseTensors> {
    spec.validate()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut draw = || -> Result<Tensor> {
        let data: Vec<f32> =
            (0..spec.numel()).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        let t = Tensor::from_vec(data, spec.shape(), device)?;
        Ok(if dtype == DType::F32 { t } else { t.to_dtype(dtype)? })
    };
    let q = draw()?;
    let k = draw()?;
    let v = draw()?;
    tracing::debug!(%spec, seed, ?dtype, "generated base tensors");
    Ok(BaseTensors { spec, q, k, v })
}

/// Round-trip error of one tensor under a simulated precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantErrorRow {
    pub precision: PrecisionMode,
    pub tensor: &'static str,
    pub report: RoundTripReport,
}

impl BaseTensors {
    /// A copy of the inputs in `precision`.
    ///
    /// Native modes cast; simulated modes fake-quantize each tensor with its
    /// own scale and stay in `f32`.
    pub fn transform(&self, precision: PrecisionMode) -> Result<BaseTensors> {
        let apply = |t: &Tensor| -> Result<Tensor> {
            if let Some(format) = simulated_format(precision) {
                let t = if t.dtype() == DType::F32 { t.clone() } else { t.to_dtype(DType::F32)? };
                return Ok(fake_quantize(&t, format)?);
            }
            let dtype =
                precision.native_dtype().ok_or(HarnessError::UnsupportedPrecision(precision))?;
            Ok(t.to_dtype(dtype)?)
        };
        Ok(BaseTensors {
            spec: self.spec,
            q: apply(&self.q)?,
            k: apply(&self.k)?,
            v: apply(&self.v)?,
        })
    }

    /// Quantization error of q, k and v; empty for native precisions.
    pub fn quant_error(&self, precision: PrecisionMode) -> Result<Vec<QuantErrorRow>> {
        let Some(format) = simulated_format(precision) else {
            return Ok(Vec::new());
        };
        [("q", &self.q), ("k", &self.k), ("v", &self.v)]
            .into_iter()
            .map(|(tensor, t)| -> Result<QuantErrorRow> {
                let data = extract_f32_data(t)?;
                Ok(QuantErrorRow { precision, tensor, report: round_trip_report(&data, format)? })
            })
            .collect()
    }

    pub fn dtype(&self) -> DType {
        self.q.dtype()
    }
}

fn simulated_format(precision: PrecisionMode) -> Option<QuantFormat> {
    precision.simulated_bits().and_then(QuantFormat::from_bits)
}
