//! Attention with int8-quantized query/key products.
//!
//! K is smoothed by subtracting its per-head mean over the sequence, which
//! leaves the softmax unchanged but shrinks the dynamic range. Q and the
//! smoothed K are then fake-quantized to int8 with one scale per
//! `(batch, head)`, and the score matrix is dequantized by the product of
//! the two scales. The probability-value product runs in the input dtype.

use crate::mask::causal_mask;
use crate::{AttentionBackend, BackendDescriptor, Layout, MaskSupport, Result, softmax_scale};
use candle_core::{DType, Tensor};

static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "quantized",
    label: "Quantized",
    layout: Layout::Bhld,
    dtypes: &[DType::F16, DType::BF16],
    mask: MaskSupport::CausalFlag,
};

const INT8_MAX: f64 = 127.0;
/// Floor for per-head scales so all-zero heads do not divide by zero.
const MIN_SCALE: f32 = 1e-8;

#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizedBackend;

/// Per-`(batch, head)` symmetric int8 codes and scales.
///
/// Codes stay in `f32` so the integer product can go through a regular
/// matmul; they are exact integers in `[-127, 127]`.
pub fn quantize_per_head(x: &Tensor) -> Result<(Tensor, Tensor)> {
    let amax = x.abs()?.max_keepdim(3)?.max_keepdim(2)?;
    let scale = amax.affine(1.0 / INT8_MAX, 0.0)?.maximum(MIN_SCALE)?;
    let codes = x.broadcast_div(&scale)?.round()?.clamp(-127f32, 127f32)?;
    Ok((codes, scale))
}

impl AttentionBackend for QuantizedBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &DESCRIPTOR
    }

    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        causal: bool,
        _mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (_, _, q_len, head_dim) = q.dims4()?;
        let kv_len = k.dim(2)?;

        let q32 = q.to_dtype(DType::F32)?;
        let k32 = k.to_dtype(DType::F32)?;
        let k32 = k32.broadcast_sub(&k32.mean_keepdim(2)?)?;

        let (q_codes, q_scale) = quantize_per_head(&q32)?;
        let (k_codes, k_scale) = quantize_per_head(&k32)?;

        let dequant = q_scale.mul(&k_scale)?.affine(softmax_scale(head_dim), 0.0)?;
        let mut scores = q_codes.matmul(&k_codes.t()?)?.broadcast_mul(&dequant)?;
        if causal {
            let mask = causal_mask(q_len, kv_len, 0, DType::F32, scores.device())?;
            scores = scores.broadcast_add(&mask)?;
        }

        let probs = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(v.dtype())?;
        Ok(probs.matmul(v)?)
    }
}
