//! Additive attention masks.

use crate::Result;
use candle_core::{DType, Device, Tensor};

/// Top-left aligned causal mask of shape `[q_len, kv_len]`.
///
/// Query row `i` sits at absolute position `q_offset + i` and may attend to
/// key `j` only when `j <= q_offset + i`; masked entries are `-inf`.
pub fn causal_mask(
    q_len: usize,
    kv_len: usize,
    q_offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..kv_len).map(move |j| if j > q_offset + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (q_len, kv_len), device)?;
    if dtype == DType::F32 { Ok(mask) } else { Ok(mask.to_dtype(dtype)?) }
}

/// Add `mask` to `scores`, casting it to the scores' dtype first.
pub fn apply_additive_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask =
        if mask.dtype() == scores.dtype() { mask.clone() } else { mask.to_dtype(scores.dtype())? };
    Ok(scores.broadcast_add(&mask)?)
}
