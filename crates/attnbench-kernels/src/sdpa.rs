//! Reference scaled dot-product attention.
//!
//! Materializes the full `[q_len, kv_len]` score matrix per head. Accepts
//! both a causal flag and an explicit additive mask.

use crate::mask::{apply_additive_mask, causal_mask};
use crate::{AttentionBackend, BackendDescriptor, Layout, MaskSupport, Result, softmax_scale};
use candle_core::{DType, Tensor};

static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "sdpa",
    label: "SDPA",
    layout: Layout::Bhld,
    dtypes: &[DType::F32, DType::F16, DType::BF16, DType::F8E4M3],
    mask: MaskSupport::Both,
};

/// Straightforward `softmax(q kᵀ / sqrt(d) + mask) v`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdpaBackend;

impl AttentionBackend for SdpaBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        &DESCRIPTOR
    }

    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        causal: bool,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (_, _, q_len, head_dim) = q.dims4()?;
        let kv_len = k.dim(2)?;

        let mut scores = q.matmul(&k.t()?)?.affine(softmax_scale(head_dim), 0.0)?;
        if causal {
            let causal = causal_mask(q_len, kv_len, 0, scores.dtype(), scores.device())?;
            scores = scores.broadcast_add(&causal)?;
        }
        if let Some(mask) = mask {
            scores = apply_additive_mask(&scores, mask)?;
        }

        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        Ok(probs.matmul(v)?)
    }
}
