//! Query-chunked attention.
//!
//! Processes queries in fixed-size chunks so the score scratch buffer is
//! bounded by `chunk x kv_len` instead of `q_len x kv_len`. With a causal
//! flag each chunk only reads the keys it can see.

use crate::mask::causal_mask;
use crate::{AttentionBackend, BackendDescriptor, Layout, MaskSupport, Result, softmax_scale};
use candle_core::{DType, Tensor};

static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "mem_efficient",
    label: "MemEfficient",
    layout: Layout::Bhld,
    dtypes: &[DType::F32, DType::F16, DType::BF16],
    mask: MaskSupport::CausalFlag,
};

pub const DEFAULT_QUERY_CHUNK: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct MemEfficientBackend {
    query_chunk: usize,
}

impl MemEfficientBackend {
    pub fn new(query_chunk: usize) -> Self {
        Self { query_chunk: query_chunk.max(1) }
    }

    pub fn query_chunk(&self) -> usize {
        self.query_chunk
    }
}

impl Default for MemEfficientBackend {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_CHUNK)
    }
}

impl AttentionBackend for MemEfficientBackend {
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
        let scale = softmax_scale(head_dim);

        let mut chunks = Vec::with_capacity(q_len.div_ceil(self.query_chunk));
        for start in (0..q_len).step_by(self.query_chunk) {
            let len = self.query_chunk.min(q_len - start);
            let q_chunk = q.narrow(2, start, len)?.contiguous()?;

            // Keys past the last query position in the chunk are fully masked.
            let visible = if causal { (start + len).min(kv_len) } else { kv_len };
            let k_chunk = k.narrow(2, 0, visible)?.contiguous()?;
            let v_chunk = v.narrow(2, 0, visible)?.contiguous()?;

            let mut scores = q_chunk.matmul(&k_chunk.t()?)?.affine(scale, 0.0)?;
            if causal {
                let mask = causal_mask(len, visible, start, scores.dtype(), scores.device())?;
                scores = scores.broadcast_add(&mask)?;
            }
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;
            chunks.push(probs.matmul(&v_chunk)?);
        }

        let refs: Vec<&Tensor> = chunks.iter().collect();
        Ok(Tensor::cat(&refs, 2)?)
    }
}
