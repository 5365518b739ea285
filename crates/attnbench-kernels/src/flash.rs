//! Tiled attention with an online softmax.
//!
//! Walks the keys in blocks, keeping a running row maximum `m`, running
//! normalizer `l` and unnormalized output `acc` in `f32`. The full score
//! matrix is never materialized. Inputs arrive as BLHD and only half
//! precision dtypes are accepted.

use crate::{AttentionBackend, BackendDescriptor, Layout, MaskSupport, Result, softmax_scale};
use candle_core::{DType, Device, Tensor};

static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "flash",
    label: "Flash",
    layout: Layout::Blhd,
    dtypes: &[DType::F16, DType::BF16],
    mask: MaskSupport::CausalFlag,
};

pub const DEFAULT_KV_BLOCK: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct FlashBackend {
    kv_block: usize,
}

impl FlashBackend {
    pub fn new(kv_block: usize) -> Self {
        Self { kv_block: kv_block.max(1) }
    }
}

impl Default for FlashBackend {
    fn default() -> Self {
        Self::new(DEFAULT_KV_BLOCK)
    }
}

impl AttentionBackend for FlashBackend {
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
        let out_dtype = q.dtype();
        let (batch, q_len, heads, head_dim) = q.dims4()?;
        let kv_len = k.dim(1)?;
        let device = q.device();

        // Heads move in front of the sequence for the per-head matmuls.
        let q = q.transpose(1, 2)?.contiguous()?.to_dtype(DType::F32)?;
        let q = q.affine(softmax_scale(head_dim), 0.0)?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;

        let mut m = Tensor::full(f32::NEG_INFINITY, (batch, heads, q_len, 1), device)?;
        let mut l = Tensor::zeros((batch, heads, q_len, 1), DType::F32, device)?;
        let mut acc = Tensor::zeros((batch, heads, q_len, head_dim), DType::F32, device)?;

        for start in (0..kv_len).step_by(self.kv_block) {
            // Top-left causal alignment: no query row sees past q_len - 1.
            if causal && start >= q_len {
                break;
            }
            let len = self.kv_block.min(kv_len - start);
            let k_blk = k.narrow(2, start, len)?.to_dtype(DType::F32)?;
            let v_blk = v.narrow(2, start, len)?.to_dtype(DType::F32)?;

            let mut s = q.matmul(&k_blk.t()?)?;
            if causal {
                let mask = causal_block_mask(q_len, start, len, device)?;
                s = s.broadcast_add(&mask)?;
            }

            let m_new = m.maximum(&s.max_keepdim(3)?)?;
            let p = s.broadcast_sub(&m_new)?.exp()?;
            let correction = m.sub(&m_new)?.exp()?;
            l = l.mul(&correction)?.add(&p.sum_keepdim(3)?)?;
            acc = acc.broadcast_mul(&correction)?.add(&p.matmul(&v_blk)?)?;
            m = m_new;
        }

        let out = acc.broadcast_div(&l)?.to_dtype(out_dtype)?;
        Ok(out.transpose(1, 2)?.contiguous()?)
    }
}

/// Causal mask for keys `[start, start + len)` against all query rows.
fn causal_block_mask(q_len: usize, start: usize, len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (start..start + len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Ok(Tensor::from_vec(mask, (q_len, len), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttentionOptions, SdpaBackend};

    fn randn(shape: (usize, usize, usize, usize)) -> Tensor {
        Tensor::randn(0f32, 1.0, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn matches_reference_across_block_boundaries() {
        let q = randn((1, 2, 13, 8));
        let k = randn((1, 2, 13, 8));
        let v = randn((1, 2, 13, 8));
        let backend = FlashBackend::new(4);
        for causal in [false, true] {
            let opts = AttentionOptions::causal(causal);
            let reference = SdpaBackend.compute(&q, &k, &v, &opts).unwrap();
            let (q16, k16, v16) = (
                q.to_dtype(DType::F16).unwrap(),
                k.to_dtype(DType::F16).unwrap(),
                v.to_dtype(DType::F16).unwrap(),
            );
            let tiled = backend.compute(&q16, &k16, &v16, &opts).unwrap();
            assert_eq!(tiled.dtype(), DType::F16);
            assert_eq!(tiled.dims(), q.dims());
            let diff = tiled
                .to_dtype(DType::F32)
                .unwrap()
                .sub(&reference)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-2, "causal={causal} diff={diff}");
        }
    }

    #[test]
    fn float32_is_rejected() {
        let q = randn((1, 1, 4, 4));
        let err = FlashBackend::default().compute(&q, &q, &q, &AttentionOptions::default());
        assert!(matches!(err, Err(crate::KernelError::UnsupportedDtype { backend: "flash", .. })));
    }
}
