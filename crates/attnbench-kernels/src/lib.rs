//! Attention backends for attnbench
//!
//! Every backend implements [`AttentionBackend`]. Callers always hand over
//! `[batch, heads, seq, head_dim]` (BHLD) tensors and go through
//! [`AttentionBackend::compute`], which checks the static
//! [`BackendDescriptor`], translates causal/mask arguments into what the
//! backend understands, and converts to and from the backend's native
//! layout. Backends only implement [`AttentionBackend::forward`].

use candle_core::{DType, Tensor};

pub mod mask;
pub mod mem_efficient;
pub mod registry;
pub mod sdpa;

#[cfg(feature = "flash-attn")]
pub mod flash;
#[cfg(feature = "sage-attn")]
pub mod quantized;

pub use mask::{apply_additive_mask, causal_mask};
pub use mem_efficient::MemEfficientBackend;
pub use registry::{BackendRegistry, UnavailableBackend};
pub use sdpa::SdpaBackend;

#[cfg(feature = "flash-attn")]
pub use flash::FlashBackend;
#[cfg(feature = "sage-attn")]
pub use quantized::QuantizedBackend;

/// Kernel errors
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("{backend} does not accept dtype {dtype:?}")]
    UnsupportedDtype { backend: &'static str, dtype: DType },
    #[error("{backend} cannot honour the requested masking: {reason}")]
    UnsupportedMask { backend: &'static str, reason: &'static str },
    #[error("{backend} is not available: {reason}")]
    Unavailable { backend: &'static str, reason: String },
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("invalid attention inputs: {0}")]
    Shape(String),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Dimension order a backend expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `[batch, heads, seq, head_dim]`
    Bhld,
    /// `[batch, seq, heads, head_dim]`
    Blhd,
}

impl Layout {
    /// Convert a BHLD tensor to this layout.
    pub fn to_native(self, t: &Tensor) -> Result<Tensor> {
        match self {
            Layout::Bhld => Ok(t.clone()),
            Layout::Blhd => Ok(t.transpose(1, 2)?.contiguous()?),
        }
    }

    /// Convert a tensor in this layout back to BHLD.
    pub fn to_bhld(self, t: &Tensor) -> Result<Tensor> {
        // The swap is its own inverse.
        self.to_native(t)
    }
}

/// How a backend expresses masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskSupport {
    /// No masking at all.
    None,
    /// A boolean `causal` argument only.
    CausalFlag,
    /// An explicit additive mask only.
    ExplicitMask,
    Both,
}

impl MaskSupport {
    pub const fn causal_flag(self) -> bool {
        matches!(self, MaskSupport::CausalFlag | MaskSupport::Both)
    }

    pub const fn explicit_mask(self) -> bool {
        matches!(self, MaskSupport::ExplicitMask | MaskSupport::Both)
    }
}

/// Static description of a backend, known before any call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// Stable identifier used in configuration.
    pub name: &'static str,
    /// Column header text.
    pub label: &'static str,
    pub layout: Layout,
    pub dtypes: &'static [DType],
    pub mask: MaskSupport,
}

impl BackendDescriptor {
    pub fn accepts(&self, dtype: DType) -> bool {
        self.dtypes.contains(&dtype)
    }

    /// Whether `options` can be expressed, possibly after translation.
    pub fn supports(&self, options: &AttentionOptions) -> bool {
        self.mask_rejection(options).is_none()
    }

    fn mask_rejection(&self, options: &AttentionOptions) -> Option<&'static str> {
        if options.mask.is_some() && !self.mask.explicit_mask() {
            return Some("explicit masks are not supported");
        }
        if options.causal && !self.mask.causal_flag() && !self.mask.explicit_mask() {
            return Some("causal attention is not supported");
        }
        None
    }
}

/// Per-call masking options.
#[derive(Debug, Clone, Default)]
pub struct AttentionOptions {
    pub causal: bool,
    /// Additive mask broadcastable to `[batch, heads, q_len, kv_len]`.
    pub mask: Option<Tensor>,
}

impl AttentionOptions {
    pub fn causal(causal: bool) -> Self {
        Self { causal, mask: None }
    }
}

/// Attention backend trait
pub trait AttentionBackend: Send + Sync {
    fn descriptor(&self) -> &'static BackendDescriptor;

    fn name(&self) -> &'static str {
        self.descriptor().name
    }

    fn is_available(&self) -> bool {
        true
    }

    /// Run attention on tensors already in the backend's native layout.
    ///
    /// `causal` is only ever set when the descriptor advertises a causal
    /// flag, and `mask` only when it advertises explicit masks.
    fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        causal: bool,
        mask: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// Normalized entry point taking and returning BHLD tensors.
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        options: &AttentionOptions,
    ) -> Result<Tensor> {
        let desc = self.descriptor();
        check_inputs(q, k, v)?;
        if !desc.accepts(q.dtype()) {
            return Err(KernelError::UnsupportedDtype { backend: desc.name, dtype: q.dtype() });
        }
        if let Some(reason) = desc.mask_rejection(options) {
            return Err(KernelError::UnsupportedMask { backend: desc.name, reason });
        }

        let (causal, mask) = if options.causal && !desc.mask.causal_flag() {
            let (_, _, q_len, _) = q.dims4()?;
            let kv_len = k.dim(2)?;
            let causal = causal_mask(q_len, kv_len, 0, q.dtype(), q.device())?;
            let mask = match &options.mask {
                Some(extra) => Some(causal.broadcast_add(&extra.to_dtype(q.dtype())?)?),
                None => Some(causal),
            };
            (false, mask)
        } else {
            (options.causal, options.mask.clone())
        };

        let q = desc.layout.to_native(q)?;
        let k = desc.layout.to_native(k)?;
        let v = desc.layout.to_native(v)?;
        let out = self.forward(&q, &k, &v, causal, mask.as_ref())?;
        desc.layout.to_bhld(&out)
    }
}

fn check_inputs(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<()> {
    let (qb, qh, _, qd) = q.dims4()?;
    let (kb, kh, kl, kd) = k.dims4()?;
    let (vb, vh, vl, _) = v.dims4()?;
    if (qb, qh, qd) != (kb, kh, kd) {
        return Err(KernelError::Shape(format!(
            "q {:?} and k {:?} disagree on batch, heads or head_dim",
            q.dims(),
            k.dims()
        )));
    }
    if (kb, kh, kl) != (vb, vh, vl) {
        return Err(KernelError::Shape(format!("k {:?} and v {:?} disagree", k.dims(), v.dims())));
    }
    if q.dtype() != k.dtype() || k.dtype() != v.dtype() {
        return Err(KernelError::Shape(format!(
            "mixed dtypes q={:?} k={:?} v={:?}",
            q.dtype(),
            k.dtype(),
            v.dtype()
        )));
    }
    Ok(())
}

/// Softmax scale `1 / sqrt(head_dim)`.
#[inline]
pub(crate) fn softmax_scale(head_dim: usize) -> f64 {
    1.0 / (head_dim as f64).sqrt()
}
