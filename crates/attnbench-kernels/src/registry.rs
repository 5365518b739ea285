//! Ordered set of attention backends.

use crate::{
    AttentionBackend, BackendDescriptor, KernelError, MemEfficientBackend, Result, SdpaBackend,
};
use candle_core::Tensor;

/// Every backend name the harness knows about, in default column order.
pub const BACKEND_NAMES: [&str; 4] = ["sdpa", "mem_efficient", "flash", "quantized"];

/// Placeholder for a backend compiled out of this binary.
///
/// Keeps the backend's column in reports; every cell reports not applicable.
#[derive(Debug, Clone, Copy)]
pub struct UnavailableBackend {
    descriptor: &'static BackendDescriptor,
    reason: &'static str,
}

impl UnavailableBackend {
    pub const fn new(descriptor: &'static BackendDescriptor, reason: &'static str) -> Self {
        Self { descriptor, reason }
    }
}

impl AttentionBackend for UnavailableBackend {
    fn descriptor(&self) -> &'static BackendDescriptor {
        self.descriptor
    }

    fn is_available(&self) -> bool {
        false
    }

    fn forward(
        &self,
        _q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        _causal: bool,
        _mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        Err(KernelError::Unavailable {
            backend: self.descriptor.name,
            reason: self.reason.to_string(),
        })
    }
}

#[cfg(not(feature = "flash-attn"))]
static FLASH_DISABLED: BackendDescriptor = BackendDescriptor {
    name: "flash",
    label: "Flash",
    layout: crate::Layout::Blhd,
    dtypes: &[candle_core::DType::F16, candle_core::DType::BF16],
    mask: crate::MaskSupport::CausalFlag,
};

#[cfg(not(feature = "sage-attn"))]
static QUANTIZED_DISABLED: BackendDescriptor = BackendDescriptor {
    name: "quantized",
    label: "Quantized",
    layout: crate::Layout::Bhld,
    dtypes: &[candle_core::DType::F16, candle_core::DType::BF16],
    mask: crate::MaskSupport::CausalFlag,
};

/// Backend registry with deterministic iteration order.
pub struct BackendRegistry {
    backends: Vec<Box<dyn AttentionBackend>>,
}

impl BackendRegistry {
    /// All backends, including placeholders for disabled features.
    pub fn new() -> Self {
        let mut backends: Vec<Box<dyn AttentionBackend>> =
            vec![Box::new(SdpaBackend), Box::new(MemEfficientBackend::default())];

        #[cfg(feature = "flash-attn")]
        backends.push(Box::new(crate::FlashBackend::default()));
        #[cfg(not(feature = "flash-attn"))]
        backends.push(Box::new(UnavailableBackend::new(
            &FLASH_DISABLED,
            "built without the `flash-attn` feature",
        )));

        #[cfg(feature = "sage-attn")]
        backends.push(Box::new(crate::QuantizedBackend));
        #[cfg(not(feature = "sage-attn"))]
        backends.push(Box::new(UnavailableBackend::new(
            &QUANTIZED_DISABLED,
            "built without the `sage-attn` feature",
        )));

        for backend in &backends {
            if backend.is_available() {
                tracing::debug!(backend = backend.name(), "registered attention backend");
            } else {
                tracing::debug!(backend = backend.name(), "attention backend unavailable");
            }
        }
        Self { backends }
    }

    /// Registry with an explicit backend list, in the given order.
    pub fn from_backends(backends: Vec<Box<dyn AttentionBackend>>) -> Self {
        Self { backends }
    }

    /// Keep only `names`, in the order given. An empty list keeps everything.
    pub fn select(mut self, names: &[String]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self);
        }
        let mut selected = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            let idx = self
                .backends
                .iter()
                .position(|b| b.name() == name)
                .ok_or_else(|| KernelError::UnknownBackend(name.to_string()))?;
            selected.push(self.backends.remove(idx));
        }
        Ok(Self { backends: selected })
    }

    pub fn get(&self, name: &str) -> Option<&dyn AttentionBackend> {
        self.backends.iter().find(|b| b.name() == name).map(|b| b.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn AttentionBackend> {
        self.backends.iter().map(|b| b.as_ref())
    }

    pub fn descriptors(&self) -> Vec<&'static BackendDescriptor> {
        self.iter().map(|b| b.descriptor()).collect()
    }

    /// Names of backends that can actually run.
    pub fn list_available(&self) -> Vec<&'static str> {
        self.iter().filter(|b| b.is_available()).map(|b| b.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
