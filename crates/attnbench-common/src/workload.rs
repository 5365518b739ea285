//! Attention workload shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape of one benchmark workload.
///
/// Query, key and value all share `[batch, heads, seq_len, head_dim]`.
/// A single spec is used for every cell of a sweep run so timings stay
/// comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub batch: usize,
    pub heads: usize,
    pub seq_len: usize,
    pub head_dim: usize,
}

/// Invalid workload shapes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkloadError {
    #[error("workload dimension `{name}` must be > 0")]
    ZeroDimension { name: &'static str },
    #[error("workload of {batch}x{heads}x{seq_len}x{head_dim} overflows usize")]
    Overflow { batch: usize, heads: usize, seq_len: usize, head_dim: usize },
}

impl WorkloadSpec {
    pub fn new(
        batch: usize,
        heads: usize,
        seq_len: usize,
        head_dim: usize,
    ) -> Result<Self, WorkloadError> {
        let spec = Self { batch, heads, seq_len, head_dim };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), WorkloadError> {
        for (name, value) in [
            ("batch", self.batch),
            ("heads", self.heads),
            ("seq_len", self.seq_len),
            ("head_dim", self.head_dim),
        ] {
            if value == 0 {
                return Err(WorkloadError::ZeroDimension { name });
            }
        }
        self.batch
            .checked_mul(self.heads)
            .and_then(|n| n.checked_mul(self.seq_len))
            .and_then(|n| n.checked_mul(self.head_dim))
            .ok_or(WorkloadError::Overflow {
                batch: self.batch,
                heads: self.heads,
                seq_len: self.seq_len,
                head_dim: self.head_dim,
            })?;
        Ok(())
    }

    /// `(batch, heads, seq_len, head_dim)`.
    pub const fn shape(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.heads, self.seq_len, self.head_dim)
    }

    /// Elements in one of the q/k/v tensors.
    pub const fn numel(&self) -> usize {
        self.batch * self.heads * self.seq_len * self.head_dim
    }

    /// Same spec with a different sequence length.
    #[must_use]
    pub const fn with_seq_len(self, seq_len: usize) -> Self {
        Self { seq_len, ..self }
    }

    /// Floating-point operations of one attention forward pass.
    ///
    /// `2 * batch * heads * seq_len^2 * head_dim`, halved when causal.
    pub const fn attention_flops(&self, causal: bool) -> u64 {
        let flops = 2
            * self.batch as u64
            * self.heads as u64
            * self.seq_len as u64
            * self.seq_len as u64
            * self.head_dim as u64;
        if causal { flops / 2 } else { flops }
    }
}

impl std::fmt::Display for WorkloadSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "B={}, H={}, L={}, D={}", self.batch, self.heads, self.seq_len, self.head_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_dimensions() {
        let err = WorkloadSpec::new(4, 0, 128, 64).unwrap_err();
        assert_eq!(err, WorkloadError::ZeroDimension { name: "heads" });
    }

    #[test]
    fn flops_match_reference_formula() {
        let spec = WorkloadSpec::new(4, 32, 1024, 128).unwrap();
        assert_eq!(spec.attention_flops(false), 2 * 4 * 32 * 1024 * 1024 * 128);
        assert_eq!(spec.attention_flops(true), 4 * 32 * 1024 * 1024 * 128);
    }

    #[test]
    fn display_uses_short_names() {
        let spec = WorkloadSpec::new(4, 8, 2048, 64).unwrap();
        assert_eq!(spec.to_string(), "B=4, H=8, L=2048, D=64");
    }

    #[test]
    fn with_seq_len_keeps_other_dims() {
        let spec = WorkloadSpec::new(2, 4, 16, 8).unwrap().with_seq_len(32);
        assert_eq!(spec.shape(), (2, 4, 32, 8));
        assert_eq!(spec.numel(), 2 * 4 * 32 * 8);
    }

    #[test]
    fn overflow_is_reported() {
        let spec = WorkloadSpec { batch: usize::MAX, heads: 2, seq_len: 1, head_dim: 1 };
        assert!(matches!(spec.validate(), Err(WorkloadError::Overflow { .. })));
    }
}
