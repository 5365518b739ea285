//! Harness error types

use attnbench_common::{PrecisionMode, WorkloadError};
use attnbench_kernels::KernelError;
use attnbench_quantization::QuantizationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("workload error: {0}")]
    Workload(#[from] WorkloadError),
    #[error("quantization error: {0}")]
    Quantization(#[from] QuantizationError),
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("{0} has no tensor representation")]
    UnsupportedPrecision(PrecisionMode),
    #[error("timing requires at least one measured run")]
    ZeroRuns,
    #[error("device synchronization failed: {0}")]
    Sync(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
