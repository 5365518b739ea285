//! Common types shared across the attnbench workspace
//!
//! This crate provides the foundational types used by every other crate:
//! the workload shape, the precision modes swept by the harness, and the
//! benchmark configuration with its TOML and environment loading.

pub mod config;
pub mod precision;
pub mod workload;

pub use config::{
    BenchConfig, ConfigError, DeviceRequest, OutputConfig, SweepConfig, TimingConfig,
    WorkloadConfig,
};
pub use precision::PrecisionMode;
pub use workload::{WorkloadError, WorkloadSpec};
