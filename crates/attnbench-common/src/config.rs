//! Benchmark configuration file format.
//!
//! Loads [`BenchConfig`] from a TOML file with environment variable
//! overrides via `ATTNBENCH_*` prefixed variables. The configuration is
//! read once at startup and is not reloadable mid-run.

use crate::precision::PrecisionMode;
use crate::workload::{WorkloadError, WorkloadSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which compute device the harness should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRequest {
    /// CUDA when present, CPU otherwise.
    Auto,
    Cpu,
    /// Require CUDA; refusing to run is a fatal setup failure.
    Cuda,
}

impl std::fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

impl std::str::FromStr for DeviceRequest {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(format!("unknown device: {other}")),
        }
    }
}

/// Workload shape, minus the sequence length which is swept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub batch: usize,
    pub heads: usize,
    pub head_dim: usize,
    /// Each length is its own sweep run with freshly generated inputs.
    pub seq_lens: Vec<usize>,
    /// Seed for the q/k/v generator.
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self { batch: 4, heads: 8, head_dim: 64, seq_lens: vec![2048], seed: 0 }
    }
}

/// Warmup/measurement iteration counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub warmup: usize,
    pub runs: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { warmup: 5, runs: 50 }
    }
}

/// Which cells the sweep visits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub device: DeviceRequest,
    pub precisions: Vec<PrecisionMode>,
    pub causal: Vec<bool>,
    /// Backend names; empty means every registered backend.
    pub backends: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            device: DeviceRequest::Auto,
            precisions: PrecisionMode::ALL.to_vec(),
            causal: vec![false],
            backends: Vec::new(),
        }
    }
}

/// Where the report goes besides stdout.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Plain-text copy of everything printed, opened once per run.
    pub log_file: Option<PathBuf>,
    /// JSON dump of the result cells.
    pub json: Option<PathBuf>,
}

/// Full benchmark configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub workload: WorkloadConfig,
    pub timing: TimingConfig,
    pub sweep: SweepConfig,
    pub output: OutputConfig,
}

/// Errors that can occur when loading or validating a [`BenchConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid workload: {0}")]
    Workload(#[from] WorkloadError),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl BenchConfig {
    /// Dtype sweep over every precision at a single long sequence.
    pub fn precision_preset() -> Self {
        Self::default()
    }

    /// Causal x sequence-length throughput sweep in `float16`.
    pub fn throughput_preset() -> Self {
        Self {
            workload: WorkloadConfig {
                batch: 4,
                heads: 32,
                head_dim: 128,
                seq_lens: vec![1024, 2048],
                seed: 0,
            },
            timing: TimingConfig { warmup: 20, runs: 100 },
            sweep: SweepConfig {
                device: DeviceRequest::Auto,
                precisions: vec![PrecisionMode::F16],
                causal: vec![false, true],
                backends: vec!["quantized".to_string(), "sdpa".to_string()],
            },
            output: OutputConfig::default(),
        }
    }

    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loaded benchmark config");
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let cfg: BenchConfig = toml::from_str(toml_str)?;
        cfg.finish()
    }

    /// Start from `base`, apply env overrides and validate.
    pub fn from_env_with(base: Self) -> Result<Self, ConfigError> {
        base.finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        self.apply_env_overrides()?;
        self.validate()?;
        Ok(self)
    }

    /// Workload spec for one sequence length of the sweep.
    pub fn workload_spec(&self, seq_len: usize) -> Result<WorkloadSpec, ConfigError> {
        Ok(WorkloadSpec::new(
            self.workload.batch,
            self.workload.heads,
            seq_len,
            self.workload.head_dim,
        )?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workload.seq_lens.is_empty() {
            return Err(ConfigError::Validation("seq_lens must not be empty".into()));
        }
        for &seq_len in &self.workload.seq_lens {
            self.workload_spec(seq_len)?;
        }
        if self.timing.runs == 0 {
            return Err(ConfigError::Validation("timing.runs must be > 0".into()));
        }
        if self.sweep.precisions.is_empty() {
            return Err(ConfigError::Validation("sweep.precisions must not be empty".into()));
        }
        if self.sweep.causal.is_empty() {
            return Err(ConfigError::Validation("sweep.causal must not be empty".into()));
        }
        if self.sweep.backends.iter().any(|name| name.trim().is_empty()) {
            return Err(ConfigError::Validation("backend names must not be empty".into()));
        }
        Ok(())
    }

    /// Apply `ATTNBENCH_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<usize>("ATTNBENCH_BATCH")? {
            self.workload.batch = v;
        }
        if let Some(v) = env_parse::<usize>("ATTNBENCH_HEADS")? {
            self.workload.heads = v;
        }
        if let Some(v) = env_parse::<usize>("ATTNBENCH_HEAD_DIM")? {
            self.workload.head_dim = v;
        }
        if let Some(v) = env_list::<usize>("ATTNBENCH_SEQ_LENS")? {
            self.workload.seq_lens = v;
        }
        if let Some(v) = env_parse::<u64>("ATTNBENCH_SEED")? {
            self.workload.seed = v;
        }
        if let Some(v) = env_parse::<usize>("ATTNBENCH_WARMUP")? {
            self.timing.warmup = v;
        }
        if let Some(v) = env_parse::<usize>("ATTNBENCH_RUNS")? {
            self.timing.runs = v;
        }
        if let Some(v) = env_parse::<DeviceRequest>("ATTNBENCH_DEVICE")? {
            self.sweep.device = v;
        }
        if let Some(v) = env_list::<PrecisionMode>("ATTNBENCH_PRECISIONS")? {
            self.sweep.precisions = v;
        }
        if let Some(v) = env_list::<bool>("ATTNBENCH_CAUSAL")? {
            self.sweep.causal = v;
        }
        if let Some(v) = env_list::<String>("ATTNBENCH_BACKENDS")? {
            self.sweep.backends = v;
        }
        if let Ok(val) = std::env::var("ATTNBENCH_LOG_FILE") {
            self.output.log_file = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(val) = std::env::var(key) else {
        return Ok(None);
    };
    val.trim().parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
        key: key.into(),
        value: val.clone(),
        reason: e.to_string(),
    })
}

fn env_list<T>(key: &str) -> Result<Option<Vec<T>>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Ok(val) = std::env::var(key) else {
        return Ok(None);
    };
    val.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<T>().map_err(|e| ConfigError::EnvOverride {
                key: key.into(),
                value: val.clone(),
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
