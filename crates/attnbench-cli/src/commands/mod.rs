//! Subcommand implementations

pub mod bench;
pub mod info;

use anyhow::{Context, Result};
use attnbench_common::{BenchConfig, DeviceRequest, PrecisionMode};
use clap::Args;
use std::path::{Path, PathBuf};

pub use bench::{BenchMode, run_sweep};
pub use info::show_system_info;

/// Flags shared by the sweep subcommands. Each one overrides the value from
/// the config file and the environment.
#[derive(Args, Debug, Clone, Default)]
pub struct SweepArgs {
    /// Sequence lengths, one sweep run each
    #[arg(long, value_delimiter = ',', value_name = "L,...")]
    pub seq_lens: Option<Vec<usize>>,

    /// Batch size
    #[arg(long, value_name = "B")]
    pub batch: Option<usize>,

    /// Number of attention heads
    #[arg(long, value_name = "H")]
    pub heads: Option<usize>,

    /// Head dimension
    #[arg(long, value_name = "D")]
    pub head_dim: Option<usize>,

    /// Seed for the q/k/v generator
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Untimed warmup calls per cell
    #[arg(long, value_name = "N")]
    pub warmup: Option<usize>,

    /// Timed calls per cell
    #[arg(long, value_name = "N")]
    pub runs: Option<usize>,

    /// Backends to sweep, in column order (sdpa, mem_efficient, flash, quantized)
    #[arg(long, value_delimiter = ',', value_name = "NAME,...")]
    pub backends: Option<Vec<String>>,

    /// Precisions to sweep (float32, float16, bfloat16, float8_e4m3fn, ...)
    #[arg(long, value_delimiter = ',', value_name = "DTYPE,...")]
    pub precisions: Option<Vec<PrecisionMode>>,

    /// Causal modes to sweep, e.g. `false,true`
    #[arg(long, value_delimiter = ',', value_name = "BOOL,...")]
    pub causal: Option<Vec<bool>>,

    /// Plain-text copy of the console output
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Write the result cells as JSON
    #[arg(long, value_name = "PATH")]
    pub json: Option<PathBuf>,

    /// Print fake-quantization error of q/k/v for each simulated precision
    #[arg(long)]
    pub report_quant_error: bool,
}

impl SweepArgs {
    /// Apply the flags that were given on top of `cfg`.
    pub fn apply(&self, cfg: &mut BenchConfig) {
        if let Some(v) = &self.seq_lens {
            cfg.workload.seq_lens = v.clone();
        }
        if let Some(v) = self.batch {
            cfg.workload.batch = v;
        }
        if let Some(v) = self.heads {
            cfg.workload.heads = v;
        }
        if let Some(v) = self.head_dim {
            cfg.workload.head_dim = v;
        }
        if let Some(v) = self.seed {
            cfg.workload.seed = v;
        }
        if let Some(v) = self.warmup {
            cfg.timing.warmup = v;
        }
        if let Some(v) = self.runs {
            cfg.timing.runs = v;
        }
        if let Some(v) = &self.backends {
            cfg.sweep.backends = v.clone();
        }
        if let Some(v) = &self.precisions {
            cfg.sweep.precisions = v.clone();
        }
        if let Some(v) = &self.causal {
            cfg.sweep.causal = v.clone();
        }
        if let Some(v) = &self.log_file {
            cfg.output.log_file = Some(v.clone());
        }
        if let Some(v) = &self.json {
            cfg.output.json = Some(v.clone());
        }
    }
}

/// Resolve the configuration of one run.
///
/// Precedence, lowest first: the mode's preset (or the config file when one
/// is given), `ATTNBENCH_*` environment variables, then command-line flags.
pub fn load_configuration(
    path: Option<&Path>,
    mode: BenchMode,
    device: Option<DeviceRequest>,
    args: &SweepArgs,
) -> Result<BenchConfig> {
    let mut cfg = match path {
        Some(path) => BenchConfig::load(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?,
        None => BenchConfig::from_env_with(mode.preset())
            .context("invalid ATTNBENCH_* environment override")?,
    };
    if let Some(device) = device {
        cfg.sweep.device = device;
    }
    args.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}
