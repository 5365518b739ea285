//! Precision and throughput sweeps

use anyhow::{Context, Result};
use attnbench_common::BenchConfig;
use attnbench_device_probe::{
    CapabilitySnapshot, DeviceKind, GpuCapabilities, collect_environment, select_device,
};
use attnbench_harness::{
    CellOutcome, MonotonicClock, QuantErrorRow, ReportMetric, RunSummary, SweepController,
    SweepPlan, SweepReport, TeeLog, TimingProtocol, export_json, generate, render_quant_errors,
    render_table,
};
use attnbench_kernels::BackendRegistry;
use candle_core::{DType, Device};
use tracing::{info, warn};

/// Which report a sweep produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchMode {
    /// Latency of every precision at one long sequence.
    Precision,
    /// TFLOPS over causal modes and sequence lengths.
    Throughput,
}

impl BenchMode {
    pub fn name(self) -> &'static str {
        match self {
            BenchMode::Precision => "precision",
            BenchMode::Throughput => "throughput",
        }
    }

    /// Defaults used when no config file is given.
    pub fn preset(self) -> BenchConfig {
        match self {
            BenchMode::Precision => BenchConfig::precision_preset(),
            BenchMode::Throughput => BenchConfig::throughput_preset(),
        }
    }

    fn title(self) -> &'static str {
        match self {
            BenchMode::Precision => "--- Attention Speed Benchmark ---",
            BenchMode::Throughput => "--- Attention Throughput Benchmark ---",
        }
    }

    fn metrics(self) -> &'static [ReportMetric] {
        match self {
            BenchMode::Precision => &[ReportMetric::LatencyMs],
            BenchMode::Throughput => &[ReportMetric::Tflops, ReportMetric::LatencyMs],
        }
    }
}

fn summary_heading(metric: ReportMetric) -> &'static str {
    match metric {
        ReportMetric::LatencyMs => "--- Summary (ms/iter) ---",
        ReportMetric::Tflops => "--- Summary (TFLOPS) ---",
    }
}

/// Run one sweep and print its report through `tee`.
///
/// Errors returned from here are setup failures (backend selection, device
/// selection, timing configuration); nothing inside the sweep itself can
/// fail the run.
pub fn run_sweep(
    mode: BenchMode,
    cfg: &BenchConfig,
    gpu: GpuCapabilities,
    report_quant_error: bool,
    tee: &mut TeeLog,
) -> Result<SweepReport> {
    let registry = BackendRegistry::new()
        .select(&cfg.sweep.backends)
        .context("invalid backend selection")?;
    let timing = TimingProtocol::new(cfg.timing.warmup, cfg.timing.runs)
        .context("invalid timing configuration")?;
    let first_len =
        cfg.workload.seq_lens.first().copied().context("no sequence lengths configured")?;
    let shape = cfg.workload_spec(first_len)?;

    tee.line(mode.title());
    let env = collect_environment(gpu.clone())
        .with_backends(registry.list_available().into_iter().map(String::from));
    for line in env.lines() {
        tee.line(line);
    }

    let device = select_device(cfg.sweep.device, &gpu)
        .with_context(|| format!("cannot run on requested device `{}`", cfg.sweep.device))?;
    let caps = CapabilitySnapshot::detect(&device, &gpu);
    info!(capabilities = %caps.summary(), "capability snapshot");

    tee.line(format!("Device: {}", DeviceKind::from(&device)));
    if let Some((major, minor)) = caps.compute_capability {
        tee.line(format!("GPU Compute Capability: ({major}, {minor})"));
    }
    tee.line(format!("Native float8_e4m3fn available: {}", caps.native_fp8_e4m3));
    tee.line(format!("Native float8_e5m2 available: {}", caps.native_fp8_e5m2));
    let lens: Vec<String> = cfg.workload.seq_lens.iter().map(ToString::to_string).collect();
    tee.line(format!(
        "Tensor Shape: B={}, H={}, L={}, D={}",
        shape.batch,
        shape.heads,
        lens.join("/"),
        shape.head_dim
    ));
    tee.line(format!("Warmup: {}, Runs: {}", timing.warmup, timing.runs));
    tee.line("");

    if report_quant_error {
        print_quant_errors(cfg, first_len, tee);
    }

    let clock = MonotonicClock::new();
    let plan = SweepPlan {
        precisions: cfg.sweep.precisions.clone(),
        causal_modes: cfg.sweep.causal.clone(),
    };
    let controller = SweepController::new(&registry, &caps, timing, &device, &clock, plan);
    let report =
        controller.run_lengths(shape, &cfg.workload.seq_lens, cfg.workload.seed, &device);

    for &metric in mode.metrics() {
        tee.line(format!("\n{}", summary_heading(metric)));
        tee.line(render_table(&report, metric).trim_end());
    }
    tee.line(
        "\nNote: 'N/A' means the combination cannot run here; \
         'ERR' means it was attempted and failed.",
    );

    let failures: Vec<_> = report
        .cells
        .iter()
        .filter_map(|c| match &c.outcome {
            CellOutcome::Failed { cause } => Some((c, cause)),
            _ => None,
        })
        .collect();
    if !failures.is_empty() {
        tee.line("Failures:");
        for (cell, cause) in failures {
            tee.line(format!(
                "  {} {} causal={} L={}: {cause}",
                cell.backend, cell.precision, cell.causal, cell.seq_len
            ));
        }
    }

    if let Some(path) = &cfg.output.json {
        let summary = RunSummary {
            mode: mode.name(),
            device: DeviceKind::from(&device).to_string(),
            batch: shape.batch,
            heads: shape.heads,
            head_dim: shape.head_dim,
            seed: cfg.workload.seed,
            warmup: timing.warmup,
            runs: timing.runs,
            columns: &report.columns,
            cells: &report.cells,
        };
        match export_json(&summary, path) {
            Ok(()) => tee.line(format!("Results written to {}", path.display())),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "JSON export failed");
                tee.line(format!("Error writing JSON results to {}: {e}", path.display()));
            }
        }
    }

    Ok(report)
}

/// Round-trip error of the simulated precisions on the first workload.
fn print_quant_errors(cfg: &BenchConfig, seq_len: usize, tee: &mut TeeLog) {
    let rows = cfg
        .workload_spec(seq_len)
        .map_err(anyhow::Error::from)
        .and_then(|spec| Ok(generate(spec, DType::F32, cfg.workload.seed, &Device::Cpu)?))
        .and_then(|base| {
            let mut rows: Vec<QuantErrorRow> = Vec::new();
            for &precision in cfg.sweep.precisions.iter().filter(|p| p.is_simulated()) {
                rows.extend(base.quant_error(precision)?);
            }
            Ok(rows)
        });
    match rows {
        Ok(rows) if rows.is_empty() => {}
        Ok(rows) => {
            tee.line("--- Fake quantization error ---");
            tee.line(render_quant_errors(&rows).trim_end());
            tee.line("");
        }
        Err(e) => {
            warn!(error = %e, "quantization error report failed");
            tee.line(format!("Quantization error report unavailable: {e}"));
        }
    }
}
