//! attnbench CLI application
//!
//! Benchmarks attention backends across precision modes, causal modes and
//! sequence lengths, and prints the results as grid tables.

use anyhow::{Context, Result};
use attnbench_cli::commands::{
    BenchMode, SweepArgs, load_configuration, run_sweep, show_system_info,
};
use attnbench_common::DeviceRequest;
use attnbench_device_probe::probe_gpu;
use attnbench_harness::TeeLog;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use console::style;
use std::path::{Path, PathBuf};
use tracing::error;

/// attnbench - attention backend benchmark harness
#[derive(Parser)]
#[command(name = "attnbench")]
#[command(about = "Attention backend benchmark harness")]
#[command(long_about = r#"
attnbench times scaled-dot-product attention backends over a grid of
precision modes, causal modes and sequence lengths. Combinations a backend
or device cannot run show up as N/A; combinations that fail show up as ERR.

Examples:
  # Latency of every precision mode at L=2048
  attnbench precision

  # TFLOPS of the quantized and SDPA backends, causal and not
  attnbench throughput --seq-lens 1024,2048,4096

  # Keep a plain-text copy of the output
  attnbench precision --log-file bench_results.txt

  # Host, GPU and backend information
  attnbench info
"#)]
#[command(version)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Device to use (cpu, cuda, auto)
    #[arg(short, long, value_name = "DEVICE", global = true)]
    device: Option<DeviceRequest>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Latency of every precision mode across the backends
    #[command(alias = "dtype")]
    Precision(SweepArgs),

    /// Throughput across causal modes and sequence lengths
    #[command(alias = "tflops")]
    Throughput(SweepArgs),

    /// Show host, GPU and backend information
    Info,

    /// Print the effective configuration as TOML
    Config {
        /// Show the throughput defaults instead of the precision defaults
        #[arg(long)]
        throughput: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli.log_level, cli.log_format) {
        eprintln!("{} {e:#}", style("WARNING:").yellow().bold());
    }

    // Setup failures are reported, never turned into a failing exit status.
    if let Err(e) = run(cli) {
        error!("Command failed: {}", e);
        eprintln!("{} {e}", style("ERROR:").red().bold());
        for cause in e.chain().skip(1) {
            eprintln!("  Caused by: {cause}");
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let Cli { config, device, command, .. } = cli;
    match command {
        Some(Commands::Precision(args)) => {
            bench(BenchMode::Precision, config.as_deref(), device, &args)
        }
        Some(Commands::Throughput(args)) => {
            bench(BenchMode::Throughput, config.as_deref(), device, &args)
        }
        Some(Commands::Info) => show_system_info(probe_gpu()),
        Some(Commands::Config { throughput }) => {
            let mode = if throughput { BenchMode::Throughput } else { BenchMode::Precision };
            let cfg = load_configuration(config.as_deref(), mode, device, &SweepArgs::default())?;
            let text = toml::to_string_pretty(&cfg).context("Failed to serialize configuration")?;
            print!("{text}");
            Ok(())
        }
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

fn bench(
    mode: BenchMode,
    config: Option<&Path>,
    device: Option<DeviceRequest>,
    args: &SweepArgs,
) -> Result<()> {
    let cfg = load_configuration(config, mode, device, args)?;
    let mut tee = TeeLog::new(cfg.output.log_file.as_deref());
    if let Err(e) = run_sweep(mode, &cfg, probe_gpu(), args.report_quant_error, &mut tee) {
        error!(error = %e, "setup failed, sweep not run");
        tee.line(format!("ERROR: {e:#}"));
    }
    Ok(())
}

/// Setup logging; diagnostics go to stderr so stdout carries only the report.
fn setup_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level `{level}`"))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Json => {
            subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).try_init()
        }
        LogFormat::Compact => subscriber.compact().try_init(),
        LogFormat::Pretty => subscriber.pretty().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!(e))
}
