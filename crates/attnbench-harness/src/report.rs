//! Report formatting and output.
//!
//! One grid row per setting, one metric column per backend. Cells show the
//! formatted metric, `N/A` when the combination was not applicable and
//! `ERR` when it was attempted and failed.

use crate::Result;
use crate::sweep::{CellOutcome, ResultCell, SweepReport};
use crate::workload::QuantErrorRow;
use attnbench_common::PrecisionMode;
use prettytable::{Cell, Row, Table};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const NOT_APPLICABLE: &str = "N/A";
pub const FAILED: &str = "ERR";

/// Metric shown in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMetric {
    /// Mean milliseconds per call, two decimals.
    LatencyMs,
    /// Achieved TFLOPS, three decimals.
    Tflops,
}

impl ReportMetric {
    fn row_header(self) -> &'static str {
        match self {
            ReportMetric::LatencyMs => "Dtype",
            ReportMetric::Tflops => "Setting",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            ReportMetric::LatencyMs => "ms",
            ReportMetric::Tflops => "TFLOPS",
        }
    }

    fn format(self, outcome: &CellOutcome) -> String {
        match (self, outcome) {
            (ReportMetric::LatencyMs, CellOutcome::Measured { mean_ms, .. }) => {
                format!("{mean_ms:.2}")
            }
            (ReportMetric::Tflops, CellOutcome::Measured { tflops, .. }) => format!("{tflops:.3}"),
            (_, CellOutcome::NotApplicable { .. }) => NOT_APPLICABLE.to_string(),
            (_, CellOutcome::Failed { .. }) => FAILED.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RowKey {
    causal: bool,
    seq_len: usize,
    precision: PrecisionMode,
}

impl RowKey {
    fn of(cell: &ResultCell) -> Self {
        Self { causal: cell.causal, seq_len: cell.seq_len, precision: cell.precision }
    }
}

/// Rows in causal-major, then sequence length, then precision order.
fn row_keys(report: &SweepReport) -> Vec<RowKey> {
    let mut keys: Vec<RowKey> = Vec::new();
    let mut causal_order: Vec<bool> = Vec::new();
    let mut seq_order: Vec<usize> = Vec::new();
    for cell in &report.cells {
        let key = RowKey::of(cell);
        if !keys.contains(&key) {
            keys.push(key);
        }
        if !causal_order.contains(&cell.causal) {
            causal_order.push(cell.causal);
        }
        if !seq_order.contains(&cell.seq_len) {
            seq_order.push(cell.seq_len);
        }
    }
    let rank = |k: &RowKey| {
        (
            causal_order.iter().position(|&c| c == k.causal),
            seq_order.iter().position(|&s| s == k.seq_len),
        )
    };
    keys.sort_by_key(rank);
    keys
}

fn row_label(
    key: &RowKey,
    metric: ReportMetric,
    show_setting: bool,
    show_precision: bool,
) -> String {
    let causal = if key.causal { "True" } else { "False" };
    let setting = format!("Causal={causal} Seq={}", key.seq_len);
    match metric {
        ReportMetric::LatencyMs if show_setting => format!("{} {setting}", key.precision),
        ReportMetric::LatencyMs => key.precision.to_string(),
        ReportMetric::Tflops if show_precision => format!("{setting} {}", key.precision),
        ReportMetric::Tflops => setting,
    }
}

/// Render the report as a grid table.
pub fn render_table(report: &SweepReport, metric: ReportMetric) -> String {
    let keys = row_keys(report);
    let distinct = |f: fn(&RowKey) -> u64| {
        let mut seen: Vec<u64> = keys.iter().map(f).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len() > 1
    };
    let show_setting = distinct(|k| u64::from(k.causal)) || distinct(|k| k.seq_len as u64);
    let show_precision = distinct(|k| k.precision as u64);

    let mut table = Table::new();
    let mut header = vec![Cell::new(metric.row_header())];
    header.extend(
        report.columns.iter().map(|c| Cell::new(&format!("{} ({})", c.label, metric.unit()))),
    );
    table.set_titles(Row::new(header));

    for key in &keys {
        let mut row = vec![Cell::new(&row_label(key, metric, show_setting, show_precision))];
        for column in &report.columns {
            let text = report
                .cells
                .iter()
                .find(|c| c.backend == column.name && RowKey::of(c) == *key)
                .map(|c| metric.format(&c.outcome))
                .unwrap_or_else(|| NOT_APPLICABLE.to_string());
            row.push(Cell::new(&text));
        }
        table.add_row(Row::new(row));
    }

    table.to_string()
}

/// Render fake-quantization error metrics.
pub fn render_quant_errors(rows: &[QuantErrorRow]) -> String {
    let mut table = Table::new();
    let titles = ["Dtype", "Tensor", "Scale", "MSE", "SNR (dB)", "Max abs err"];
    table.set_titles(Row::new(titles.iter().map(|h| Cell::new(h)).collect()));
    for r in rows {
        table.add_row(Row::new(vec![
            Cell::new(r.precision.label()),
            Cell::new(r.tensor),
            Cell::new(&format!("{:.6}", r.report.scale)),
            Cell::new(&format!("{:.3e}", r.report.mse)),
            Cell::new(&format!("{:.2}", r.report.snr_db)),
            Cell::new(&format!("{:.6}", r.report.max_abs_error)),
        ]));
    }
    table.to_string()
}

/// Run metadata written alongside the cells in the JSON export.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub mode: &'a str,
    pub device: String,
    pub batch: usize,
    pub heads: usize,
    pub head_dim: usize,
    pub seed: u64,
    pub warmup: usize,
    pub runs: usize,
    pub columns: &'a [crate::sweep::BackendColumn],
    pub cells: &'a [ResultCell],
}

/// Write `summary` as pretty-printed JSON.
pub fn export_json(summary: &RunSummary<'_>, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), summary)?;
    tracing::info!(path = %path.display(), cells = summary.cells.len(), "wrote JSON results");
    Ok(())
}

/// Writes every line to the console and, when open, a plain-text log file.
///
/// The file is opened once up front and flushed after every line. Failing
/// to open or write it is reported once and never stops the run.
pub struct TeeLog {
    out: Box<dyn Write + Send>,
    file: Option<File>,
    path: Option<PathBuf>,
    write_error_reported: bool,
}

impl TeeLog {
    /// Tee to stdout.
    pub fn new(log_file: Option<&Path>) -> Self {
        Self::with_writer(std::io::stdout(), log_file)
    }

    pub fn with_writer(out: impl Write + Send + 'static, log_file: Option<&Path>) -> Self {
        let mut tee =
            Self { out: Box::new(out), file: None, path: None, write_error_reported: false };
        if let Some(path) = log_file {
            match File::create(path) {
                Ok(file) => {
                    tee.file = Some(file);
                    tee.path = Some(path.to_path_buf());
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to open log file");
                    tee.console(&format!("ERROR: Failed to open log file {}: {e}", path.display()));
                }
            }
        }
        tee
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn console(&mut self, msg: &str) {
        let _ = writeln!(self.out, "{msg}");
        let _ = self.out.flush();
    }

    /// Print `msg` and append it to the log file.
    pub fn line(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        self.console(msg);
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{msg}").and_then(|()| file.flush()) {
            if !self.write_error_reported {
                self.write_error_reported = true;
                tracing::warn!(error = %e, "log file write failed");
                self.console(&format!("Error writing to log file: {e}"));
            }
        }
    }
}

impl Drop for TeeLog {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}
