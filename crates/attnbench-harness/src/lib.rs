//! Benchmark harness for attnbench
//!
//! Ties the pieces of a run together:
//!
//! - [`workload`]: seeded q/k/v generation and per-precision transforms
//! - [`timing`]: the warmup, barrier, timed runs, barrier protocol
//! - [`sweep`]: the backend x precision x causal cross product with
//!   per-cell failure isolation
//! - [`report`]: grid tables, tee logging and JSON export

pub mod error;
pub mod report;
pub mod sweep;
pub mod timing;
pub mod workload;

pub use error::{HarnessError, Result};
pub use report::{
    ReportMetric, RunSummary, TeeLog, export_json, render_quant_errors, render_table,
};
pub use sweep::{
    BackendColumn, CellOutcome, ResultCell, SweepController, SweepPhase, SweepPlan, SweepReport,
};
pub use timing::{
    Clock, DeviceSync, Measurement, MonotonicClock, TimingProtocol, attention_flops, tflops,
};
pub use workload::{BaseTensors, QuantErrorRow, generate};
