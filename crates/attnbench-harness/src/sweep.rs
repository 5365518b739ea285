//! Sweep controller
//!
//! Visits every (causal mode, precision, backend) cell of a run in a fixed
//! order. A cell is checked against the capability snapshot and the
//! backend descriptor first; only applicable cells are transformed and
//! timed. Whatever happens inside one cell, including a panic, is recorded
//! in that cell and the sweep moves on.

use crate::timing::{Clock, DeviceSync, TimingProtocol, attention_flops, tflops};
use crate::workload::{BaseTensors, generate};
use attnbench_common::{PrecisionMode, WorkloadSpec};
use attnbench_device_probe::CapabilitySnapshot;
use attnbench_kernels::{AttentionBackend, AttentionOptions, BackendRegistry};
use candle_core::{DType, Device};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Which precisions and causal modes a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub precisions: Vec<PrecisionMode>,
    pub causal_modes: Vec<bool>,
}

impl Default for SweepPlan {
    fn default() -> Self {
        Self { precisions: PrecisionMode::ALL.to_vec(), causal_modes: vec![false] }
    }
}

/// What happened in one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CellOutcome {
    Measured { mean_ms: f64, tflops: f64 },
    /// Skipped before any work: the combination cannot run here.
    NotApplicable { reason: String },
    /// The cell was attempted and failed.
    Failed { cause: String },
}

impl CellOutcome {
    pub fn is_measured(&self) -> bool {
        matches!(self, CellOutcome::Measured { .. })
    }
}

/// One (backend, precision, causal, seq_len) result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultCell {
    pub backend: &'static str,
    pub precision: PrecisionMode,
    pub causal: bool,
    pub seq_len: usize,
    pub outcome: CellOutcome,
}

/// Report column, one per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendColumn {
    pub name: &'static str,
    pub label: &'static str,
}

/// Cells of one or more sweep runs, in visiting order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub columns: Vec<BackendColumn>,
    pub cells: Vec<ResultCell>,
}

impl SweepReport {
    /// Append another run's cells; columns are taken from the first run.
    pub fn extend(&mut self, other: SweepReport) {
        if self.columns.is_empty() {
            self.columns = other.columns;
        }
        self.cells.extend(other.cells);
    }

    pub fn cell(
        &self,
        backend: &str,
        precision: PrecisionMode,
        causal: bool,
        seq_len: usize,
    ) -> Option<&ResultCell> {
        self.cells.iter().find(|c| {
            c.backend == backend
                && c.precision == precision
                && c.causal == causal
                && c.seq_len == seq_len
        })
    }

    pub fn count(&self, pred: impl Fn(&CellOutcome) -> bool) -> usize {
        self.cells.iter().filter(|c| pred(&c.outcome)).count()
    }
}

/// Lifecycle of a run, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepPhase {
    Idle,
    GeneratingWorkload { seq_len: usize },
    /// Cell rejected before any tensor was touched.
    Skipped { backend: &'static str, precision: PrecisionMode, causal: bool },
    Measuring { backend: &'static str, precision: PrecisionMode, causal: bool },
    Done { cells: usize },
}

impl std::fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepPhase::Idle => write!(f, "idle"),
            SweepPhase::GeneratingWorkload { seq_len } => {
                write!(f, "generating workload (L={seq_len})")
            }
            SweepPhase::Skipped { backend, precision, causal } => {
                write!(f, "skipped {backend} {precision} causal={causal}")
            }
            SweepPhase::Measuring { backend, precision, causal } => {
                write!(f, "measuring {backend} {precision} causal={causal}")
            }
            SweepPhase::Done { cells } => write!(f, "done ({cells} cells)"),
        }
    }
}

/// Runs sweeps against a fixed registry, device and timing protocol.
pub struct SweepController<'a> {
    registry: &'a BackendRegistry,
    capabilities: &'a CapabilitySnapshot,
    timing: TimingProtocol,
    sync: &'a dyn DeviceSync,
    clock: &'a dyn Clock,
    plan: SweepPlan,
}

impl<'a> SweepController<'a> {
    pub fn new(
        registry: &'a BackendRegistry,
        capabilities: &'a CapabilitySnapshot,
        timing: TimingProtocol,
        sync: &'a dyn DeviceSync,
        clock: &'a dyn Clock,
        plan: SweepPlan,
    ) -> Self {
        Self { registry, capabilities, timing, sync, clock, plan }
    }

    fn columns(&self) -> Vec<BackendColumn> {
        self.registry
            .iter()
            .map(|b| {
                let d = b.descriptor();
                BackendColumn { name: d.name, label: d.label }
            })
            .collect()
    }

    /// Sweep every cell over one set of base tensors.
    ///
    /// Order: causal mode, then precision, then backend in registry order.
    pub fn run(&self, base: &BaseTensors) -> SweepReport {
        let mut cells = Vec::new();
        for &causal in &self.plan.causal_modes {
            for &precision in &self.plan.precisions {
                for backend in self.registry.iter() {
                    let outcome = self.run_cell(backend, base, precision, causal);
                    log_outcome(backend.name(), precision, causal, base.spec.seq_len, &outcome);
                    cells.push(ResultCell {
                        backend: backend.name(),
                        precision,
                        causal,
                        seq_len: base.spec.seq_len,
                        outcome,
                    });
                }
            }
        }
        let phase = SweepPhase::Done { cells: cells.len() };
        tracing::debug!(%phase);
        SweepReport { columns: self.columns(), cells }
    }

    /// One sweep run per sequence length, each with freshly generated inputs.
    ///
    /// A length whose inputs cannot be generated records every one of its
    /// cells as failed.
    pub fn run_lengths(
        &self,
        shape: WorkloadSpec,
        seq_lens: &[usize],
        seed: u64,
        device: &Device,
    ) -> SweepReport {
        let phase = SweepPhase::Idle;
        tracing::debug!(%phase);
        let mut report = SweepReport { columns: self.columns(), cells: Vec::new() };
        for &seq_len in seq_lens {
            let spec = shape.with_seq_len(seq_len);
            let phase = SweepPhase::GeneratingWorkload { seq_len };
            tracing::info!(%phase, %spec);
            match generate(spec, DType::F32, seed, device) {
                Ok(base) => report.extend(self.run(&base)),
                Err(e) => {
                    tracing::error!(seq_len, error = %e, "workload generation failed");
                    report.cells.extend(self.failed_cells(seq_len, &e.to_string()));
                }
            }
        }
        report
    }

    fn failed_cells(&self, seq_len: usize, cause: &str) -> Vec<ResultCell> {
        let mut cells = Vec::new();
        for &causal in &self.plan.causal_modes {
            for &precision in &self.plan.precisions {
                for backend in self.registry.iter() {
                    cells.push(ResultCell {
                        backend: backend.name(),
                        precision,
                        causal,
                        seq_len,
                        outcome: CellOutcome::Failed { cause: cause.to_string() },
                    });
                }
            }
        }
        cells
    }

    /// Decide applicability without touching any tensor.
    fn applicability(
        &self,
        backend: &dyn AttentionBackend,
        precision: PrecisionMode,
        options: &AttentionOptions,
    ) -> Option<String> {
        let desc = backend.descriptor();
        if !backend.is_available() {
            return Some(format!("{} is not available in this build", desc.label));
        }
        if let Some(reason) = self.capabilities.unsupported_reason(precision) {
            return Some(reason);
        }
        let Some(dtype) = precision.compute_dtype() else {
            return Some(format!("{precision} has no tensor representation"));
        };
        if !desc.accepts(dtype) {
            return Some(format!("{} does not accept {precision} ({dtype:?})", desc.label));
        }
        if !desc.supports(options) {
            return Some(format!("{} cannot express the requested masking", desc.label));
        }
        None
    }

    fn run_cell(
        &self,
        backend: &dyn AttentionBackend,
        base: &BaseTensors,
        precision: PrecisionMode,
        causal: bool,
    ) -> CellOutcome {
        let options = AttentionOptions::causal(causal);
        if let Some(reason) = self.applicability(backend, precision, &options) {
            let phase = SweepPhase::Skipped { backend: backend.name(), precision, causal };
            tracing::trace!(%phase);
            return CellOutcome::NotApplicable { reason };
        }
        let phase = SweepPhase::Measuring { backend: backend.name(), precision, causal };
        tracing::trace!(%phase);

        let attempt = catch_unwind(AssertUnwindSafe(|| -> crate::Result<f64> {
            let inputs = base.transform(precision)?;
            let m = self.timing.measure(self.sync, self.clock, || {
                backend.compute(&inputs.q, &inputs.k, &inputs.v, &options)?;
                Ok(())
            })?;
            Ok(m.mean_ms)
        }));

        match attempt {
            Ok(Ok(mean_ms)) => CellOutcome::Measured {
                mean_ms,
                tflops: tflops(attention_flops(&base.spec, causal), mean_ms),
            },
            Ok(Err(e)) => CellOutcome::Failed { cause: e.to_string() },
            Err(panic) => CellOutcome::Failed { cause: panic_message(panic.as_ref()) },
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

fn log_outcome(
    backend: &str,
    precision: PrecisionMode,
    causal: bool,
    seq_len: usize,
    outcome: &CellOutcome,
) {
    match outcome {
        CellOutcome::Measured { mean_ms, tflops } => {
            tracing::info!(backend, %precision, causal, seq_len, mean_ms, tflops, "measured");
        }
        CellOutcome::NotApplicable { reason } => {
            tracing::debug!(backend, %precision, causal, seq_len, %reason, "not applicable");
        }
        CellOutcome::Failed { cause } => {
            tracing::warn!(backend, %precision, causal, seq_len, %cause, "cell failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attnbench_device_probe::DeviceKind;
    use attnbench_kernels::{
        BackendDescriptor, KernelError, Layout, MaskSupport, SdpaBackend, UnavailableBackend,
    };
    use candle_core::Tensor;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    struct NoSync;
    impl DeviceSync for NoSync {
        fn synchronize(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct TickClock {
        ticks: Cell<u64>,
    }
    impl Clock for TickClock {
        fn now(&self) -> Duration {
            let t = self.ticks.get();
            self.ticks.set(t + 1);
            Duration::from_millis(t)
        }
    }

    static COUNTING: BackendDescriptor = BackendDescriptor {
        name: "counting",
        label: "Counting",
        layout: Layout::Bhld,
        dtypes: &[DType::F32],
        mask: MaskSupport::None,
    };

    /// Counts calls; never valid for anything but f32 non-causal.
    struct Counting(AtomicUsize);
    impl AttentionBackend for Counting {
        fn descriptor(&self) -> &'static BackendDescriptor {
            &COUNTING
        }
        fn forward(
            &self,
            q: &Tensor,
            _k: &Tensor,
            _v: &Tensor,
            _causal: bool,
            _mask: Option<&Tensor>,
        ) -> attnbench_kernels::Result<Tensor> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(q.clone())
        }
    }

    static FAILING: BackendDescriptor = BackendDescriptor {
        name: "failing",
        label: "Failing",
        layout: Layout::Bhld,
        dtypes: &[DType::F32, DType::F16, DType::BF16],
        mask: MaskSupport::Both,
    };

    struct Failing;
    impl AttentionBackend for Failing {
        fn descriptor(&self) -> &'static BackendDescriptor {
            &FAILING
        }
        fn forward(
            &self,
            _q: &Tensor,
            _k: &Tensor,
            _v: &Tensor,
            _causal: bool,
            _mask: Option<&Tensor>,
        ) -> attnbench_kernels::Result<Tensor> {
            Err(KernelError::Shape("always fails".into()))
        }
    }

    static PANICKING: BackendDescriptor = BackendDescriptor {
        name: "panicking",
        label: "Panicking",
        layout: Layout::Bhld,
        dtypes: &[DType::F32, DType::F16, DType::BF16],
        mask: MaskSupport::Both,
    };

    struct Panicking;
    impl AttentionBackend for Panicking {
        fn descriptor(&self) -> &'static BackendDescriptor {
            &PANICKING
        }
        fn forward(
            &self,
            _q: &Tensor,
            _k: &Tensor,
            _v: &Tensor,
            _causal: bool,
            _mask: Option<&Tensor>,
        ) -> attnbench_kernels::Result<Tensor> {
            panic!("kernel exploded")
        }
    }

    fn base(seq_len: usize) -> BaseTensors {
        generate(WorkloadSpec::new(1, 2, seq_len, 4).unwrap(), DType::F32, 0, &Device::Cpu).unwrap()
    }

    #[test]
    fn not_applicable_cells_are_never_timed() {
        let counting = std::sync::Arc::new(Counting(AtomicUsize::new(0)));
        struct Shared(std::sync::Arc<Counting>);
        impl AttentionBackend for Shared {
            fn descriptor(&self) -> &'static BackendDescriptor {
                self.0.descriptor()
            }
            fn forward(
                &self,
                q: &Tensor,
                k: &Tensor,
                v: &Tensor,
                causal: bool,
                mask: Option<&Tensor>,
            ) -> attnbench_kernels::Result<Tensor> {
                self.0.forward(q, k, v, causal, mask)
            }
        }
        let registry = BackendRegistry::from_backends(vec![Box::new(Shared(counting.clone()))]);
        let caps = CapabilitySnapshot::for_device(DeviceKind::Cpu, None);
        let plan = SweepPlan {
            precisions: vec![PrecisionMode::F16, PrecisionMode::Bf16, PrecisionMode::Fp8E4M3],
            causal_modes: vec![false, true],
        };
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(2, 3).unwrap(),
            &NoSync,
            &clock,
            plan,
        );
        let report = controller.run(&base(4));
        assert_eq!(report.cells.len(), 6);
        assert!(
            report.cells.iter().all(|c| matches!(c.outcome, CellOutcome::NotApplicable { .. }))
        );
        assert_eq!(counting.0.load(Ordering::SeqCst), 0);
        assert_eq!(clock.ticks.get(), 0, "clock must not be read for skipped cells");
    }

    static GONE: BackendDescriptor = BackendDescriptor {
        name: "gone",
        label: "Gone",
        layout: Layout::Bhld,
        dtypes: &[DType::F32, DType::F16, DType::BF16],
        mask: MaskSupport::Both,
    };

    #[test]
    fn compiled_out_backend_is_not_applicable() {
        let registry = BackendRegistry::from_backends(vec![
            Box::new(UnavailableBackend::new(&GONE, "built without the `gone` feature")),
            Box::new(SdpaBackend),
        ]);
        let caps = CapabilitySnapshot::for_device(DeviceKind::Cpu, None);
        let plan = SweepPlan {
            precisions: vec![PrecisionMode::F32, PrecisionMode::F16],
            causal_modes: vec![false, true],
        };
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(1, 2).unwrap(),
            &NoSync,
            &clock,
            plan,
        );
        let report = controller.run(&base(4));
        assert_eq!(report.cells.len(), 8);
        for cell in report.cells.iter().filter(|c| c.backend == "gone") {
            assert!(matches!(
                &cell.outcome,
                CellOutcome::NotApplicable { reason } if reason.contains("not available")
            ));
        }
        // Only sdpa touched the clock: 4 cells, 2 reads each.
        assert_eq!(report.count(CellOutcome::is_measured), 4);
        assert_eq!(report.count(|o| matches!(o, CellOutcome::Failed { .. })), 0);
        assert_eq!(clock.ticks.get(), 8);
        assert_eq!(report.columns[0], BackendColumn { name: "gone", label: "Gone" });
    }

    #[test]
    fn compiled_out_backend_alone_never_reads_clock() {
        let registry = BackendRegistry::from_backends(vec![Box::new(UnavailableBackend::new(
            &GONE,
            "not built",
        ))]);
        let caps = CapabilitySnapshot::permissive(DeviceKind::Cpu);
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(3, 5).unwrap(),
            &NoSync,
            &clock,
            SweepPlan::default(),
        );
        let report = controller.run(&base(4));
        assert_eq!(report.cells.len(), PrecisionMode::ALL.len());
        assert!(
            report.cells.iter().all(|c| matches!(c.outcome, CellOutcome::NotApplicable { .. }))
        );
        assert_eq!(clock.ticks.get(), 0);
    }

    #[test]
    #[traced_test]
    fn skipped_cells_are_not_logged_as_measuring() {
        let registry = BackendRegistry::from_backends(vec![Box::new(UnavailableBackend::new(
            &GONE,
            "not built",
        ))]);
        let caps = CapabilitySnapshot::for_device(DeviceKind::Cpu, None);
        let plan = SweepPlan { precisions: vec![PrecisionMode::F32], causal_modes: vec![true] };
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(0, 1).unwrap(),
            &NoSync,
            &clock,
            plan,
        );
        controller.run(&base(4));
        assert!(logs_contain("skipped gone float32 causal=true"));
        assert!(!logs_contain("measuring gone"));
    }

    #[test]
    fn phase_display() {
        let skipped =
            SweepPhase::Skipped { backend: "flash", precision: PrecisionMode::F32, causal: false };
        assert_eq!(skipped.to_string(), "skipped flash float32 causal=false");
        let measuring =
            SweepPhase::Measuring { backend: "sdpa", precision: PrecisionMode::F16, causal: true };
        assert_eq!(measuring.to_string(), "measuring sdpa float16 causal=true");
        assert_eq!(SweepPhase::Done { cells: 3 }.to_string(), "done (3 cells)");
    }

    #[test]
    fn failing_backend_is_isolated() {
        let registry = BackendRegistry::from_backends(vec![
            Box::new(Failing),
            Box::new(SdpaBackend),
            Box::new(Panicking),
        ]);
        let caps = CapabilitySnapshot::for_device(DeviceKind::Cpu, None);
        let plan = SweepPlan {
            precisions: vec![PrecisionMode::F32, PrecisionMode::Fp8E4M3Sim],
            causal_modes: vec![false],
        };
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(1, 2).unwrap(),
            &NoSync,
            &clock,
            plan,
        );
        let report = controller.run(&base(8));
        assert_eq!(report.cells.len(), 6);
        for cell in &report.cells {
            match cell.backend {
                "sdpa" => assert!(cell.outcome.is_measured(), "{cell:?}"),
                "failing" => assert!(matches!(
                    &cell.outcome,
                    CellOutcome::Failed { cause } if cause.contains("always fails")
                )),
                "panicking" => assert!(matches!(
                    &cell.outcome,
                    CellOutcome::Failed { cause } if cause.contains("kernel exploded")
                )),
                other => panic!("unexpected backend {other}"),
            }
        }
    }

    #[test]
    fn order_is_causal_then_precision_then_backend() {
        let registry =
            BackendRegistry::from_backends(vec![Box::new(Failing), Box::new(SdpaBackend)]);
        let caps = CapabilitySnapshot::permissive(DeviceKind::Cpu);
        let plan = SweepPlan {
            precisions: vec![PrecisionMode::F32, PrecisionMode::F16],
            causal_modes: vec![false, true],
        };
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(0, 1).unwrap(),
            &NoSync,
            &clock,
            plan,
        );
        let report = controller.run(&base(4));
        let order: Vec<_> =
            report.cells.iter().map(|c| (c.causal, c.precision, c.backend)).collect();
        assert_eq!(
            order,
            [
                (false, PrecisionMode::F32, "failing"),
                (false, PrecisionMode::F32, "sdpa"),
                (false, PrecisionMode::F16, "failing"),
                (false, PrecisionMode::F16, "sdpa"),
                (true, PrecisionMode::F32, "failing"),
                (true, PrecisionMode::F32, "sdpa"),
                (true, PrecisionMode::F16, "failing"),
                (true, PrecisionMode::F16, "sdpa"),
            ]
        );
    }

    #[test]
    fn measured_cells_carry_throughput() {
        let registry = BackendRegistry::from_backends(vec![Box::new(SdpaBackend)]);
        let caps = CapabilitySnapshot::for_device(DeviceKind::Cpu, None);
        let plan = SweepPlan { precisions: vec![PrecisionMode::F32], causal_modes: vec![true] };
        // Two clock reads per measurement, one tick apart: 1 ms over 4 runs.
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(0, 4).unwrap(),
            &NoSync,
            &clock,
            plan,
        );
        let base = base(8);
        let report = controller.run(&base);
        let CellOutcome::Measured { mean_ms, tflops: t } = report.cells[0].outcome else {
            panic!("expected a measurement");
        };
        assert_eq!(mean_ms, 0.25);
        assert_eq!(t, tflops(base.spec.attention_flops(true), 0.25));
    }

    #[test]
    fn run_lengths_generates_per_length() {
        let registry = BackendRegistry::from_backends(vec![Box::new(SdpaBackend)]);
        let caps = CapabilitySnapshot::for_device(DeviceKind::Cpu, None);
        let plan =
            SweepPlan { precisions: vec![PrecisionMode::F32], causal_modes: vec![false, true] };
        let clock = TickClock::default();
        let controller = SweepController::new(
            &registry,
            &caps,
            TimingProtocol::new(0, 1).unwrap(),
            &NoSync,
            &clock,
            plan,
        );
        let shape = WorkloadSpec::new(1, 1, 1, 4).unwrap();
        let report = controller.run_lengths(shape, &[4, 8, 0], 0, &Device::Cpu);
        assert_eq!(report.cells.len(), 6);
        assert!(report.cell("sdpa", PrecisionMode::F32, true, 8).unwrap().outcome.is_measured());
        // A zero length cannot be generated; its cells fail instead of aborting.
        assert!(matches!(
            report.cell("sdpa", PrecisionMode::F32, false, 0).unwrap().outcome,
            CellOutcome::Failed { .. }
        ));
        assert_eq!(report.columns, [BackendColumn { name: "sdpa", label: "SDPA" }]);
    }
}
