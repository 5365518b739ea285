//! Full sweeps over the real backend registry on CPU.

use attnbench_common::{PrecisionMode, WorkloadSpec};
use attnbench_device_probe::{CapabilitySnapshot, DeviceKind};
use attnbench_harness::{
    CellOutcome, MonotonicClock, ReportMetric, SweepController, SweepPlan, SweepReport, TeeLog,
    TimingProtocol, render_table,
};
use attnbench_kernels::BackendRegistry;
use candle_core::Device;

fn sweep(registry: &BackendRegistry, plan: SweepPlan, seq_lens: &[usize]) -> SweepReport {
    let caps = CapabilitySnapshot::detect(&Device::Cpu, &Default::default());
    let clock = MonotonicClock::new();
    let device = Device::Cpu;
    let controller = SweepController::new(
        registry,
        &caps,
        TimingProtocol::new(1, 2).unwrap(),
        &device,
        &clock,
        plan,
    );
    let shape = WorkloadSpec::new(1, 2, seq_lens[0], 8).unwrap();
    controller.run_lengths(shape, seq_lens, 0, &device)
}

fn outcome<'a>(
    report: &'a SweepReport,
    backend: &str,
    precision: PrecisionMode,
    causal: bool,
) -> &'a CellOutcome {
    &report.cell(backend, precision, causal, 16).unwrap().outcome
}

fn is_na(outcome: &CellOutcome) -> bool {
    matches!(outcome, CellOutcome::NotApplicable { .. })
}

#[test]
fn every_cell_gets_exactly_one_outcome() {
    let registry = BackendRegistry::new();
    let plan =
        SweepPlan { precisions: PrecisionMode::ALL.to_vec(), causal_modes: vec![false, true] };
    let report = sweep(&registry, plan, &[16]);

    assert_eq!(report.cells.len(), registry.len() * PrecisionMode::ALL.len() * 2);
    assert_eq!(
        report.count(|_| true),
        report.count(CellOutcome::is_measured)
            + report.count(|o| is_na(o))
            + report.count(|o| matches!(o, CellOutcome::Failed { .. }))
    );
}

#[test]
fn applicability_follows_descriptors_and_device() {
    let registry = BackendRegistry::new();
    let plan =
        SweepPlan { precisions: PrecisionMode::ALL.to_vec(), causal_modes: vec![false, true] };
    let report = sweep(&registry, plan, &[16]);

    for causal in [false, true] {
        // Native fp8 never runs on CPU; E5M2 has no tensor dtype at all.
        for backend in ["sdpa", "mem_efficient", "flash", "quantized"] {
            assert!(is_na(outcome(&report, backend, PrecisionMode::Fp8E4M3, causal)));
            assert!(is_na(outcome(&report, backend, PrecisionMode::Fp8E5M2, causal)));
        }
        // Simulated precisions run in f32, which the half-only backends refuse.
        for precision in [PrecisionMode::F32, PrecisionMode::Fp4Sim, PrecisionMode::Fp8E5M2Sim] {
            assert!(is_na(outcome(&report, "flash", precision, causal)));
            assert!(is_na(outcome(&report, "quantized", precision, causal)));
            assert!(outcome(&report, "sdpa", precision, causal).is_measured());
            assert!(outcome(&report, "mem_efficient", precision, causal).is_measured());
        }
    }
}

#[cfg(feature = "flash-attn")]
#[test]
fn half_precision_runs_on_flash() {
    let registry = BackendRegistry::new().select(&["flash".to_string()]).unwrap();
    let plan = SweepPlan {
        precisions: vec![PrecisionMode::F16, PrecisionMode::Bf16],
        causal_modes: vec![false, true],
    };
    let report = sweep(&registry, plan, &[16]);
    assert!(report.cells.iter().all(|c| c.outcome.is_measured()), "{:?}", report.cells);
}

#[test]
fn multi_length_throughput_table() {
    let registry = BackendRegistry::new()
        .select(&["sdpa".to_string(), "mem_efficient".to_string()])
        .unwrap();
    let plan = SweepPlan { precisions: vec![PrecisionMode::F32], causal_modes: vec![false, true] };
    let report = sweep(&registry, plan, &[8, 16]);

    assert_eq!(report.cells.len(), 2 * 2 * 2);
    assert!(report.cells.iter().all(|c| c.outcome.is_measured()));
    for cell in &report.cells {
        let CellOutcome::Measured { tflops, mean_ms } = cell.outcome else { unreachable!() };
        assert!(mean_ms >= 0.0);
        assert!(tflops > 0.0);
    }

    let table = render_table(&report, ReportMetric::Tflops);
    let first = table.find("Causal=False Seq=8").unwrap();
    let second = table.find("Causal=False Seq=16").unwrap();
    let third = table.find("Causal=True Seq=8").unwrap();
    assert!(first < second && second < third);
    assert!(!table.contains("N/A"));
}

#[test]
fn report_goes_through_tee_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench_results.txt");
    let registry = BackendRegistry::new();
    let plan = SweepPlan {
        precisions: vec![PrecisionMode::F32, PrecisionMode::F16],
        causal_modes: vec![false],
    };
    let report = sweep(&registry, plan, &[16]);

    {
        let mut tee = TeeLog::with_writer(std::io::sink(), Some(&path));
        tee.line("--- Summary (ms/iter) ---");
        tee.line(render_table(&report, ReportMetric::LatencyMs));
    }
    let logged = std::fs::read_to_string(&path).unwrap();
    assert!(logged.starts_with("--- Summary (ms/iter) ---\n"));
    assert!(logged.contains("Dtype"));
    assert!(logged.contains("float16"));
    assert!(logged.contains("Flash (ms)"));
}
