//! Timing protocol
//!
//! `warmup` untimed calls, a device barrier, the clock starts, `runs`
//! back-to-back calls, a second barrier, the clock stops. The reported
//! latency is the wall time between the two readings divided by `runs`, so
//! queued asynchronous work is always drained inside the timed window.

use crate::{HarnessError, Result};
use attnbench_common::WorkloadSpec;
use candle_core::Device;
use std::time::{Duration, Instant};

/// Blocks until all work queued on a device has finished.
pub trait DeviceSync {
    fn synchronize(&self) -> Result<()>;
}

impl DeviceSync for Device {
    fn synchronize(&self) -> Result<()> {
        Device::synchronize(self).map_err(|e| HarnessError::Sync(e.to_string()))
    }
}

/// Monotonic time source.
pub trait Clock {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// [`Instant`]-backed clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Result of one timed measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Mean wall time per call in milliseconds.
    pub mean_ms: f64,
    pub total: Duration,
    pub runs: usize,
}

/// Warmup and measured iteration counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProtocol {
    pub warmup: usize,
    pub runs: usize,
}

impl TimingProtocol {
    pub fn new(warmup: usize, runs: usize) -> Result<Self> {
        if runs == 0 {
            return Err(HarnessError::ZeroRuns);
        }
        Ok(Self { warmup, runs })
    }

    /// Time `f` and return the mean latency per call.
    ///
    /// Any error from `f` or from a barrier aborts the measurement and is
    /// returned as is.
    pub fn measure<S, C, F>(&self, sync: &S, clock: &C, mut f: F) -> Result<Measurement>
    where
        S: DeviceSync + ?Sized,
        C: Clock + ?Sized,
        F: FnMut() -> Result<()>,
    {
        if self.runs == 0 {
            return Err(HarnessError::ZeroRuns);
        }

        for _ in 0..self.warmup {
            f()?;
        }
        sync.synchronize()?;

        let start = clock.now();
        for _ in 0..self.runs {
            f()?;
        }
        sync.synchronize()?;
        let total = clock.now().saturating_sub(start);

        let mean_ms = total.as_nanos() as f64 / 1e6 / self.runs as f64;
        Ok(Measurement { mean_ms, total, runs: self.runs })
    }
}

/// Floating-point operations of one attention call.
pub fn attention_flops(spec: &WorkloadSpec, causal: bool) -> u64 {
    spec.attention_flops(causal)
}

/// Throughput in TFLOPS for `flops` per call at `mean_ms` per call.
///
/// Non-positive latencies yield `f64::INFINITY`.
pub fn tflops(flops: u64, mean_ms: f64) -> f64 {
    if mean_ms <= 0.0 {
        return f64::INFINITY;
    }
    flops as f64 / (mean_ms / 1000.0) / 1e12
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Clock that only moves when told to.
    #[derive(Default)]
    struct ManualClock {
        now: Cell<Duration>,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            self.now.set(self.now.get() + by);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            self.now.get()
        }
    }

    /// Records barrier calls into a shared event log.
    struct RecordingSync<'a> {
        events: &'a RefCell<Vec<&'static str>>,
    }

    impl DeviceSync for RecordingSync<'_> {
        fn synchronize(&self) -> Result<()> {
            self.events.borrow_mut().push("sync");
            Ok(())
        }
    }

    #[test]
    fn fixed_cost_gives_exact_mean() {
        let clock = ManualClock::default();
        let events = RefCell::new(Vec::new());
        let sync = RecordingSync { events: &events };
        let protocol = TimingProtocol::new(3, 10).unwrap();

        let m = protocol
            .measure(&sync, &clock, || {
                clock.advance(Duration::from_millis(2));
                Ok(())
            })
            .unwrap();
        assert_eq!(m.mean_ms, 2.0);
        assert_eq!(m.runs, 10);
        assert_eq!(m.total, Duration::from_millis(20));
    }

    #[test]
    fn mean_does_not_depend_on_run_count() {
        let per_call = Duration::from_micros(1250);
        for runs in [1, 10, 100] {
            let clock = ManualClock::default();
            let events = RefCell::new(Vec::new());
            let sync = RecordingSync { events: &events };
            let calls = Cell::new(0usize);
            let m = TimingProtocol::new(2, runs)
                .unwrap()
                .measure(&sync, &clock, || {
                    calls.set(calls.get() + 1);
                    clock.advance(per_call);
                    Ok(())
                })
                .unwrap();
            assert!((m.mean_ms - 1.25).abs() < 1e-9, "runs={runs}: {}", m.mean_ms);
            assert_eq!(m.total, per_call * runs as u32);
            assert_eq!(calls.get(), runs + 2);
        }
    }

    #[test]
    fn slow_warmup_is_not_counted() {
        let clock = ManualClock::default();
        let events = RefCell::new(Vec::new());
        let sync = RecordingSync { events: &events };
        let calls = Cell::new(0usize);

        let m = TimingProtocol::new(2, 4)
            .unwrap()
            .measure(&sync, &clock, || {
                let cost = if calls.get() == 0 { 500 } else { 1 };
                calls.set(calls.get() + 1);
                clock.advance(Duration::from_millis(cost));
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.get(), 6);
        assert_eq!(m.mean_ms, 1.0);
    }

    #[test]
    fn barriers_bracket_the_timed_window() {
        let clock = ManualClock::default();
        let events = RefCell::new(Vec::new());
        let sync = RecordingSync { events: &events };

        TimingProtocol::new(2, 3)
            .unwrap()
            .measure(&sync, &clock, || {
                events.borrow_mut().push("call");
                Ok(())
            })
            .unwrap();
        assert_eq!(
            *events.borrow(),
            ["call", "call", "sync", "call", "call", "call", "sync"]
        );
    }

    #[test]
    fn asynchronous_tail_is_captured_by_final_barrier() {
        // Work "queued" by the calls only completes at the barrier.
        struct DrainingSync<'a> {
            clock: &'a ManualClock,
            pending: &'a Cell<u32>,
        }
        impl DeviceSync for DrainingSync<'_> {
            fn synchronize(&self) -> Result<()> {
                self.clock.advance(Duration::from_millis(u64::from(self.pending.replace(0))));
                Ok(())
            }
        }

        let clock = ManualClock::default();
        let pending = Cell::new(0u32);
        let sync = DrainingSync { clock: &clock, pending: &pending };
        let m = TimingProtocol::new(1, 5)
            .unwrap()
            .measure(&sync, &clock, || {
                pending.set(pending.get() + 3);
                Ok(())
            })
            .unwrap();
        assert_eq!(m.mean_ms, 3.0);
    }

    #[test]
    fn errors_propagate() {
        let clock = ManualClock::default();
        let events = RefCell::new(Vec::new());
        let sync = RecordingSync { events: &events };
        let err = TimingProtocol::new(0, 1)
            .unwrap()
            .measure(&sync, &clock, || Err(HarnessError::Sync("boom".into())))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Sync(_)));
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn zero_runs_rejected() {
        assert!(matches!(TimingProtocol::new(5, 0), Err(HarnessError::ZeroRuns)));
        let protocol = TimingProtocol { warmup: 0, runs: 0 };
        let err = protocol.measure(&Device::Cpu, &MonotonicClock::new(), || Ok(())).unwrap_err();
        assert!(matches!(err, HarnessError::ZeroRuns));
    }

    #[test]
    fn throughput_figure() {
        let spec = WorkloadSpec::new(4, 32, 1024, 128).unwrap();
        let flops = attention_flops(&spec, false);
        assert_eq!(flops, 2 * 4 * 32 * 1024 * 1024 * 128);
        let t = tflops(flops, 2.0);
        let expected = (2.0 * 4.0 * 32.0 * 1024.0 * 1024.0 * 128.0) / 0.002 / 1e12;
        assert!((t - expected).abs() < 1e-9);
        assert_eq!(attention_flops(&spec, true), flops / 2);
    }

    #[test]
    fn cpu_device_sync_is_a_no_op() {
        assert!(DeviceSync::synchronize(&Device::Cpu).is_ok());
    }
}
