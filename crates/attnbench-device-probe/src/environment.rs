//! Host environment diagnostics printed before a sweep.
//!
//! Purely informational: nothing here influences which cells run.

use crate::{CpuCapabilities, GpuCapabilities, probe_cpu};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Snapshot of the machine a benchmark ran on.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentReport {
    pub os: String,
    pub cpu_model: String,
    pub physical_cores: Option<usize>,
    pub cpu: CpuCapabilities,
    pub total_memory_bytes: u64,
    pub gpu: GpuCapabilities,
    pub attnbench_version: &'static str,
    /// candle-core version the backends were built against.
    pub candle_version: &'static str,
    /// Names of the attention backends compiled into this binary.
    pub backends: Vec<String>,
}

/// Gather host information. `gpu` comes from [`crate::probe_gpu`] so the
/// probe runs only once per process.
pub fn collect_environment(gpu: GpuCapabilities) -> EnvironmentReport {
    let sys = System::new_with_specifics(
        RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing())
            .with_memory(MemoryRefreshKind::everything()),
    );

    let cpu_model = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().trim().to_string())
        .filter(|brand| !brand.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let os = match (System::name(), System::os_version()) {
        (Some(name), Some(version)) => format!("{name} {version}"),
        (Some(name), None) => name,
        _ => std::env::consts::OS.to_string(),
    };

    EnvironmentReport {
        os,
        cpu_model,
        physical_cores: sys.physical_core_count(),
        cpu: probe_cpu(),
        total_memory_bytes: sys.total_memory(),
        gpu,
        attnbench_version: env!("CARGO_PKG_VERSION"),
        candle_version: env!("ATTNBENCH_CANDLE_VERSION"),
        backends: Vec::new(),
    }
}

impl EnvironmentReport {
    pub fn with_backends(mut self, backends: impl IntoIterator<Item = String>) -> Self {
        self.backends = backends.into_iter().collect();
        self
    }

    /// Human-readable `key: value` lines.
    pub fn lines(&self) -> Vec<String> {
        let cores = match self.physical_cores {
            Some(physical) => format!("{physical} cores / {} threads", self.cpu.core_count),
            None => format!("{} threads", self.cpu.core_count),
        };
        let backends =
            if self.backends.is_empty() { "none".to_string() } else { self.backends.join(", ") };
        vec![
            format!("OS: {}", self.os),
            format!("CPU: {} ({cores}, {})", self.cpu_model, self.cpu.simd),
            format!("RAM: {:.2} GB", self.total_memory_bytes as f64 / 1e9),
            format!("GPU: {}", self.gpu.summary()),
            format!("attnbench: {}", self.attnbench_version),
            format!("candle: {}", self.candle_version),
            format!("Backends: {backends}"),
        ]
    }
}

impl std::fmt::Display for EnvironmentReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
