//! Device detection and capability probing for attnbench.
//!
//! Everything here runs once, before the sweep starts. The result is an
//! immutable [`CapabilitySnapshot`] that the sweep controller receives
//! explicitly instead of querying global device state mid-sweep.

use attnbench_common::{DeviceRequest, PrecisionMode};
use candle_core::Device;
use std::process::{Command, Stdio};

pub mod environment;

pub use environment::{EnvironmentReport, collect_environment};

// ── CPU capabilities ─────────────────────────────────────────────────────────

/// SIMD instruction set level detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SimdLevel {
    Scalar,
    Neon,
    Sse42,
    Avx2,
    Avx512,
}

impl std::fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimdLevel::Scalar => write!(f, "scalar"),
            SimdLevel::Neon => write!(f, "neon"),
            SimdLevel::Sse42 => write!(f, "sse4.2"),
            SimdLevel::Avx2 => write!(f, "avx2"),
            SimdLevel::Avx512 => write!(f, "avx512"),
        }
    }
}

/// CPU capabilities detected at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuCapabilities {
    /// Logical cores available to the process (always ≥ 1).
    pub core_count: usize,
    pub simd: SimdLevel,
}

/// Probe the current CPU.
pub fn probe_cpu() -> CpuCapabilities {
    let core_count = std::thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(1);
    CpuCapabilities { core_count, simd: detect_simd_level() }
}

/// Detect the best SIMD level available at runtime.
pub fn detect_simd_level() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512f") {
            SimdLevel::Avx512
        } else if is_x86_feature_detected!("avx2") {
            SimdLevel::Avx2
        } else if is_x86_feature_detected!("sse4.2") {
            SimdLevel::Sse42
        } else {
            SimdLevel::Scalar
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        SimdLevel::Neon
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        SimdLevel::Scalar
    }
}

// ── GPU capabilities ─────────────────────────────────────────────────────────

/// One CUDA device as reported by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub name: String,
    pub memory_mib: Option<u64>,
    /// `(major, minor)` compute capability.
    pub compute_capability: Option<(u32, u32)>,
    pub driver_version: Option<String>,
}

/// GPU capabilities detected at runtime.
///
/// `ATTNBENCH_GPU_FAKE` overrides detection for deterministic tests:
/// `none` hides every GPU, `cuda` fakes a compute-capability 8.0 device and
/// `cuda:<major>.<minor>` picks the capability. `ATTNBENCH_STRICT_MODE=1`
/// ignores the override and probes real hardware.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GpuCapabilities {
    pub cuda_available: bool,
    pub devices: Vec<GpuInfo>,
    /// CUDA runtime version from the `nvidia-smi` banner.
    pub cuda_version: Option<String>,
}

impl GpuCapabilities {
    /// First device, the one the harness runs on.
    pub fn primary(&self) -> Option<&GpuInfo> {
        self.devices.first()
    }

    pub fn summary(&self) -> String {
        match self.primary() {
            Some(gpu) => {
                let mem = gpu
                    .memory_mib
                    .map(|mib| format!("{:.2} GB VRAM", mib as f64 / 1024.0))
                    .unwrap_or_else(|| "unknown VRAM".to_string());
                let cuda = self.cuda_version.as_deref().unwrap_or("unknown");
                match &gpu.driver_version {
                    Some(driver) => format!("{}, {mem}, CUDA {cuda}, driver {driver}", gpu.name),
                    None => format!("{}, {mem}, CUDA {cuda}", gpu.name),
                }
            }
            None => "GPU not available".to_string(),
        }
    }
}

/// Check if CUDA support was compiled into this binary.
#[inline]
pub const fn cuda_compiled() -> bool {
    cfg!(feature = "cuda")
}

fn strict_mode_enabled() -> bool {
    std::env::var("ATTNBENCH_STRICT_MODE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse an `ATTNBENCH_GPU_FAKE` value.
pub fn parse_fake_gpu(value: &str) -> GpuCapabilities {
    let normalized = value.trim().to_ascii_lowercase();
    let Some(rest) = normalized.strip_prefix("cuda") else {
        return GpuCapabilities::default();
    };
    let compute_capability =
        rest.strip_prefix(':').and_then(parse_compute_capability).unwrap_or((8, 0));
    GpuCapabilities {
        cuda_available: true,
        devices: vec![GpuInfo {
            name: "Fake CUDA Device".to_string(),
            memory_mib: Some(16 * 1024),
            compute_capability: Some(compute_capability),
            driver_version: None,
        }],
        cuda_version: Some("fake".to_string()),
    }
}

/// Probe CUDA devices through `nvidia-smi`.
pub fn probe_gpu() -> GpuCapabilities {
    if !strict_mode_enabled() {
        if let Ok(fake) = std::env::var("ATTNBENCH_GPU_FAKE") {
            tracing::debug!(fake = %fake, "using faked GPU capabilities");
            return parse_fake_gpu(&fake);
        }
    }

    let Some(query) = command_stdout(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,compute_cap,driver_version",
            "--format=csv,noheader,nounits",
        ],
    ) else {
        return GpuCapabilities::default();
    };

    let devices: Vec<GpuInfo> = query.lines().filter_map(parse_gpu_query_line).collect();
    let cuda_version = command_stdout("nvidia-smi", &[]).and_then(|out| parse_cuda_version(&out));
    GpuCapabilities { cuda_available: !devices.is_empty(), devices, cuda_version }
}

fn command_stdout(cmd: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(cmd).args(args).stderr(Stdio::null()).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse one line of `--query-gpu=name,memory.total,compute_cap,driver_version`.
pub fn parse_gpu_query_line(line: &str) -> Option<GpuInfo> {
    let mut fields = line.split(',').map(str::trim);
    let name = fields.next().filter(|n| !n.is_empty())?.to_string();
    let memory_mib = fields.next().and_then(|m| m.parse::<u64>().ok());
    let compute_capability = fields.next().and_then(parse_compute_capability);
    let driver_version = fields.next().filter(|d| !d.is_empty()).map(str::to_string);
    Some(GpuInfo { name, memory_mib, compute_capability, driver_version })
}

/// Parse `"8.9"` into `(8, 9)`.
pub fn parse_compute_capability(value: &str) -> Option<(u32, u32)> {
    let (major, minor) = value.trim().split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Extract the version from the `CUDA Version: 12.4` banner field.
pub fn parse_cuda_version(banner: &str) -> Option<String> {
    banner.lines().find_map(|line| {
        let (_, rest) = line.split_once("CUDA Version:")?;
        rest.split_whitespace().next().map(str::to_string)
    })
}

// ── Device selection ─────────────────────────────────────────────────────────

/// Fatal setup failures: no sweep cell could possibly succeed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("CUDA was requested but this binary was built without the `cuda` feature")]
    CudaNotCompiled,
    #[error("CUDA was requested but no CUDA device was detected")]
    CudaUnavailable,
    #[error("failed to initialise device: {0}")]
    Device(#[from] candle_core::Error),
}

/// Resolve the configured device request against what was probed.
pub fn select_device(request: DeviceRequest, gpu: &GpuCapabilities) -> Result<Device, ProbeError> {
    match request {
        DeviceRequest::Cpu => Ok(Device::Cpu),
        DeviceRequest::Cuda => {
            if !cuda_compiled() {
                return Err(ProbeError::CudaNotCompiled);
            }
            if !gpu.cuda_available {
                return Err(ProbeError::CudaUnavailable);
            }
            Ok(Device::new_cuda(0)?)
        }
        DeviceRequest::Auto => {
            if cuda_compiled() && gpu.cuda_available {
                match Device::new_cuda(0) {
                    Ok(device) => return Ok(device),
                    Err(e) => {
                        tracing::warn!(error = %e, "CUDA detected but unusable, using CPU")
                    }
                }
            }
            tracing::info!("running on CPU");
            Ok(Device::Cpu)
        }
    }
}

// ── Capability snapshot ──────────────────────────────────────────────────────

/// Kind of device the sweep runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda"),
            DeviceKind::Metal => write!(f, "metal"),
        }
    }
}

impl From<&Device> for DeviceKind {
    fn from(device: &Device) -> Self {
        match device {
            Device::Cpu => DeviceKind::Cpu,
            Device::Cuda(_) => DeviceKind::Cuda,
            Device::Metal(_) => DeviceKind::Metal,
        }
    }
}

/// Immutable view of what the running device can execute natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub device: DeviceKind,
    pub compute_capability: Option<(u32, u32)>,
    pub native_fp8_e4m3: bool,
    pub native_fp8_e5m2: bool,
}

/// Minimum compute-capability major version for native fp8.
pub const FP8_MIN_COMPUTE_MAJOR: u32 = 8;

impl CapabilitySnapshot {
    /// Build the snapshot for the selected device.
    pub fn detect(device: &Device, gpu: &GpuCapabilities) -> Self {
        let kind = DeviceKind::from(device);
        let compute_capability = match kind {
            DeviceKind::Cuda => gpu.primary().and_then(|g| g.compute_capability),
            DeviceKind::Cpu | DeviceKind::Metal => None,
        };
        Self::for_device(kind, compute_capability)
    }

    /// Snapshot for a device kind and optional compute capability.
    pub fn for_device(device: DeviceKind, compute_capability: Option<(u32, u32)>) -> Self {
        let fp8_hardware = device == DeviceKind::Cuda
            && compute_capability.is_some_and(|(major, _)| major >= FP8_MIN_COMPUTE_MAJOR);
        Self {
            device,
            compute_capability,
            native_fp8_e4m3: fp8_hardware && PrecisionMode::Fp8E4M3.native_dtype().is_some(),
            native_fp8_e5m2: fp8_hardware && PrecisionMode::Fp8E5M2.native_dtype().is_some(),
        }
    }

    /// Snapshot with every precision available, for tests and dry runs.
    pub fn permissive(device: DeviceKind) -> Self {
        Self { device, compute_capability: None, native_fp8_e4m3: true, native_fp8_e5m2: true }
    }

    /// Whether `precision` can run at all on this device.
    pub fn native_available(&self, precision: PrecisionMode) -> bool {
        self.unsupported_reason(precision).is_none()
    }

    /// Why `precision` cannot run here, if it cannot.
    pub fn unsupported_reason(&self, precision: PrecisionMode) -> Option<String> {
        let available = match precision {
            PrecisionMode::Fp8E4M3 => self.native_fp8_e4m3,
            PrecisionMode::Fp8E5M2 => self.native_fp8_e5m2,
            _ => true,
        };
        if available {
            return None;
        }
        if precision.native_dtype().is_none() {
            return Some(format!("{precision} has no native tensor dtype"));
        }
        Some(format!(
            "{precision} requires a CUDA device with compute capability \
             >= {FP8_MIN_COMPUTE_MAJOR}.0"
        ))
    }

    pub fn summary(&self) -> String {
        let cc = self
            .compute_capability
            .map(|(major, minor)| format!("{major}.{minor}"))
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "device={} compute_capability={cc} native_fp8_e4m3={} native_fp8_e5m2={}",
            self.device, self.native_fp8_e4m3, self.native_fp8_e5m2
        )
    }
}
