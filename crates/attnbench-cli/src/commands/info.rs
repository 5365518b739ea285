//! `attnbench info`

use anyhow::Result;
use attnbench_common::PrecisionMode;
use attnbench_device_probe::{
    CapabilitySnapshot, DeviceKind, GpuCapabilities, collect_environment, cuda_compiled,
};
use attnbench_kernels::{AttentionBackend, BackendRegistry};
use console::style;

/// Print host, GPU, backend and precision availability.
pub fn show_system_info(gpu: GpuCapabilities) -> Result<()> {
    let registry = BackendRegistry::new();
    let env = collect_environment(gpu.clone())
        .with_backends(registry.list_available().into_iter().map(String::from));

    println!("{}", style("attnbench System Information").bold().cyan());
    println!();

    println!("{}", style("Environment:").bold());
    for line in env.lines() {
        println!("  {line}");
    }
    println!();

    println!("{}", style("Features:").bold());
    let mark = |on: bool| if on { style("✓ Enabled").green() } else { style("✗ Disabled").red() };
    println!("  CUDA support: {}", mark(cuda_compiled()));
    println!("  CUDA device: {}", mark(gpu.cuda_available));
    if let Some(version) = &gpu.cuda_version {
        println!("  CUDA version: {version}");
    }
    println!();

    println!("{}", style("Backends:").bold());
    for backend in registry.iter() {
        let d = backend.descriptor();
        let dtypes: Vec<String> = d.dtypes.iter().map(|t| format!("{t:?}")).collect();
        println!(
            "  {:<14} {} layout={:?} mask={:?} dtypes=[{}]",
            d.name,
            mark(backend.is_available()),
            d.layout,
            d.mask,
            dtypes.join(", ")
        );
    }
    println!();

    // CUDA is what a sweep would pick under `--device auto` when present.
    let kind =
        if cuda_compiled() && gpu.cuda_available { DeviceKind::Cuda } else { DeviceKind::Cpu };
    let compute_capability = gpu.primary().and_then(|g| g.compute_capability);
    let caps = CapabilitySnapshot::for_device(kind, compute_capability);
    println!("{}", style(format!("Precisions on {kind}:")).bold());
    for precision in PrecisionMode::ALL {
        match caps.unsupported_reason(precision) {
            None => println!("  {:<14} {}", precision.label(), style("✓").green()),
            Some(reason) => println!("  {:<14} {} {reason}", precision.label(), style("✗").red()),
        }
    }

    Ok(())
}
