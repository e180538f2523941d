//! autotile-gemm CLI
//!
//! Measures N×N×N GEMM throughput, tiling the problem when it does not fit
//! in device memory.

use autotile_gemm::{
    human_bytes, resolve_precision, BenchConfig, BenchError, Benchmark, FlopRate, GemmDevice,
    HostDevice, Precision,
};
use clap::{Parser, ValueEnum};
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DeviceKind {
    /// The host CPU
    Host,
    /// A CUDA GPU (requires the `cuda` feature)
    Cuda,
}

#[derive(Debug, Parser)]
#[command(name = "autotile-gemm")]
#[command(author, version, about = "Auto-tiling dense GEMM throughput benchmark")]
struct Cli {
    /// Matrix dimension N
    #[arg(short = 'n', long, env = "AUTOTILE_SIZE", default_value_t = 200_000)]
    size: usize,

    /// Precision: fp32, fp16 or bf16 (and aliases)
    #[arg(short, long, env = "AUTOTILE_PRECISION", default_value = "fp32")]
    precision: String,

    /// Number of timed repetitions
    #[arg(short, long, env = "AUTOTILE_REPEATS", default_value_t = 1)]
    repeats: usize,

    /// Fraction of free memory used as the budget, in (0, 1]
    #[arg(short, long, env = "AUTOTILE_SAFETY", default_value_t = 0.55)]
    safety: f64,

    /// Force a tile size instead of deriving one from free memory
    #[arg(short, long, env = "AUTOTILE_TILE")]
    tile: Option<usize>,

    /// Compute device
    #[arg(long, env = "AUTOTILE_DEVICE", value_enum, default_value_t = DeviceKind::Host)]
    device: DeviceKind,

    /// CUDA device ordinal
    #[arg(long, env = "AUTOTILE_ORDINAL", default_value_t = 0)]
    ordinal: usize,

    /// Cap host memory, e.g. 512M or 8GiB (host device only)
    #[arg(long, env = "AUTOTILE_MEMORY_LIMIT", value_parser = parse_bytes)]
    memory_limit: Option<u64>,

    /// Seed for host tile contents
    #[arg(long, env = "AUTOTILE_SEED")]
    seed: Option<u64>,
}

/// Parse a byte count with an optional K/M/G/T suffix (1024-based).
fn parse_bytes(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid byte count: {:?}", input))?;
    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        other => return Err(format!("unknown byte suffix: {:?}", other)),
    };
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("byte count overflows: {:?}", input))
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), BenchError> {
    let (precision, _) = resolve_precision(&cli.precision)?;
    let config = BenchConfig {
        size: cli.size,
        precision,
        repeats: cli.repeats,
        safety_margin: cli.safety,
        tile: cli.tile,
    };
    config.validate()?;

    match cli.device {
        DeviceKind::Host => {
            let device = match cli.memory_limit {
                Some(limit) => HostDevice::with_memory_limit(limit)?,
                None => HostDevice::new()?,
            };
            let device = match cli.seed {
                Some(seed) => device.with_seed(seed),
                None => device,
            };
            benchmark(&device, config)
        }
        DeviceKind::Cuda => run_cuda(cli, config),
    }
}

#[cfg(feature = "cuda")]
fn run_cuda(cli: &Cli, config: BenchConfig) -> Result<(), BenchError> {
    if cli.memory_limit.is_some() {
        log::warn!("--memory-limit applies to the host device only; ignored");
    }
    let device = autotile_gemm::CudaDevice::new(cli.ordinal)?;
    benchmark(&device, config)
}

#[cfg(not(feature = "cuda"))]
fn run_cuda(cli: &Cli, _config: BenchConfig) -> Result<(), BenchError> {
    Err(BenchError::DeviceUnavailable(format!(
        "CUDA device {} requested but this build has no CUDA support (enable the `cuda` feature)",
        cli.ordinal
    )))
}

fn benchmark<D: GemmDevice + ?Sized>(device: &D, config: BenchConfig) -> Result<(), BenchError> {
    let n = config.size;
    let precision: Precision = config.precision;
    let forced = config.tile.is_some();
    let bench = Benchmark::new(device, config)?;

    let plan = bench.plan()?;
    println!();
    println!("Device: {}", device.info());
    println!(
        "Total memory: {} | Free: {}",
        human_bytes(plan.snapshot.total_bytes),
        human_bytes(plan.snapshot.free_bytes)
    );
    println!("Precision: {} (elem {} bytes)", precision, precision.element_width());
    println!("Problem: {} x {}", n, n);
    println!("Safety: {}", bench.config().safety_margin);
    println!(
        "Tile ({}): {} | One-shot possible: {}",
        if forced { "forced" } else { "auto" },
        plan.tile_size,
        plan.one_shot_feasible
    );

    bench.warm_up(&plan)?;

    let report = bench.run_planned(&plan, |index, run| {
        println!(
            "Run {}: {:.4}s  |  {}  [{}]",
            index + 1,
            run.elapsed_secs(),
            FlopRate::of(n, run.elapsed_secs()),
            run.mode
        );
    })?;

    println!();
    println!(
        "Best: {:.4}s  |  {}  [{}]",
        report.best.elapsed_secs(),
        report.best_rate(),
        report.mode
    );
    println!();
    Ok(())
}
