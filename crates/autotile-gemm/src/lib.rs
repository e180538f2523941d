//! Auto-tiling dense GEMM benchmark.
//!
//! Measures the throughput of an N×N×N matrix multiply that may not fit in
//! device memory. Free memory is sampled, a tile size is planned, and the
//! multiply runs either as one primitive call (one-shot) or tile by tile with
//! at most three tiles resident at once.
//!
//! # Quick Start
//!
//! ```
//! use autotile_gemm::{BenchConfig, Benchmark, HostDevice, Precision};
//!
//! let device = HostDevice::with_memory_limit(64 * 1024 * 1024)?;
//! let config = BenchConfig {
//!     size: 128,
//!     precision: Precision::F32,
//!     repeats: 2,
//!     ..BenchConfig::default()
//! };
//!
//! let report = Benchmark::new(&device, config)?.run()?;
//! println!("best: {:.4}s | {}", report.best.elapsed_secs(), report.best_rate());
//! # Ok::<(), autotile_gemm::BenchError>(())
//! ```
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`precision`] | label → element type and width |
//! | [`device`] | memory queries, tile allocation, GEMM primitive |
//! | [`planner`] | one-shot feasibility and tile size |
//! | [`engine`] | one-shot and tiled execution |
//! | [`metrics`] | FLOP/s, best run, byte formatting |
//! | [`bench`] | orchestration over repetitions |
//! | [`testing`] | allocation-tracking device double |
//!
//! # Precisions
//!
//! | Precision | Element type | Width |
//! |-----------|--------------|-------|
//! | `fp32` | `f32` | 4 |
//! | `fp16` | [`half::f16`] | 2 |
//! | `bf16` | [`half::bf16`] | 2 |
//!
//! # Features
//!
//! - `parallel` (default): rayon-parallel host kernels.
//! - `cuda`: a cuBLAS-backed `CudaDevice`.

pub mod bench;
pub mod device;
pub mod engine;
pub mod error;
mod kernels;
mod memory;
pub mod metrics;
pub mod planner;
pub mod precision;
pub mod testing;
pub mod tiling;

pub use bench::{BenchConfig, Benchmark, BenchmarkReport, ProblemSpec};
pub use device::{
    sample_memory, DeviceContext, DeviceInfo, GemmDevice, HostDevice, HostTile, MemorySnapshot,
    TileBuffer, TileOps,
};
pub use engine::{ExecutionMode, RunResult};
pub use error::{BenchError, Result};
pub use metrics::{best_run, compute_throughput, human_bytes, FlopRate};
pub use planner::{plan_tile, TilePlan, MIN_TILE};
pub use precision::{resolve_precision, Element, Precision};

#[cfg(feature = "cuda")]
pub use device::{CudaDevice, CudaTile};

/// Host GEMM kernel, exposed for benchmarking.
#[doc(hidden)]
pub mod bench_kernels {
    pub use crate::kernels::{fill_uniform, gemm_accumulate};
}
