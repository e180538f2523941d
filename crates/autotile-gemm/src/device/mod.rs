//! Device abstraction: memory queries, tile allocation and the GEMM primitive.
//!
//! A device is split into two traits:
//!
//! - [`DeviceContext`]: element-agnostic queries and barriers (name,
//!   free/total memory, cache release, synchronize).
//! - [`TileOps<E>`]: tile allocation, the fused multiply-accumulate
//!   `C ← C + A·B`, and the "force materialization" contract, implemented
//!   once per [`Element`] type.
//!
//! [`GemmDevice`] bundles the three element types a benchmark can resolve
//! to, so the orchestrator can dispatch on [`Precision`](crate::Precision)
//! at runtime.
//!
//! # Backends
//!
//! | Backend | Feature | Memory source | GEMM |
//! |---------|---------|---------------|------|
//! | [`HostDevice`] | (default) | `sysinfo`, or a fixed limit | blocked i-k-j, rayon |
//! | `CudaDevice` | `cuda` | `cuMemGetInfo` | cuBLAS |
//! | [`TrackingDevice`](crate::testing::TrackingDevice) | (always) | configured | none (shapes only) |
//!
//! The device handle is created once by the caller and passed by reference
//! to every component; nothing in this crate holds global device state.

mod host;

#[cfg(feature = "cuda")]
mod cuda;

pub use host::{HostDevice, HostTile};

#[cfg(feature = "cuda")]
pub use cuda::{CudaDevice, CudaTile};

use crate::error::Result;
use crate::precision::Element;
use half::{bf16, f16};
use std::fmt;

/// Identification of a compute device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Backend-specific capability string (e.g. `cc 8.6`, `16 threads`).
    pub capability: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.capability)
    }
}

/// Free and total device memory at one point in time.
///
/// Snapshots are never cached: device memory changes between invocations,
/// so a fresh one is sampled before every planning decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

/// Element-agnostic device operations.
pub trait DeviceContext {
    /// Device name and capability.
    fn info(&self) -> DeviceInfo;

    /// Query current free and total memory.
    fn memory_info(&self) -> Result<MemorySnapshot>;

    /// Return memory held in reusable caches to the device.
    fn release_cached(&self);

    /// Block until all previously queued work has completed.
    fn synchronize(&self) -> Result<()>;
}

/// Shape of an allocated tile.
pub trait TileBuffer {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;

    fn len(&self) -> usize {
        self.rows() * self.cols()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tile allocation and arithmetic for one element type.
///
/// Tiles are row-major and owned; dropping a tile releases its memory.
pub trait TileOps<E: Element>: DeviceContext {
    type Tile: TileBuffer;

    /// Allocate a zero-initialised `rows`×`cols` tile.
    fn alloc_zeros(&self, rows: usize, cols: usize) -> Result<Self::Tile>;

    /// Allocate a `rows`×`cols` tile of independent uniform values in `[0, 1)`.
    fn alloc_uniform(&self, rows: usize, cols: usize) -> Result<Self::Tile>;

    /// Fused multiply-accumulate into an existing accumulator: `C ← C + A·B`.
    ///
    /// `a` is m×k, `b` is k×n and `c` is m×n; anything else is a
    /// [`DimensionMismatch`](crate::BenchError::DimensionMismatch).
    fn gemm_accumulate(&self, a: &Self::Tile, b: &Self::Tile, c: &mut Self::Tile) -> Result<()>;

    /// Force materialization of a tile.
    ///
    /// Waits for the work producing `tile`, reduces it to a scalar and
    /// passes the scalar through [`std::hint::black_box`], so the producing
    /// computation cannot be elided. The scalar is returned for reporting
    /// only; its value carries no meaning.
    fn materialize(&self, tile: &Self::Tile) -> Result<f64>;
}

/// A device that supports every precision the benchmark can resolve to.
pub trait GemmDevice: TileOps<f32> + TileOps<f16> + TileOps<bf16> {}

impl<D> GemmDevice for D where D: TileOps<f32> + TileOps<f16> + TileOps<bf16> {}

/// Sample free and total memory after releasing cached allocations.
///
/// Releasing first keeps a previous run's cached buffers from being
/// reported as used.
pub fn sample_memory<D: DeviceContext + ?Sized>(device: &D) -> Result<MemorySnapshot> {
    device.release_cached();
    let snapshot = device.memory_info()?;
    log::debug!(
        "memory snapshot: free={} total={}",
        snapshot.free_bytes,
        snapshot.total_bytes
    );
    Ok(snapshot)
}

/// Validate the operand shapes of `C ← C + A·B`, returning `(m, n, k)`.
pub(crate) fn check_gemm_shapes<T: TileBuffer>(a: &T, b: &T, c: &T) -> Result<(usize, usize, usize)> {
    let (m, k) = (a.rows(), a.cols());
    let n = b.cols();
    if b.rows() != k || c.rows() != m || c.cols() != n {
        return Err(crate::error::BenchError::DimensionMismatch(format!(
            "A is {}x{}, B is {}x{}, C is {}x{}",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols(),
            c.rows(),
            c.cols()
        )));
    }
    Ok((m, n, k))
}
