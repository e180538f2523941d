//! Execution engine: the one-shot and tiled GEMM runs.
//!
//! # One-shot
//!
//! ```text
//! WarmUp    A, B ← uniform(N×N); W ← A·B; sync; release W
//! Timed     clock; C ← A·B; sync; clock
//! Teardown  materialize C; release A, B, C; release cache
//! ```
//!
//! # Tiled
//!
//! The N×N operands exist only as an addressing scheme. Every tile is
//! generated immediately before use and released right after its last use:
//!
//! ```text
//! WarmUp    one t×t multiply; sync; release
//! clock
//! for i in blocks(N, t)                      m = extent(i)
//!   for j in blocks(N, t)                    n = extent(j)
//!     C_ij ← zeros(m×n)
//!     for k in blocks(N, t)                  kb = extent(k)
//!       A_ik ← uniform(m×kb); B_kj ← uniform(kb×n)
//!       C_ij ← C_ij + A_ik·B_kj
//!       release A_ik, B_kj
//!     materialize C_ij; release C_ij
//! sync; clock; release cache
//! ```
//!
//! At most one accumulator and one input pair are resident at any instant,
//! so resident elements never exceed `3·t²`.
//!
//! Any allocation failure aborts the run; nothing is retried.

use crate::device::TileOps;
use crate::error::{BenchError, Result};
use crate::planner::TilePlan;
use crate::precision::Element;
use crate::tiling::{output_regions, BlockIter};
use std::fmt;
use std::time::{Duration, Instant};

/// Side of the device warm-up multiply run before the repetitions.
pub const DEVICE_WARMUP_DIM: usize = 1024;

/// Execution strategy of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The whole N×N×N multiply as a single primitive call.
    OneShot,
    /// Memory-bounded tile-by-tile accumulation.
    Tiled,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::OneShot => "one-shot",
            ExecutionMode::Tiled => "tiled",
        })
    }
}

/// Measurement of one repetition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunResult {
    /// Time spent in the timed region only.
    pub elapsed: Duration,
    pub mode: ExecutionMode,
    /// Scalar produced by materializing the result tiles. Not meaningful.
    pub checksum: f64,
}

impl RunResult {
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Mode implied by a plan.
///
/// One-shot needs the full problem to fit the budget; a forced tile size
/// always selects tiled execution.
pub fn select_mode(plan: &TilePlan) -> ExecutionMode {
    if plan.one_shot_feasible && !plan.forced {
        ExecutionMode::OneShot
    } else {
        ExecutionMode::Tiled
    }
}

/// Run the multiply the way `plan` prescribes.
pub fn execute<E, D>(device: &D, n: usize, plan: &TilePlan) -> Result<RunResult>
where
    E: Element,
    D: TileOps<E> + ?Sized,
{
    match select_mode(plan) {
        ExecutionMode::OneShot => run_one_shot::<E, D>(device, n),
        ExecutionMode::Tiled => run_tiled::<E, D>(device, n, plan.tile_size),
    }
}

/// Side of the device warm-up for a plan.
///
/// The warm-up holds two square tiles, so it stays inside the memory the
/// plan itself will use: at most `1024`, and at most the tile side when
/// the run is tiled.
pub fn warm_up_dim(n: usize, plan: &TilePlan) -> usize {
    let side = match select_mode(plan) {
        ExecutionMode::OneShot => n,
        ExecutionMode::Tiled => plan.tile_size.min(n),
    };
    DEVICE_WARMUP_DIM.min(side).max(1)
}

/// One untimed `dim`-square multiply to bring the device up to speed
/// before measuring.
pub fn warm_up_device<E, D>(device: &D, dim: usize) -> Result<()>
where
    E: Element,
    D: TileOps<E> + ?Sized,
{
    let dim = dim.max(1);
    let warm = device.alloc_uniform(dim, dim)?;
    let mut out = device.alloc_zeros(dim, dim)?;
    device.gemm_accumulate(&warm, &warm, &mut out)?;
    device.synchronize()?;
    Ok(())
}

/// Multiply two full N×N matrices with a single primitive call.
pub fn run_one_shot<E, D>(device: &D, n: usize) -> Result<RunResult>
where
    E: Element,
    D: TileOps<E> + ?Sized,
{
    if n == 0 {
        return Err(BenchError::InvalidConfig("problem size must be positive".to_string()));
    }

    let a = device.alloc_uniform(n, n)?;
    let b = device.alloc_uniform(n, n)?;
    {
        let mut discarded = device.alloc_zeros(n, n)?;
        device.gemm_accumulate(&a, &b, &mut discarded)?;
        device.synchronize()?;
    }

    let start = Instant::now();
    let mut c = device.alloc_zeros(n, n)?;
    device.gemm_accumulate(&a, &b, &mut c)?;
    device.synchronize()?;
    let elapsed = start.elapsed();

    let checksum = device.materialize(&c)?;

    drop(a);
    drop(b);
    drop(c);
    device.release_cached();

    log::debug!("one-shot n={} took {:?}", n, elapsed);
    Ok(RunResult {
        elapsed,
        mode: ExecutionMode::OneShot,
        checksum,
    })
}

/// Multiply two virtual N×N matrices tile by tile.
///
/// `tile` is clamped to `n`.
pub fn run_tiled<E, D>(device: &D, n: usize, tile: usize) -> Result<RunResult>
where
    E: Element,
    D: TileOps<E> + ?Sized,
{
    if n == 0 || tile == 0 {
        return Err(BenchError::InvalidConfig(format!(
            "problem size and tile size must be positive (n={}, tile={})",
            n, tile
        )));
    }
    let tile = tile.min(n);

    device.synchronize()?;
    {
        let a0 = device.alloc_uniform(tile, tile)?;
        let b0 = device.alloc_uniform(tile, tile)?;
        let mut c0 = device.alloc_zeros(tile, tile)?;
        device.gemm_accumulate(&a0, &b0, &mut c0)?;
        device.synchronize()?;
    }

    let start = Instant::now();
    let mut checksum = 0.0;

    for region in output_regions(n, tile) {
        let mut c_ij = device.alloc_zeros(region.row_extent, region.col_extent)?;

        for (_, depth) in BlockIter::new(n, tile) {
            let a_ik = device.alloc_uniform(region.row_extent, depth)?;
            let b_kj = device.alloc_uniform(depth, region.col_extent)?;
            device.gemm_accumulate(&a_ik, &b_kj, &mut c_ij)?;
            drop(a_ik);
            drop(b_kj);
        }

        checksum += device.materialize(&c_ij)?;
        drop(c_ij);
        log::trace!("finished C tile {:?}", region);
    }

    device.synchronize()?;
    let elapsed = start.elapsed();
    device.release_cached();

    log::debug!("tiled n={} tile={} took {:?}", n, tile, elapsed);
    Ok(RunResult {
        elapsed,
        mode: ExecutionMode::Tiled,
        checksum,
    })
}
