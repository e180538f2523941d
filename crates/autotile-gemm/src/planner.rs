//! Tile planning: decide between one-shot and tiled execution from free memory.
//!
//! A tiled GEMM keeps three tiles resident at once (A, B and the C
//! accumulator), so a square tile of side `t` with element width `w` needs
//!
//! ```text
//! working_set(t) = 3 · t² · w   bytes
//! ```
//!
//! The usable budget is `free · safety_margin`; the margin reserves headroom
//! for workspace the GEMM primitive allocates and this model does not see.
//!
//! | Case | Tile size | Budget check |
//! |------|-----------|--------------|
//! | forced tile `f` | `min(N, f)` | none (user override) |
//! | derived | `min(N, max(512, ⌊√(budget / 3w)⌋))` | may fail only through the 512 floor |
//!
//! One-shot execution is feasible when `working_set(N) ≤ budget`.
//!
//! The 512 floor keeps per-tile overhead from dominating on nearly-full
//! devices. When the floor lifts a tile above the budget the plan is still
//! returned, marked `within_budget = false`, and a warning is logged; the run
//! may then fail with an allocation error, which is fatal.

use crate::device::{sample_memory, DeviceContext, MemorySnapshot};
use crate::error::{BenchError, Result};

/// Smallest derived tile side.
pub const MIN_TILE: usize = 512;

/// Tiles resident at once in a tiled run (A, B, C).
pub const RESIDENT_TILES: u128 = 3;

/// Outcome of a planning decision. Recomputed for every invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePlan {
    /// Side of the square tiles, `1 ≤ tile_size ≤ N`.
    pub tile_size: usize,
    /// Whether the full problem fits the budget as a single multiply.
    pub one_shot_feasible: bool,
    /// Whether `tile_size` came from a user override.
    pub forced: bool,
    /// Whether the tile working set fits the budget.
    pub within_budget: bool,
    /// Usable bytes: `free · safety_margin`, truncated.
    pub budget_bytes: u64,
    /// Memory sample the plan was derived from.
    pub snapshot: MemorySnapshot,
}

/// Bytes resident for three `tile`×`tile` tiles of `element_width` bytes.
pub fn working_set_bytes(tile: usize, element_width: usize) -> u128 {
    RESIDENT_TILES
        .saturating_mul(tile as u128)
        .saturating_mul(tile as u128)
        .saturating_mul(element_width as u128)
}

/// Largest tile side whose working set fits `budget`, before clamping.
pub fn max_tile_for_budget(budget: f64, element_width: usize) -> usize {
    let side = (budget / (RESIDENT_TILES as f64 * element_width as f64)).sqrt();
    side.floor() as usize
}

fn validate(n: usize, element_width: usize, safety_margin: f64, forced: Option<usize>) -> Result<()> {
    if n == 0 {
        return Err(BenchError::InvalidConfig("problem size must be positive".to_string()));
    }
    if element_width == 0 {
        return Err(BenchError::InvalidConfig("element width must be positive".to_string()));
    }
    if !(safety_margin > 0.0 && safety_margin <= 1.0) {
        return Err(BenchError::InvalidConfig(format!(
            "safety margin must be in (0, 1], got {}",
            safety_margin
        )));
    }
    if forced == Some(0) {
        return Err(BenchError::InvalidConfig("forced tile size must be positive".to_string()));
    }
    Ok(())
}

/// Plan against an already-sampled memory snapshot.
pub fn plan_from_snapshot(
    snapshot: MemorySnapshot,
    n: usize,
    element_width: usize,
    safety_margin: f64,
    forced_tile: Option<usize>,
) -> Result<TilePlan> {
    validate(n, element_width, safety_margin, forced_tile)?;
    Ok(plan_checked(snapshot, n, element_width, safety_margin, forced_tile))
}

fn plan_checked(
    snapshot: MemorySnapshot,
    n: usize,
    element_width: usize,
    safety_margin: f64,
    forced_tile: Option<usize>,
) -> TilePlan {
    let budget = snapshot.free_bytes as f64 * safety_margin;
    let one_shot_feasible = working_set_bytes(n, element_width) as f64 <= budget;

    let tile_size = match forced_tile {
        Some(forced) => forced.min(n),
        None => max_tile_for_budget(budget, element_width).max(MIN_TILE).min(n),
    };
    let within_budget = working_set_bytes(tile_size, element_width) as f64 <= budget;

    let plan = TilePlan {
        tile_size,
        one_shot_feasible,
        forced: forced_tile.is_some(),
        within_budget,
        budget_bytes: budget as u64,
        snapshot,
    };

    log::debug!(
        "plan: n={} width={} margin={} free={} -> tile={} one_shot={} forced={}",
        n,
        element_width,
        safety_margin,
        snapshot.free_bytes,
        plan.tile_size,
        plan.one_shot_feasible,
        plan.forced
    );
    if !within_budget {
        log::warn!(
            "tile {} needs {} bytes for 3 tiles but the budget is {} bytes ({})",
            tile_size,
            working_set_bytes(tile_size, element_width),
            plan.budget_bytes,
            if plan.forced {
                "forced tile overrides the safety margin"
            } else {
                "raised to the minimum tile size"
            }
        );
    }

    plan
}

/// Sample device memory and plan the tile size.
///
/// Cached device memory is released before sampling, so the decision
/// reflects memory actually available to this run.
pub fn plan_tile<D: DeviceContext + ?Sized>(
    device: &D,
    n: usize,
    element_width: usize,
    safety_margin: f64,
    forced_tile: Option<usize>,
) -> Result<TilePlan> {
    validate(n, element_width, safety_margin, forced_tile)?;
    let snapshot = sample_memory(device)?;
    Ok(plan_checked(snapshot, n, element_width, safety_margin, forced_tile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, TrackingDevice};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn snapshot(free_bytes: u64) -> MemorySnapshot {
        MemorySnapshot {
            free_bytes,
            total_bytes: free_bytes.max(GIB),
        }
    }

    #[test]
    fn test_small_problem_fits_one_shot() {
        let plan = plan_from_snapshot(snapshot(16 * GIB), 1024, 4, 0.5, None).unwrap();
        assert!(plan.one_shot_feasible);
        assert_eq!(plan.tile_size, 1024);
        assert!(plan.within_budget);
        assert!(!plan.forced);
    }

    #[test]
    fn test_huge_problem_is_tiled() {
        let plan = plan_from_snapshot(snapshot(24 * GIB), 200_000, 4, 0.55, None).unwrap();
        assert!(!plan.one_shot_feasible);
        // floor(sqrt(24 GiB * 0.55 / 12))
        let expected = ((24 * GIB) as f64 * 0.55 / 12.0).sqrt().floor() as usize;
        assert_eq!(plan.tile_size, expected);
        assert!(plan.tile_size >= MIN_TILE && plan.tile_size <= 200_000);
        assert!(plan.within_budget);
    }

    #[test]
    fn test_floor_applies_when_memory_is_scarce() {
        // 1 MiB free: the raw tile would be ~209.
        let plan = plan_from_snapshot(snapshot(1024 * 1024), 100_000, 4, 0.5, None).unwrap();
        assert_eq!(plan.tile_size, MIN_TILE);
        assert!(!plan.within_budget);
    }

    #[test]
    fn test_small_n_caps_floor() {
        let plan = plan_from_snapshot(snapshot(1024), 300, 4, 1.0, None).unwrap();
        assert_eq!(plan.tile_size, 300);
        assert!(!plan.one_shot_feasible);
    }

    #[test]
    fn test_forced_tile_clamped_to_n() {
        let plan = plan_from_snapshot(snapshot(16 * GIB), 8000, 4, 0.5, Some(10_000)).unwrap();
        assert_eq!(plan.tile_size, 8000);
        assert!(plan.forced);
    }

    #[test]
    fn test_forced_tile_ignores_budget() {
        let plan = plan_from_snapshot(snapshot(1024), 8000, 4, 0.5, Some(4096)).unwrap();
        assert_eq!(plan.tile_size, 4096);
        assert!(!plan.within_budget);
    }

    #[test]
    fn test_forced_tile_below_floor_kept() {
        let plan = plan_from_snapshot(snapshot(16 * GIB), 8000, 2, 0.5, Some(100)).unwrap();
        assert_eq!(plan.tile_size, 100);
    }

    #[test]
    fn test_feasibility_boundary_is_inclusive() {
        // 3 * 1000² * 4 = 12_000_000 bytes exactly.
        let plan = plan_from_snapshot(snapshot(12_000_000), 1000, 4, 1.0, None).unwrap();
        assert!(plan.one_shot_feasible);
        let plan = plan_from_snapshot(snapshot(11_999_999), 1000, 4, 1.0, None).unwrap();
        assert!(!plan.one_shot_feasible);
    }

    #[test]
    fn test_invalid_inputs() {
        let snap = snapshot(GIB);
        assert!(plan_from_snapshot(snap, 0, 4, 0.5, None).is_err());
        assert!(plan_from_snapshot(snap, 10, 0, 0.5, None).is_err());
        assert!(plan_from_snapshot(snap, 10, 4, 0.0, None).is_err());
        assert!(plan_from_snapshot(snap, 10, 4, 1.5, None).is_err());
        assert!(plan_from_snapshot(snap, 10, 4, f64::NAN, None).is_err());
        assert!(plan_from_snapshot(snap, 10, 4, 0.5, Some(0)).is_err());
        assert!(plan_from_snapshot(snap, 10, 4, 1.0, None).is_ok());
    }

    #[test]
    fn test_plan_tile_rejects_before_sampling() {
        let dev = TrackingDevice::new(GIB, GIB);
        assert!(plan_tile(&dev, 1024, 4, 1.5, None).is_err());
        assert!(plan_tile(&dev, 1024, 4, 0.5, Some(0)).is_err());
        assert!(dev.events().is_empty());

        plan_tile(&dev, 1024, 4, 0.5, None).unwrap();
        assert_eq!(dev.events(), vec![Event::ReleaseCached]);
    }

    #[test]
    fn test_working_set_no_overflow() {
        assert_eq!(working_set_bytes(200_000, 4), 480_000_000_000);
        assert_eq!(working_set_bytes(usize::MAX, 4), u128::MAX);
    }

    #[test]
    fn test_max_tile_for_budget() {
        assert_eq!(max_tile_for_budget(12.0 * 512.0 * 512.0, 4), 512);
        assert_eq!(max_tile_for_budget(0.0, 2), 0);
    }
}
