//! Throughput and reporting helpers.

use crate::engine::RunResult;
use std::fmt;

/// FLOPs of an N×N×N GEMM: N³ multiply-adds at 2 FLOPs each.
pub fn gemm_flops(n: usize) -> f64 {
    let n = n as f64;
    2.0 * n * n * n
}

/// Achieved FLOP/s for an N×N×N GEMM taking `elapsed_secs`.
///
/// A zero (or negative) duration yields `f64::INFINITY`.
pub fn compute_throughput(n: usize, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return f64::INFINITY;
    }
    gemm_flops(n) / elapsed_secs
}

/// A FLOP/s rate, displayed with an auto-scaled unit.
///
/// ```
/// use autotile_gemm::FlopRate;
///
/// assert_eq!(FlopRate(2.5e12).to_string(), "2.50 TFLOPS");
/// assert_eq!(FlopRate(3.0e9).to_string(), "3.00 GFLOPS");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct FlopRate(pub f64);

impl FlopRate {
    /// Rate of an N×N×N GEMM taking `elapsed_secs`.
    pub fn of(n: usize, elapsed_secs: f64) -> Self {
        FlopRate(compute_throughput(n, elapsed_secs))
    }

    pub fn tflops(self) -> f64 {
        self.0 / 1e12
    }

    pub fn gflops(self) -> f64 {
        self.0 / 1e9
    }
}

impl fmt::Display for FlopRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1e12 {
            write!(f, "{:.2} TFLOPS", self.tflops())
        } else {
            write!(f, "{:.2} GFLOPS", self.gflops())
        }
    }
}

/// The representative run: minimum elapsed time, first on ties.
pub fn best_run(runs: &[RunResult]) -> Option<&RunResult> {
    runs.iter().reduce(|best, run| {
        if run.elapsed < best.elapsed {
            run
        } else {
            best
        }
    })
}

/// Format a byte count with 1024-based units and two decimals.
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} PB", value)
}
