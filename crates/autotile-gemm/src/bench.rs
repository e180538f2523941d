//! Benchmark orchestration: plan, warm up, repeat, keep the fastest run.

use crate::device::{GemmDevice, TileOps};
use crate::engine::{self, select_mode, ExecutionMode, RunResult};
use crate::error::{BenchError, Result};
use crate::metrics::{best_run, FlopRate};
use crate::planner::{plan_tile, TilePlan};
use crate::precision::{Element, Precision};
use half::{bf16, f16};

/// Default problem dimension.
pub const DEFAULT_SIZE: usize = 200_000;

/// Default fraction of free memory treated as usable.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.55;

/// An N×N×N GEMM at a given precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemSpec {
    pub size: usize,
    pub precision: Precision,
}

impl ProblemSpec {
    pub fn element_width(&self) -> usize {
        self.precision.element_width()
    }
}

/// Benchmark configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchConfig {
    /// Matrix dimension N.
    pub size: usize,
    pub precision: Precision,
    /// Number of timed repetitions.
    pub repeats: usize,
    /// Fraction of free memory in (0, 1] used as the budget.
    pub safety_margin: f64,
    /// Forced tile size; `None` derives it from free memory.
    pub tile: Option<usize>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            precision: Precision::F32,
            repeats: 1,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            tile: None,
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(BenchError::InvalidConfig("size must be positive".to_string()));
        }
        if self.repeats == 0 {
            return Err(BenchError::InvalidConfig("repeats must be positive".to_string()));
        }
        if self.tile == Some(0) {
            return Err(BenchError::InvalidConfig("tile size must be positive".to_string()));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(BenchError::InvalidConfig(format!(
                "safety margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        Ok(())
    }

    pub fn problem(&self) -> ProblemSpec {
        ProblemSpec {
            size: self.size,
            precision: self.precision,
        }
    }
}

/// Outcome of a full benchmark.
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub problem: ProblemSpec,
    pub plan: TilePlan,
    /// Mode every repetition ran in.
    pub mode: ExecutionMode,
    pub runs: Vec<RunResult>,
    /// Minimum elapsed run.
    pub best: RunResult,
}

impl BenchmarkReport {
    /// Throughput of the best run.
    pub fn best_rate(&self) -> FlopRate {
        FlopRate::of(self.problem.size, self.best.elapsed_secs())
    }

    /// Throughput of each run, in order.
    pub fn rates(&self) -> impl Iterator<Item = FlopRate> + '_ {
        self.runs
            .iter()
            .map(move |run| FlopRate::of(self.problem.size, run.elapsed_secs()))
    }
}

/// A configured benchmark bound to a device.
pub struct Benchmark<'d, D: ?Sized> {
    device: &'d D,
    config: BenchConfig,
}

impl<'d, D: GemmDevice + ?Sized> Benchmark<'d, D> {
    /// Validate `config` and bind it to `device`.
    pub fn new(device: &'d D, config: BenchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { device, config })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Sample memory and plan the tile size.
    pub fn plan(&self) -> Result<TilePlan> {
        plan_tile(
            self.device,
            self.config.size,
            self.config.precision.element_width(),
            self.config.safety_margin,
            self.config.tile,
        )
    }

    /// One untimed square multiply sized by [`engine::warm_up_dim`], so the
    /// warm-up never needs more memory than `plan`.
    pub fn warm_up(&self, plan: &TilePlan) -> Result<()> {
        let dim = engine::warm_up_dim(self.config.size, plan);
        match self.config.precision {
            Precision::F32 => engine::warm_up_device::<f32, D>(self.device, dim),
            Precision::F16 => engine::warm_up_device::<f16, D>(self.device, dim),
            Precision::BF16 => engine::warm_up_device::<bf16, D>(self.device, dim),
        }
    }

    /// Run the benchmark against a precomputed plan.
    ///
    /// `observer` is called with the 0-based index of each completed run.
    pub fn run_planned<F>(&self, plan: &TilePlan, observer: F) -> Result<BenchmarkReport>
    where
        F: FnMut(usize, &RunResult),
    {
        match self.config.precision {
            Precision::F32 => self.repeat::<f32, F>(plan, observer),
            Precision::F16 => self.repeat::<f16, F>(plan, observer),
            Precision::BF16 => self.repeat::<bf16, F>(plan, observer),
        }
    }

    /// Plan, warm up and run every repetition.
    pub fn run_with<F>(&self, observer: F) -> Result<BenchmarkReport>
    where
        F: FnMut(usize, &RunResult),
    {
        let plan = self.plan()?;
        self.warm_up(&plan)?;
        self.run_planned(&plan, observer)
    }

    pub fn run(&self) -> Result<BenchmarkReport> {
        self.run_with(|_, _| {})
    }

    fn repeat<E, F>(&self, plan: &TilePlan, mut observer: F) -> Result<BenchmarkReport>
    where
        E: Element,
        D: TileOps<E>,
        F: FnMut(usize, &RunResult),
    {
        let n = self.config.size;
        let mode = select_mode(plan);
        log::info!(
            "running {} {} GEMM n={} tile={} x{}",
            mode,
            E::PRECISION,
            n,
            plan.tile_size,
            self.config.repeats
        );

        let mut runs = Vec::with_capacity(self.config.repeats);
        for index in 0..self.config.repeats {
            let run = engine::execute::<E, D>(self.device, n, plan)?;
            log::debug!("run {}: {:.4}s [{}]", index + 1, run.elapsed_secs(), run.mode);
            observer(index, &run);
            runs.push(run);
        }

        let best = *best_run(&runs).ok_or_else(|| {
            BenchError::InvalidConfig("repeats must be positive".to_string())
        })?;
        self.device.release_cached();

        Ok(BenchmarkReport {
            problem: self.config.problem(),
            plan: *plan,
            mode,
            runs,
            best,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::testing::{Event, TrackingDevice};

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_default_config() {
        let config = BenchConfig::default();
        assert_eq!(config.size, 200_000);
        assert_eq!(config.precision, Precision::F32);
        assert_eq!(config.repeats, 1);
        assert_eq!(config.safety_margin, 0.55);
        assert_eq!(config.tile, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            BenchConfig { size: 0, ..BenchConfig::default() },
            BenchConfig { repeats: 0, ..BenchConfig::default() },
            BenchConfig { tile: Some(0), ..BenchConfig::default() },
            BenchConfig { safety_margin: 0.0, ..BenchConfig::default() },
            BenchConfig { safety_margin: 1.01, ..BenchConfig::default() },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(BenchError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_run_reports_every_repeat() {
        let dev = TrackingDevice::new(16 * GIB, 16 * GIB);
        let config = BenchConfig {
            size: 256,
            repeats: 3,
            ..BenchConfig::default()
        };
        let mut seen = Vec::new();
        let report = Benchmark::new(&dev, config)
            .unwrap()
            .run_with(|i, run| seen.push((i, run.mode)))
            .unwrap();

        assert_eq!(report.mode, ExecutionMode::OneShot);
        assert_eq!(report.runs.len(), 3);
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (2, ExecutionMode::OneShot));
        assert!(report.runs.iter().all(|r| r.elapsed >= report.best.elapsed));
        // Device warm-up + 3 × (warm-up + timed).
        assert_eq!(dev.gemm_count(), 1 + 3 * 2);
    }

    #[test]
    fn test_plan_samples_after_release() {
        let dev = TrackingDevice::new(16 * GIB, 16 * GIB);
        let bench = Benchmark::new(&dev, BenchConfig { size: 1024, ..BenchConfig::default() }).unwrap();
        bench.plan().unwrap();
        assert_eq!(dev.events(), vec![Event::ReleaseCached]);
    }

    #[test]
    fn test_warm_up_fits_exact_budget() {
        // Room for exactly three 512² f32 tiles and nothing more.
        let budget = 3 * 512 * 512 * 4;
        let dev = TrackingDevice::new(budget, budget);
        let config = BenchConfig {
            size: 100_000,
            safety_margin: 1.0,
            ..BenchConfig::default()
        };
        let bench = Benchmark::new(&dev, config).unwrap();
        let plan = bench.plan().unwrap();
        assert_eq!(plan.tile_size, 512);
        assert!(plan.within_budget);

        bench.warm_up(&plan).unwrap();
        assert!(dev.events().contains(&Event::Gemm { m: 512, n: 512, k: 512 }));
        assert!(dev.peak_resident_elements() <= 3 * 512 * 512);
        assert_eq!(dev.resident_elements(), 0);
    }

    #[test]
    fn test_replanning_follows_free_memory() {
        let dev = TrackingDevice::new(16 * GIB, 16 * GIB);
        let bench = Benchmark::new(&dev, BenchConfig { size: 20_000, ..BenchConfig::default() }).unwrap();

        // 3 · 20000² · 4 = 4.8 GB fits 0.55 · 16 GiB.
        let roomy = bench.plan().unwrap();
        assert_eq!(roomy.snapshot.free_bytes, 16 * GIB);
        assert!(roomy.one_shot_feasible);
        assert_eq!(roomy.tile_size, 20_000);

        dev.set_free_bytes(GIB);
        let tight = bench.plan().unwrap();
        assert_eq!(tight.snapshot.free_bytes, GIB);
        assert!(!tight.one_shot_feasible);
        assert!(tight.tile_size < roomy.tile_size);
        // ⌊√(0.55 · 1 GiB / 12)⌋
        assert_eq!(tight.tile_size, 7015);
        assert_eq!(
            dev.events(),
            vec![Event::ReleaseCached, Event::ReleaseCached]
        );
    }

    #[test]
    fn test_forced_tile_runs_tiled() {
        let dev = TrackingDevice::new(16 * GIB, 16 * GIB);
        let config = BenchConfig {
            size: 1000,
            tile: Some(400),
            ..BenchConfig::default()
        };
        let report = Benchmark::new(&dev, config).unwrap().run().unwrap();
        assert!(report.plan.one_shot_feasible);
        assert_eq!(report.mode, ExecutionMode::Tiled);
        assert_eq!(report.plan.tile_size, 400);
    }

    #[test]
    fn test_half_precision_on_host() {
        let dev = HostDevice::with_memory_limit(32 * 1024 * 1024).unwrap();
        let config = BenchConfig {
            size: 64,
            precision: Precision::BF16,
            repeats: 2,
            ..BenchConfig::default()
        };
        let report = Benchmark::new(&dev, config).unwrap().run().unwrap();
        assert_eq!(report.problem.element_width(), 2);
        assert_eq!(report.runs.len(), 2);
        assert!(report.best_rate().0 > 0.0);
        assert_eq!(dev.cached_bytes(), 0);
    }
}
