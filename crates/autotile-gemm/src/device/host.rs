//! CPU "device": system memory, a caching block allocator and the host GEMM.

use super::{check_gemm_shapes, DeviceContext, DeviceInfo, MemorySnapshot, TileOps};
use crate::error::{BenchError, Result};
use crate::kernels;
use crate::memory::{lock, BlockCache, SharedCache};
use crate::precision::Element;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::System;

pub use crate::memory::HostTile;

/// Default seed for tile contents.
const DEFAULT_SEED: u64 = 0x5EED_0F_7115;

/// The host CPU viewed as a compute device.
///
/// Without a limit, free and total memory come from the operating system.
/// With [`HostDevice::with_memory_limit`] the device behaves like a
/// fixed-capacity accelerator: total is the limit and free is the limit
/// minus everything allocated or cached through this device.
pub struct HostDevice {
    info: DeviceInfo,
    cache: SharedCache,
    seed: AtomicU64,
}

impl HostDevice {
    /// Acquire the host device, sized by system memory.
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Acquire the host device with a fixed memory capacity in bytes.
    pub fn with_memory_limit(limit_bytes: u64) -> Result<Self> {
        if limit_bytes == 0 {
            return Err(BenchError::InvalidConfig(
                "memory limit must be positive".to_string(),
            ));
        }
        Self::build(Some(limit_bytes))
    }

    /// Set the base seed for uniform tile contents.
    pub fn with_seed(self, seed: u64) -> Self {
        self.seed.store(seed, Ordering::Relaxed);
        self
    }

    fn build(limit: Option<u64>) -> Result<Self> {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        if sys.total_memory() == 0 {
            return Err(BenchError::DeviceUnavailable(
                "host memory could not be queried".to_string(),
            ));
        }

        let name = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "host CPU".to_string());
        let threads = sys.cpus().len().max(1);

        Ok(Self {
            info: DeviceInfo {
                name,
                capability: format!("{} threads", threads),
            },
            cache: Arc::new(Mutex::new(BlockCache::new(limit))),
            seed: AtomicU64::new(DEFAULT_SEED),
        })
    }

    /// Bytes currently held by live tiles.
    pub fn resident_bytes(&self) -> u64 {
        lock(&self.cache).resident_bytes()
    }

    /// Bytes parked in the reuse cache.
    pub fn cached_bytes(&self) -> u64 {
        lock(&self.cache).cached_bytes()
    }

    fn next_seed(&self) -> u64 {
        self.seed.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc<E: Element>(&self, rows: usize, cols: usize, zeroed: bool) -> Result<HostTile<E>> {
        let (mut data, recycled) = lock(&self.cache).acquire::<E>(rows * cols).map_err(|e| {
            log::debug!("host allocation of {}x{} {} failed: {}", rows, cols, E::PRECISION, e);
            e
        })?;
        if zeroed {
            if recycled {
                data.fill(E::ZERO);
            }
        } else {
            kernels::fill_uniform(&mut data, self.next_seed());
        }
        Ok(HostTile::new(data, rows, cols, Arc::clone(&self.cache)))
    }
}

impl DeviceContext for HostDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn memory_info(&self) -> Result<MemorySnapshot> {
        let cache = lock(&self.cache);
        if let Some(limit) = cache.limit() {
            return Ok(MemorySnapshot {
                free_bytes: limit.saturating_sub(cache.in_use()),
                total_bytes: limit,
            });
        }
        drop(cache);

        let mut sys = System::new();
        sys.refresh_memory();
        Ok(MemorySnapshot {
            free_bytes: sys.available_memory(),
            total_bytes: sys.total_memory(),
        })
    }

    fn release_cached(&self) {
        lock(&self.cache).release();
    }

    fn synchronize(&self) -> Result<()> {
        // Host kernels return only after completing.
        Ok(())
    }
}

impl<E: Element> TileOps<E> for HostDevice {
    type Tile = HostTile<E>;

    fn alloc_zeros(&self, rows: usize, cols: usize) -> Result<Self::Tile> {
        self.alloc(rows, cols, true)
    }

    fn alloc_uniform(&self, rows: usize, cols: usize) -> Result<Self::Tile> {
        self.alloc(rows, cols, false)
    }

    fn gemm_accumulate(&self, a: &Self::Tile, b: &Self::Tile, c: &mut Self::Tile) -> Result<()> {
        let (m, n, k) = check_gemm_shapes(a, b, c)?;
        kernels::gemm_accumulate(a.as_slice(), b.as_slice(), c.as_mut_slice(), m, n, k);
        Ok(())
    }

    fn materialize(&self, tile: &Self::Tile) -> Result<f64> {
        Ok(std::hint::black_box(kernels::mean(tile.as_slice())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TileBuffer;
    use half::{bf16, f16};

    const LIMIT: u64 = 64 * 1024 * 1024;

    fn device() -> HostDevice {
        HostDevice::with_memory_limit(LIMIT).unwrap()
    }

    fn zeros<E: Element>(dev: &HostDevice, rows: usize, cols: usize) -> HostTile<E> {
        TileOps::<E>::alloc_zeros(dev, rows, cols).unwrap()
    }

    fn uniform<E: Element>(dev: &HostDevice, rows: usize, cols: usize) -> HostTile<E> {
        TileOps::<E>::alloc_uniform(dev, rows, cols).unwrap()
    }

    #[test]
    fn test_limit_reports_total_and_free() {
        let dev = device();
        let snap = dev.memory_info().unwrap();
        assert_eq!(snap.total_bytes, LIMIT);
        assert_eq!(snap.free_bytes, LIMIT);

        let _tile = zeros::<f32>(&dev, 256, 256);
        let snap = dev.memory_info().unwrap();
        assert_eq!(snap.free_bytes, LIMIT - 256 * 256 * 4);
    }

    #[test]
    fn test_cached_memory_counts_until_released() {
        let dev = device();
        let tile = uniform::<f16>(&dev, 128, 128);
        drop(tile);
        assert_eq!(dev.resident_bytes(), 0);
        assert_eq!(dev.cached_bytes(), 128 * 128 * 2);
        assert_eq!(dev.memory_info().unwrap().free_bytes, LIMIT - 128 * 128 * 2);

        dev.release_cached();
        assert_eq!(dev.cached_bytes(), 0);
        assert_eq!(dev.memory_info().unwrap().free_bytes, LIMIT);
    }

    #[test]
    fn test_recycled_zero_tile_is_zeroed() {
        let dev = device();
        drop(uniform::<f32>(&dev, 32, 32));
        let tile = zeros::<f32>(&dev, 32, 32);
        assert_eq!(dev.cached_bytes(), 0);
        assert!(tile.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_uniform_tiles_differ() {
        let dev = device();
        let a = uniform::<f32>(&dev, 16, 16);
        let b = uniform::<f32>(&dev, 16, 16);
        assert_ne!(a.as_slice(), b.as_slice());
        assert!(a.as_slice().iter().all(|&v| (0.0..1.0).contains(&v)));
    }

    #[test]
    fn test_gemm_accumulate_ones() {
        let dev = device();
        let mut a = zeros::<f32>(&dev, 3, 4);
        let mut b = zeros::<f32>(&dev, 4, 2);
        a.as_mut_slice().fill(1.0);
        b.as_mut_slice().fill(1.0);
        let mut c = zeros::<f32>(&dev, 3, 2);

        TileOps::<f32>::gemm_accumulate(&dev, &a, &b, &mut c).unwrap();
        TileOps::<f32>::gemm_accumulate(&dev, &a, &b, &mut c).unwrap();
        assert!(c.as_slice().iter().all(|&v| v == 8.0));
        assert_eq!(c.as_slice()[2 * c.cols() + 1], 8.0);
        assert_eq!(TileOps::<f32>::materialize(&dev, &c).unwrap(), 8.0);
    }

    #[test]
    fn test_gemm_shape_mismatch() {
        let dev = device();
        let a = zeros::<bf16>(&dev, 3, 4);
        let b = zeros::<bf16>(&dev, 5, 2);
        let mut c = zeros::<bf16>(&dev, 3, 2);
        assert!(matches!(
            TileOps::<bf16>::gemm_accumulate(&dev, &a, &b, &mut c),
            Err(BenchError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_allocation_beyond_limit_fails() {
        let dev = HostDevice::with_memory_limit(1024).unwrap();
        assert!(matches!(
            TileOps::<f32>::alloc_zeros(&dev, 32, 32),
            Err(BenchError::AllocationFailure {
                requested_bytes: 4096,
                free_bytes: 1024
            })
        ));
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(matches!(
            HostDevice::with_memory_limit(0),
            Err(BenchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_info_is_populated() {
        let dev = device();
        let info = dev.info();
        assert!(!info.name.is_empty());
        assert!(info.capability.ends_with("threads"));
        let tile = zeros::<f32>(&dev, 2, 5);
        assert_eq!((tile.rows(), tile.cols()), (2, 5));
    }
}
