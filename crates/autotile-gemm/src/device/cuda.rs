//! CUDA device via `cudarc`: cuBLAS GEMM, cuRAND fill, driver memory queries.
//!
//! cuRAND has no 16-bit generators, so f16 and bf16 tiles are filled by a
//! small NVRTC-compiled kernel. Every tile draws a fresh seed and is
//! generated on the device, never copied from the host.

use super::{check_gemm_shapes, DeviceContext, DeviceInfo, MemorySnapshot, TileBuffer, TileOps};
use crate::error::{BenchError, Result};
use crate::precision::Element;
use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::{CudaBlas, Gemm, GemmConfig};
use cudarc::curand::CudaRng;
use cudarc::driver::sys::{CUdevice_attribute, CUresult};
use cudarc::driver::{CudaSlice, DeviceRepr, DriverError, LaunchAsync, LaunchConfig, ValidAsZeroBits};
use half::{bf16, f16};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Seed for cuRAND and the first half-precision tile.
const CUDA_SEED: u64 = 0x5EED_C0DA;

const UNIFORM_MODULE: &str = "autotile_uniform";
const UNIFORM_KERNELS: [&str; 2] = ["uniform_f16", "uniform_bf16"];
const UNIFORM_BLOCK: u32 = 256;
const UNIFORM_MAX_GRID: u64 = 1 << 20;

/// Uniform `[0, 1)` fills for 16-bit element types, written as raw bits.
const UNIFORM_SRC: &str = r#"
__device__ unsigned int uniform_f32_bits(unsigned long long seed, unsigned long long i) {
    unsigned long long z = seed + 0x9E3779B97F4A7C15ULL * (i + 1ULL);
    z = (z ^ (z >> 30)) * 0xBF58476D1CE4E5B9ULL;
    z = (z ^ (z >> 27)) * 0x94D049BB133111EBULL;
    z ^= z >> 31;
    union { float f; unsigned int u; } v;
    v.f = (float)(z >> 40) * (1.0f / 16777216.0f);
    return v.u;
}

extern "C" __global__ void uniform_f16(unsigned short* dst, unsigned long long n, unsigned long long seed) {
    unsigned long long stride = (unsigned long long)blockDim.x * gridDim.x;
    for (unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x; i < n; i += stride) {
        unsigned int b = uniform_f32_bits(seed, i);
        int e = (int)((b >> 23) & 0xffu) - 112;
        dst[i] = e > 0 ? (unsigned short)((e << 10) | ((b >> 13) & 0x3ffu)) : (unsigned short)0;
    }
}

extern "C" __global__ void uniform_bf16(unsigned short* dst, unsigned long long n, unsigned long long seed) {
    unsigned long long stride = (unsigned long long)blockDim.x * gridDim.x;
    for (unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x; i < n; i += stride) {
        dst[i] = (unsigned short)(uniform_f32_bits(seed, i) >> 16);
    }
}
"#;

fn device_err<E: std::fmt::Debug>(err: E) -> BenchError {
    BenchError::Device(format!("{:?}", err))
}

/// A row-major tile in device memory.
pub struct CudaTile<T: DeviceRepr> {
    data: CudaSlice<T>,
    rows: usize,
    cols: usize,
}

impl<T: DeviceRepr> TileBuffer for CudaTile<T> {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }
}

/// A CUDA GPU.
pub struct CudaDevice {
    device: Arc<cudarc::driver::CudaDevice>,
    blas: CudaBlas,
    rng: CudaRng,
    seed: AtomicU64,
    ordinal: usize,
}

impl CudaDevice {
    /// Acquire the GPU with the given ordinal.
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = cudarc::driver::CudaDevice::new(ordinal).map_err(|e| {
            BenchError::DeviceUnavailable(format!("CUDA device {}: {:?}", ordinal, e))
        })?;
        let blas = CudaBlas::new(device.clone()).map_err(device_err)?;
        let rng = CudaRng::new(CUDA_SEED, device.clone()).map_err(device_err)?;
        let ptx = cudarc::nvrtc::compile_ptx(UNIFORM_SRC).map_err(device_err)?;
        device
            .load_ptx(ptx, UNIFORM_MODULE, &UNIFORM_KERNELS)
            .map_err(device_err)?;
        Ok(Self {
            device,
            blas,
            rng,
            seed: AtomicU64::new(CUDA_SEED),
            ordinal,
        })
    }

    fn next_seed(&self) -> u64 {
        self.seed.fetch_add(1, Ordering::Relaxed)
    }

    fn attribute(&self, attr: CUdevice_attribute) -> Option<i32> {
        self.device.attribute(attr).ok()
    }

    fn oom_or_device_err(&self, err: DriverError, bytes: u64) -> BenchError {
        if err.0 == CUresult::CUDA_ERROR_OUT_OF_MEMORY {
            let free_bytes = self.memory_info().map(|s| s.free_bytes).unwrap_or(0);
            BenchError::AllocationFailure {
                requested_bytes: bytes,
                free_bytes,
            }
        } else {
            device_err(err)
        }
    }

    fn zeros_impl<T>(&self, rows: usize, cols: usize) -> Result<CudaTile<T>>
    where
        T: Element + DeviceRepr + ValidAsZeroBits,
    {
        let len = rows * cols;
        let data = self
            .device
            .alloc_zeros::<T>(len)
            .map_err(|e| self.oom_or_device_err(e, (len * T::WIDTH) as u64))?;
        Ok(CudaTile { data, rows, cols })
    }

    fn curand_uniform(&self, rows: usize, cols: usize) -> Result<CudaTile<f32>> {
        let mut tile = self.zeros_impl::<f32>(rows, cols)?;
        self.rng
            .fill_with_uniform(&mut tile.data)
            .map_err(device_err)?;
        Ok(tile)
    }

    fn half_uniform<T>(&self, rows: usize, cols: usize, kernel: &str) -> Result<CudaTile<T>>
    where
        T: Element + DeviceRepr + ValidAsZeroBits,
    {
        let mut tile = self.zeros_impl::<T>(rows, cols)?;
        let len = (rows * cols) as u64;
        if len == 0 {
            return Ok(tile);
        }
        let func = self
            .device
            .get_func(UNIFORM_MODULE, kernel)
            .ok_or_else(|| BenchError::Device(format!("kernel {} not loaded", kernel)))?;
        let blocks = len.div_ceil(UNIFORM_BLOCK as u64).min(UNIFORM_MAX_GRID) as u32;
        let cfg = LaunchConfig {
            grid_dim: (blocks, 1, 1),
            block_dim: (UNIFORM_BLOCK, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe { func.launch(cfg, (&mut tile.data, len, self.next_seed())) }.map_err(device_err)?;
        Ok(tile)
    }

    fn uniform_f16(&self, rows: usize, cols: usize) -> Result<CudaTile<f16>> {
        self.half_uniform(rows, cols, "uniform_f16")
    }

    fn uniform_bf16(&self, rows: usize, cols: usize) -> Result<CudaTile<bf16>> {
        self.half_uniform(rows, cols, "uniform_bf16")
    }

    fn gemm_impl<T>(&self, a: &CudaTile<T>, b: &CudaTile<T>, c: &mut CudaTile<T>) -> Result<()>
    where
        T: Element + DeviceRepr,
        CudaBlas: Gemm<T>,
    {
        let (m, n, k) = check_gemm_shapes(a, b, c)?;
        // Row-major C = A·B is column-major Cᵀ = Bᵀ·Aᵀ.
        let cfg = GemmConfig {
            transa: cublasOperation_t::CUBLAS_OP_N,
            transb: cublasOperation_t::CUBLAS_OP_N,
            m: n as i32,
            n: m as i32,
            k: k as i32,
            alpha: T::from_f32(1.0),
            lda: n as i32,
            ldb: k as i32,
            beta: T::from_f32(1.0),
            ldc: n as i32,
        };
        unsafe { self.blas.gemm(cfg, &b.data, &a.data, &mut c.data) }.map_err(device_err)
    }

    fn materialize_impl<T>(&self, tile: &CudaTile<T>) -> Result<f64>
    where
        T: Element + DeviceRepr,
    {
        self.synchronize()?;
        let head = self
            .device
            .dtoh_sync_copy(&tile.data.slice(0..1))
            .map_err(device_err)?;
        let value = head.first().map_or(0.0, |v| v.to_f32() as f64);
        Ok(std::hint::black_box(value))
    }
}

impl DeviceContext for CudaDevice {
    fn info(&self) -> DeviceInfo {
        let name = self
            .device
            .name()
            .unwrap_or_else(|_| format!("CUDA device {}", self.ordinal));
        let major = self.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR);
        let minor = self.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR);
        let capability = match (major, minor) {
            (Some(major), Some(minor)) => format!("cc {}.{}", major, minor),
            _ => "cc unknown".to_string(),
        };
        DeviceInfo { name, capability }
    }

    fn memory_info(&self) -> Result<MemorySnapshot> {
        self.device.bind_to_thread().map_err(device_err)?;
        let (free, total) = cudarc::driver::result::mem_get_info().map_err(device_err)?;
        Ok(MemorySnapshot {
            free_bytes: free as u64,
            total_bytes: total as u64,
        })
    }

    fn release_cached(&self) {
        // Stream-ordered frees return to the driver pool once the stream drains.
        if let Err(e) = self.device.synchronize() {
            log::warn!("CUDA synchronize during cache release failed: {:?}", e);
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.device.synchronize().map_err(device_err)
    }
}

/// Implements [`TileOps`] for each element type cuBLAS supports.
macro_rules! impl_cuda_tile_ops {
    ($($ty:ty => $fill:ident),* $(,)?) => {
        $(
            impl TileOps<$ty> for CudaDevice {
                type Tile = CudaTile<$ty>;

                fn alloc_zeros(&self, rows: usize, cols: usize) -> Result<Self::Tile> {
                    self.zeros_impl::<$ty>(rows, cols)
                }

                fn alloc_uniform(&self, rows: usize, cols: usize) -> Result<Self::Tile> {
                    self.$fill(rows, cols)
                }

                fn gemm_accumulate(
                    &self,
                    a: &Self::Tile,
                    b: &Self::Tile,
                    c: &mut Self::Tile,
                ) -> Result<()> {
                    self.gemm_impl::<$ty>(a, b, c)
                }

                fn materialize(&self, tile: &Self::Tile) -> Result<f64> {
                    self.materialize_impl::<$ty>(tile)
                }
            }
        )*
    };
}

impl_cuda_tile_ops! {
    f32 => curand_uniform,
    f16 => uniform_f16,
    bf16 => uniform_bf16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_gemm_accumulate() {
        let dev = match CudaDevice::new(0) {
            Ok(d) => d,
            Err(_) => {
                println!("CUDA not available, skipping test");
                return;
            }
        };

        let a: CudaTile<f32> = dev.zeros_impl(2, 3).unwrap();
        let b: CudaTile<f32> = dev.zeros_impl(3, 2).unwrap();
        let mut c: CudaTile<f32> = dev.zeros_impl(2, 2).unwrap();
        TileOps::<f32>::gemm_accumulate(&dev, &a, &b, &mut c).unwrap();
        assert_eq!(TileOps::<f32>::materialize(&dev, &c).unwrap(), 0.0);
    }

    #[test]
    fn test_cuda_half_tiles_generated_on_device_and_distinct() {
        let dev = match CudaDevice::new(0) {
            Ok(d) => d,
            Err(_) => {
                println!("CUDA not available, skipping test");
                return;
            }
        };

        let a = TileOps::<f16>::alloc_uniform(&dev, 64, 64).unwrap();
        let b = TileOps::<f16>::alloc_uniform(&dev, 64, 64).unwrap();
        let a = dev.device.dtoh_sync_copy(&a.data).unwrap();
        let b = dev.device.dtoh_sync_copy(&b.data).unwrap();
        assert_ne!(a, b);
        assert!(a.iter().all(|v| (0.0..1.0).contains(&v.to_f32())));

        let c = TileOps::<bf16>::alloc_uniform(&dev, 64, 64).unwrap();
        let c = dev.device.dtoh_sync_copy(&c.data).unwrap();
        assert!(c.iter().all(|v| (0.0..1.0).contains(&v.to_f32())));
        assert!(c.iter().any(|v| v.to_f32() > 0.0));
    }

    #[test]
    fn test_cuda_device_info() {
        let dev = match CudaDevice::new(0) {
            Ok(d) => d,
            Err(_) => {
                println!("CUDA not available, skipping test");
                return;
            }
        };

        let info = dev.info();
        println!("CUDA device: {}", info);
        assert!(!info.name.is_empty());
        assert!(dev.memory_info().unwrap().total_bytes > 0);
    }
}
