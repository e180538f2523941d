//! An allocation-tracking device double.
//!
//! [`TrackingDevice`] holds no data. It reports a configured amount of
//! memory, records every operation the engine performs on it, and keeps
//! count of resident elements, so the memory discipline of a run can be
//! checked at sizes no real machine could hold:
//!
//! ```
//! use autotile_gemm::engine::run_tiled;
//! use autotile_gemm::testing::TrackingDevice;
//!
//! let device = TrackingDevice::new(1 << 40, 1 << 40);
//! run_tiled::<f32, _>(&device, 2000, 512).unwrap();
//! assert!(device.peak_resident_elements() <= 3 * 512 * 512);
//! ```

use crate::device::{check_gemm_shapes, DeviceContext, DeviceInfo, MemorySnapshot, TileBuffer, TileOps};
use crate::error::{BenchError, Result};
use crate::precision::Element;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Alloc { rows: usize, cols: usize, bytes: u64 },
    Free { rows: usize, cols: usize },
    Gemm { m: usize, n: usize, k: usize },
    Synchronize,
    ReleaseCached,
    Materialize { rows: usize, cols: usize },
}

#[derive(Debug, Default)]
struct Ledger {
    events: Vec<Event>,
    free_bytes: u64,
    resident_bytes: u64,
    resident_elements: u64,
    peak_resident_elements: u64,
    gemm_count: usize,
}

impl Ledger {
    fn free(&mut self, rows: usize, cols: usize, bytes: u64) {
        self.resident_bytes = self.resident_bytes.saturating_sub(bytes);
        self.resident_elements = self.resident_elements.saturating_sub((rows * cols) as u64);
        self.events.push(Event::Free { rows, cols });
    }
}

type SharedLedger = Arc<Mutex<Ledger>>;

fn lock(ledger: &SharedLedger) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A tile that exists only in the ledger.
#[derive(Debug)]
pub struct TrackingTile {
    rows: usize,
    cols: usize,
    bytes: u64,
    ledger: SharedLedger,
}

impl TileBuffer for TrackingTile {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }
}

impl Drop for TrackingTile {
    fn drop(&mut self) {
        lock(&self.ledger).free(self.rows, self.cols, self.bytes);
    }
}

/// A device with configurable memory that records what runs on it.
///
/// Allocations fail with [`BenchError::AllocationFailure`] once the bytes
/// held by live tiles would exceed the configured free memory.
#[derive(Debug, Clone)]
pub struct TrackingDevice {
    total_bytes: u64,
    ledger: SharedLedger,
}

impl TrackingDevice {
    pub fn new(free_bytes: u64, total_bytes: u64) -> Self {
        let ledger = Ledger {
            free_bytes,
            ..Ledger::default()
        };
        Self {
            total_bytes,
            ledger: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Change the free memory reported by subsequent queries.
    pub fn set_free_bytes(&self, free_bytes: u64) {
        lock(&self.ledger).free_bytes = free_bytes;
    }

    /// Every operation recorded so far, in order.
    pub fn events(&self) -> Vec<Event> {
        lock(&self.ledger).events.clone()
    }

    pub fn gemm_count(&self) -> usize {
        lock(&self.ledger).gemm_count
    }

    pub fn resident_elements(&self) -> u64 {
        lock(&self.ledger).resident_elements
    }

    /// Highest number of elements resident at once.
    pub fn peak_resident_elements(&self) -> u64 {
        lock(&self.ledger).peak_resident_elements
    }

    /// Forget recorded events and the peak; live tiles stay accounted.
    pub fn reset(&self) {
        let mut ledger = lock(&self.ledger);
        ledger.events.clear();
        ledger.gemm_count = 0;
        ledger.peak_resident_elements = ledger.resident_elements;
    }

    fn record(&self, event: Event) {
        lock(&self.ledger).events.push(event);
    }
}

impl DeviceContext for TrackingDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "tracking device".to_string(),
            capability: "no compute".to_string(),
        }
    }

    fn memory_info(&self) -> Result<MemorySnapshot> {
        let ledger = lock(&self.ledger);
        Ok(MemorySnapshot {
            free_bytes: ledger.free_bytes.saturating_sub(ledger.resident_bytes),
            total_bytes: self.total_bytes,
        })
    }

    fn release_cached(&self) {
        self.record(Event::ReleaseCached);
    }

    fn synchronize(&self) -> Result<()> {
        self.record(Event::Synchronize);
        Ok(())
    }
}

impl<E: Element> TileOps<E> for TrackingDevice {
    type Tile = TrackingTile;

    fn alloc_zeros(&self, rows: usize, cols: usize) -> Result<Self::Tile> {
        let elements = (rows * cols) as u64;
        let bytes = elements.saturating_mul(E::WIDTH as u64);

        let mut ledger = lock(&self.ledger);
        let available = ledger.free_bytes.saturating_sub(ledger.resident_bytes);
        if bytes > available {
            return Err(BenchError::AllocationFailure {
                requested_bytes: bytes,
                free_bytes: available,
            });
        }
        ledger.resident_bytes += bytes;
        ledger.resident_elements += elements;
        ledger.peak_resident_elements = ledger.peak_resident_elements.max(ledger.resident_elements);
        ledger.events.push(Event::Alloc { rows, cols, bytes });
        drop(ledger);

        Ok(TrackingTile {
            rows,
            cols,
            bytes,
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn alloc_uniform(&self, rows: usize, cols: usize) -> Result<Self::Tile> {
        TileOps::<E>::alloc_zeros(self, rows, cols)
    }

    fn gemm_accumulate(&self, a: &Self::Tile, b: &Self::Tile, c: &mut Self::Tile) -> Result<()> {
        let (m, n, k) = check_gemm_shapes(a, b, c)?;
        let mut ledger = lock(&self.ledger);
        ledger.gemm_count += 1;
        ledger.events.push(Event::Gemm { m, n, k });
        Ok(())
    }

    fn materialize(&self, tile: &Self::Tile) -> Result<f64> {
        self.record(Event::Materialize {
            rows: tile.rows,
            cols: tile.cols,
        });
        Ok(std::hint::black_box(0.0))
    }
}
