//! Host tile storage and the caching block allocator behind it.
//!
//! Released tiles hand their buffer back to a [`BlockCache`] keyed by
//! `(precision, length)`, so that the next tile of the same shape reuses it
//! instead of going back to the system allocator. Cached buffers still
//! count as used memory until [`BlockCache::release`] drops them, which is
//! why memory must be sampled only after releasing the cache.

use crate::device::TileBuffer;
use crate::error::{BenchError, Result};
use crate::precision::{Element, Precision};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Allocation accounting and the free-buffer cache of one host device.
#[derive(Default)]
pub(crate) struct BlockCache {
    buffers: HashMap<(Precision, usize), Vec<Box<dyn Any + Send>>>,
    resident_bytes: u64,
    cached_bytes: u64,
    limit: Option<u64>,
}

pub(crate) type SharedCache = Arc<Mutex<BlockCache>>;

pub(crate) fn lock(cache: &SharedCache) -> MutexGuard<'_, BlockCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

fn byte_len<E: Element>(len: usize) -> u64 {
    (len as u64).saturating_mul(E::WIDTH as u64)
}

impl BlockCache {
    pub(crate) fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Bytes held by live tiles plus bytes parked in the cache.
    pub(crate) fn in_use(&self) -> u64 {
        self.resident_bytes + self.cached_bytes
    }

    pub(crate) fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub(crate) fn cached_bytes(&self) -> u64 {
        self.cached_bytes
    }

    pub(crate) fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Obtain a buffer of `len` elements.
    ///
    /// Returns the buffer and whether it was recycled (recycled buffers hold
    /// stale contents).
    pub(crate) fn acquire<E: Element>(&mut self, len: usize) -> Result<(Vec<E>, bool)> {
        let bytes = byte_len::<E>(len);

        if let Some(buffer) = self.take_cached::<E>(len) {
            self.cached_bytes -= bytes;
            self.resident_bytes += bytes;
            return Ok((buffer, true));
        }

        if let Some(limit) = self.limit {
            if self.in_use().saturating_add(bytes) > limit && self.cached_bytes > 0 {
                // Cached buffers of other shapes are dropped before giving up.
                self.release();
            }
            if self.in_use().saturating_add(bytes) > limit {
                return Err(BenchError::AllocationFailure {
                    requested_bytes: bytes,
                    free_bytes: limit.saturating_sub(self.in_use()),
                });
            }
        }

        let mut buffer: Vec<E> = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| BenchError::AllocationFailure {
                requested_bytes: bytes,
                free_bytes: self.limit.map_or(0, |l| l.saturating_sub(self.in_use())),
            })?;
        buffer.resize(len, E::ZERO);
        self.resident_bytes += bytes;
        Ok((buffer, false))
    }

    fn take_cached<E: Element>(&mut self, len: usize) -> Option<Vec<E>> {
        let slot = self.buffers.get_mut(&(E::PRECISION, len))?;
        let boxed = slot.pop()?;
        boxed.downcast::<Vec<E>>().ok().map(|b| *b)
    }

    /// Park a released buffer for reuse.
    pub(crate) fn recycle<E: Element>(&mut self, buffer: Vec<E>) {
        let bytes = byte_len::<E>(buffer.len());
        self.resident_bytes = self.resident_bytes.saturating_sub(bytes);
        self.cached_bytes += bytes;
        self.buffers
            .entry((E::PRECISION, buffer.len()))
            .or_default()
            .push(Box::new(buffer));
    }

    /// Drop every cached buffer.
    pub(crate) fn release(&mut self) {
        self.buffers.clear();
        self.cached_bytes = 0;
    }
}

/// A row-major tile in host memory.
///
/// Dropping the tile returns its buffer to the owning device's cache.
pub struct HostTile<E: Element> {
    data: Vec<E>,
    rows: usize,
    cols: usize,
    cache: SharedCache,
}

impl<E: Element> HostTile<E> {
    pub(crate) fn new(data: Vec<E>, rows: usize, cols: usize, cache: SharedCache) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self {
            data,
            rows,
            cols,
            cache,
        }
    }

    /// Tile contents in row-major order.
    pub fn as_slice(&self) -> &[E] {
        &self.data
    }

    /// Mutable tile contents in row-major order.
    pub fn as_mut_slice(&mut self) -> &mut [E] {
        &mut self.data
    }
}

impl<E: Element> TileBuffer for HostTile<E> {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }
}

impl<E: Element> Drop for HostTile<E> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if !data.is_empty() {
            lock(&self.cache).recycle(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_acquire_fresh_then_recycle() {
        let mut cache = BlockCache::new(None);
        let (buf, recycled) = cache.acquire::<f32>(16).unwrap();
        assert!(!recycled);
        assert_eq!(buf.len(), 16);
        assert_eq!(cache.resident_bytes(), 64);

        cache.recycle(buf);
        assert_eq!(cache.resident_bytes(), 0);
        assert_eq!(cache.cached_bytes(), 64);

        let (buf, recycled) = cache.acquire::<f32>(16).unwrap();
        assert!(recycled);
        assert_eq!(buf.len(), 16);
        assert_eq!(cache.cached_bytes(), 0);
        assert_eq!(cache.resident_bytes(), 64);
    }

    #[test]
    fn test_cache_keyed_by_precision() {
        let mut cache = BlockCache::new(None);
        let (buf, _) = cache.acquire::<f16>(8).unwrap();
        cache.recycle(buf);

        // Same length, different element type: not reused.
        let (_, recycled) = cache.acquire::<f32>(8).unwrap();
        assert!(!recycled);
        let (_, recycled) = cache.acquire::<f16>(8).unwrap();
        assert!(recycled);
    }

    #[test]
    fn test_limit_enforced() {
        let mut cache = BlockCache::new(Some(100));
        let (_a, _) = cache.acquire::<f32>(20).unwrap();
        match cache.acquire::<f32>(10) {
            Err(BenchError::AllocationFailure {
                requested_bytes,
                free_bytes,
            }) => {
                assert_eq!(requested_bytes, 40);
                assert_eq!(free_bytes, 20);
            }
            other => panic!("expected AllocationFailure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_limit_drops_cache_before_failing() {
        let mut cache = BlockCache::new(Some(100));
        let (a, _) = cache.acquire::<f32>(20).unwrap();
        cache.recycle(a);
        assert_eq!(cache.in_use(), 80);

        let (b, recycled) = cache.acquire::<f32>(10).unwrap();
        assert!(!recycled);
        assert_eq!(b.len(), 10);
        assert_eq!(cache.cached_bytes(), 0);
        assert_eq!(cache.in_use(), 40);
    }

    #[test]
    fn test_release_clears_cache() {
        let mut cache = BlockCache::new(None);
        let (buf, _) = cache.acquire::<f32>(32).unwrap();
        cache.recycle(buf);
        cache.release();
        assert_eq!(cache.in_use(), 0);
        let (_, recycled) = cache.acquire::<f32>(32).unwrap();
        assert!(!recycled);
    }

    #[test]
    fn test_tile_drop_returns_buffer() {
        let shared: SharedCache = Arc::new(Mutex::new(BlockCache::new(None)));
        let (data, _) = lock(&shared).acquire::<f32>(6).unwrap();
        let tile = HostTile::new(data, 2, 3, Arc::clone(&shared));
        assert_eq!(tile.len(), 6);
        assert_eq!(lock(&shared).resident_bytes(), 24);

        drop(tile);
        assert_eq!(lock(&shared).resident_bytes(), 0);
        assert_eq!(lock(&shared).cached_bytes(), 24);
    }
}
