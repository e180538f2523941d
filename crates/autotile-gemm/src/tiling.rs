//! Block iteration over a logical N×N matrix.
//!
//! The full matrices of a tiled run are never allocated; they exist only as
//! an addressing scheme. A [`TileRegion`] names a rectangle of that virtual
//! matrix and [`BlockIter`] walks one dimension in steps of the tile size:
//!
//! ```text
//! N = 1100, tile = 512
//!
//!   start:   0        512       1024
//!            ├────────┼─────────┼──┤
//!   extent:  512      512       76
//! ```

/// A rectangular block of a virtual matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    pub row_start: usize,
    pub row_extent: usize,
    pub col_start: usize,
    pub col_extent: usize,
}

impl TileRegion {
    /// Number of elements covered by the region.
    pub fn len(&self) -> usize {
        self.row_extent * self.col_extent
    }

    /// Whether the region covers no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over `(start, extent)` blocks of `0..dim` in steps of `block`.
///
/// The last block is truncated so that `start + extent == dim`.
#[derive(Debug, Clone)]
pub struct BlockIter {
    dim: usize,
    block: usize,
    next: usize,
}

impl BlockIter {
    /// Create an iterator over `0..dim`.
    ///
    /// # Panics
    ///
    /// Panics if `block` is zero.
    pub fn new(dim: usize, block: usize) -> Self {
        assert!(block > 0, "block size must be positive");
        Self {
            dim,
            block,
            next: 0,
        }
    }
}

impl Iterator for BlockIter {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.dim {
            return None;
        }
        let start = self.next;
        let extent = self.block.min(self.dim - start);
        self.next += extent;
        Some((start, extent))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = block_count(self.dim - self.next.min(self.dim), self.block);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BlockIter {}

/// Number of blocks needed to cover `dim`: ⌈dim / block⌉.
pub fn block_count(dim: usize, block: usize) -> usize {
    dim.div_ceil(block)
}

/// All C-tile regions of an `n`×`n` product, in row-major block order.
pub fn output_regions(n: usize, tile: usize) -> impl Iterator<Item = TileRegion> {
    BlockIter::new(n, tile).flat_map(move |(row_start, row_extent)| {
        BlockIter::new(n, tile).map(move |(col_start, col_extent)| TileRegion {
            row_start,
            row_extent,
            col_start,
            col_extent,
        })
    })
}
