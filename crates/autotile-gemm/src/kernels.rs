//! Host compute kernels: GEMM accumulation, uniform fill and reduction.
//!
//! The GEMM is a cache-blocked i-k-j loop. Rows of C are split into
//! blocks of [`ROW_BLOCK`] rows (one rayon task each); within a block the
//! depth dimension is walked in panels of [`DEPTH_BLOCK`] so that a panel
//! of B is reused by every row of the block while it is still in cache:
//!
//! ```text
//! for each row block I of C            (parallel)
//!   acc[I, :] = C[I, :]                 (widened to f32)
//!   for each depth panel P
//!     for i in I, p in P
//!       acc[i, :] += A[i, p] * B[p, :]  (stride-1 over B and acc)
//!   C[I, :] = acc[I, :]
//! ```
//!
//! All storage types accumulate in `f32`.

use crate::precision::Element;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Rows of C per task.
pub const ROW_BLOCK: usize = 64;

/// Depth panel length.
pub const DEPTH_BLOCK: usize = 256;

/// Elements per independently seeded fill chunk.
const FILL_CHUNK: usize = 1 << 16;

/// `C += A·B` for row-major `a` (m×k), `b` (k×n) and `c` (m×n).
///
/// # Panics
///
/// Panics if the slice lengths don't match the dimensions.
pub fn gemm_accumulate<E: Element>(a: &[E], b: &[E], c: &mut [E], m: usize, n: usize, k: usize) {
    assert_eq!(a.len(), m * k, "A: expected {}x{}={} elements", m, k, m * k);
    assert_eq!(b.len(), k * n, "B: expected {}x{}={} elements", k, n, k * n);
    assert_eq!(c.len(), m * n, "C: expected {}x{}={} elements", m, n, m * n);

    if m == 0 || n == 0 || k == 0 {
        return;
    }

    let block_len = ROW_BLOCK * n;

    #[cfg(feature = "parallel")]
    c.par_chunks_mut(block_len)
        .enumerate()
        .for_each(|(blk, c_blk)| row_block(a, b, c_blk, blk * ROW_BLOCK, n, k));

    #[cfg(not(feature = "parallel"))]
    c.chunks_mut(block_len)
        .enumerate()
        .for_each(|(blk, c_blk)| row_block(a, b, c_blk, blk * ROW_BLOCK, n, k));
}

/// Accumulate one block of C rows starting at global row `row0`.
fn row_block<E: Element>(a: &[E], b: &[E], c_blk: &mut [E], row0: usize, n: usize, k: usize) {
    let rows = c_blk.len() / n;
    let mut acc: Vec<f32> = c_blk.iter().map(|v| v.to_f32()).collect();

    for p0 in (0..k).step_by(DEPTH_BLOCK) {
        let p1 = (p0 + DEPTH_BLOCK).min(k);
        for r in 0..rows {
            let a_row = &a[(row0 + r) * k..(row0 + r + 1) * k];
            let acc_row = &mut acc[r * n..(r + 1) * n];
            for p in p0..p1 {
                let a_ip = a_row[p].to_f32();
                let b_row = &b[p * n..(p + 1) * n];
                for (acc_j, b_pj) in acc_row.iter_mut().zip(b_row) {
                    *acc_j += a_ip * b_pj.to_f32();
                }
            }
        }
    }

    for (dst, src) in c_blk.iter_mut().zip(acc) {
        *dst = E::from_f32(src);
    }
}

/// Fill `data` with independent uniform values drawn in `[0, 1)` before
/// rounding to the storage type.
///
/// Each chunk of [`FILL_CHUNK`] elements gets its own generator derived
/// from `seed`, so the result does not depend on the thread count.
pub fn fill_uniform<E: Element>(data: &mut [E], seed: u64) {
    #[cfg(feature = "parallel")]
    data.par_chunks_mut(FILL_CHUNK)
        .enumerate()
        .for_each(|(idx, chunk)| fill_chunk(chunk, seed, idx));

    #[cfg(not(feature = "parallel"))]
    data.chunks_mut(FILL_CHUNK)
        .enumerate()
        .for_each(|(idx, chunk)| fill_chunk(chunk, seed, idx));
}

fn fill_chunk<E: Element>(chunk: &mut [E], seed: u64, idx: usize) {
    let mut rng = StdRng::seed_from_u64(seed ^ (idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    for v in chunk.iter_mut() {
        *v = E::from_f32(rng.gen::<f32>());
    }
}

/// Arithmetic mean of `data` in `f64` (0 for an empty slice).
pub fn mean<E: Element>(data: &[E]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    #[cfg(feature = "parallel")]
    let sum: f64 = data.par_iter().map(|v| v.to_f32() as f64).sum();

    #[cfg(not(feature = "parallel"))]
    let sum: f64 = data.iter().map(|v| v.to_f32() as f64).sum();

    sum / data.len() as f64
}
