//! Halo identities and dense per-window offsets.
//!
//! Merger-tree identities pack the spatial chunk into the integer:
//! `slice * ID_FACTOR + chunk * SLAB_FACTOR + local`. Arrays, on the other
//! hand, are addressed by a dense offset into the concatenation of whatever
//! chunks are currently loaded.

use itertools::Itertools;
use smallvec::SmallVec;

pub const ID_FACTOR: i64 = 1_000_000_000_000;
pub const SLAB_FACTOR: i64 = 1_000_000_000;

/// Main-progenitor identities at or below this value mean "no progenitor".
pub const NO_PROGENITOR: i64 = 0;

#[inline]
pub fn has_progenitor(id: i64) -> bool {
    id > NO_PROGENITOR
}

/// `(chunk, local)` of a packed identity.
#[inline]
pub fn decode(id: i64) -> (usize, usize) {
    let local = id % SLAB_FACTOR;
    let chunk = (id % ID_FACTOR - local) / SLAB_FACTOR;
    (chunk as usize, local as usize)
}

#[inline]
pub fn encode(slice: i64, chunk: usize, local: usize) -> i64 {
    slice * ID_FACTOR + chunk as i64 * SLAB_FACTOR + local as i64
}

/// An ordered set of loaded chunks and where each one starts in the
/// concatenated arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWindow {
    chunks: SmallVec<[usize; 4]>,
    sizes: SmallVec<[usize; 4]>,
    offsets: SmallVec<[usize; 4]>,
}

impl ChunkWindow {
    /// The window made of `chunk_order[start..stop]`, where `chunk_sizes[i]`
    /// is the halo count of chunk `chunk_order[i]`.
    pub fn from_range(
        chunk_sizes: &[usize],
        chunk_order: &[usize],
        start: usize,
        stop: usize,
    ) -> Self {
        let stop = stop.min(chunk_order.len()).min(chunk_sizes.len());
        let start = start.min(stop);
        Self::new(
            chunk_order[start..stop].iter().copied(),
            chunk_sizes[start..stop].iter().copied(),
        )
    }

    pub fn new(
        chunks: impl IntoIterator<Item = usize>,
        sizes: impl IntoIterator<Item = usize>,
    ) -> Self {
        let chunks: SmallVec<[usize; 4]> = chunks.into_iter().collect();
        let sizes: SmallVec<[usize; 4]> = sizes.into_iter().collect();
        let mut offsets = SmallVec::with_capacity(sizes.len());
        let mut acc = 0usize;
        for &s in &sizes {
            offsets.push(acc);
            acc += s;
        }
        Self {
            chunks,
            sizes,
            offsets,
        }
    }

    /// Chunks `center - padding ..= center + padding`, wrapped periodically
    /// over `n_chunks` and without repeats.
    pub fn neighbourhood(center: usize, padding: usize, n_chunks: usize) -> SmallVec<[usize; 4]> {
        if n_chunks == 0 {
            return SmallVec::new();
        }
        let reach = padding.min(n_chunks / 2) as i64;
        (-reach..=reach)
            .map(|d| (center as i64 + d).rem_euclid(n_chunks as i64) as usize)
            .unique()
            .collect()
    }

    #[inline]
    pub fn chunks(&self) -> &[usize] {
        &self.chunks
    }

    #[inline]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Dense range of `chunk` inside the window.
    pub fn span(&self, chunk: usize) -> Option<std::ops::Range<usize>> {
        let pos = self.chunks.iter().position(|&c| c == chunk)?;
        let lo = self.offsets[pos];
        Some(lo..lo + self.sizes[pos])
    }

    /// Dense offset of a packed identity, or `None` when its chunk is not
    /// loaded (or the local index overruns the chunk).
    #[inline]
    pub fn remap(&self, id: i64) -> Option<usize> {
        if id < 0 {
            return None;
        }
        let (chunk, local) = decode(id);
        let pos = self.chunks.iter().position(|&c| c == chunk)?;
        if local >= self.sizes[pos] {
            return None;
        }
        Some(self.offsets[pos] + local)
    }

    pub fn remap_all(&self, ids: &[i64]) -> Vec<Option<usize>> {
        ids.iter().map(|&id| self.remap(id)).collect()
    }
}
