pub mod ids;
pub mod io;
#[cfg(test)]
pub mod memory;
pub mod types;

use anyhow::{Context, Result};

use crate::error::LightconeError;
use ids::ChunkWindow;
use types::{HaloTable, Header};

/// Where merger-tree epochs come from.
pub trait TreeSource: Sync {
    fn header(&self) -> &Header;

    /// Redshifts of every available epoch, ascending.
    fn epochs(&self) -> &[f64];

    fn chunk_count(&self, z: f64) -> Result<usize>;

    fn load_chunk(&self, z: f64, chunk: usize, with_progenitors: bool) -> Result<HaloTable>;
}

/// Chunk count of epoch `z` given the chunk numbers present on disk. They
/// must run `0..n` with no gap and no repeat.
pub fn contiguous_chunk_count(z: f64, mut chunks: Vec<usize>) -> Result<usize> {
    chunks.sort_unstable();
    if chunks.iter().enumerate().all(|(i, &c)| i == c) {
        return Ok(chunks.len());
    }
    Err(LightconeError::ChunkGap {
        z,
        expected: chunks.last().map_or(0, |&c| c + 1),
        found: chunks,
    }
    .into())
}

/// Load `chunks` of epoch `z` back to back, returning the window that maps
/// identities onto rows of the stacked table.
pub fn load_window<S: TreeSource + ?Sized>(
    source: &S,
    z: f64,
    chunks: &[usize],
    with_progenitors: bool,
) -> Result<(ChunkWindow, HaloTable)> {
    let mut tables = Vec::with_capacity(chunks.len());
    for &chunk in chunks {
        let table = source
            .load_chunk(z, chunk, with_progenitors)
            .with_context(|| format!("load z={z:.3} chunk {chunk}"))?;
        table
            .check_layout(chunk)
            .map_err(|e| LightconeError::MalformedChunk {
                z,
                chunk,
                reason: e.to_string(),
            })?;
        if with_progenitors && table.progenitors.is_none() {
            return Err(LightconeError::MalformedChunk {
                z,
                chunk,
                reason: "no progenitor lists stored".to_string(),
            }
            .into());
        }
        tables.push(table);
    }

    let sizes: Vec<usize> = tables.iter().map(HaloTable::len).collect();
    let window = ChunkWindow::from_range(&sizes, chunks, 0, chunks.len());
    let table = if tables.len() == 1 {
        tables.swap_remove(0)
    } else {
        HaloTable::concat(&tables)?
    };
    Ok((window, table))
}
