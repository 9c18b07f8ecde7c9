use ahash::AHashMap;
use anyhow::{Result, anyhow};

use super::{TreeSource, contiguous_chunk_count};
use super::types::{HaloTable, Header};

/// Epochs held in memory, keyed like the files on disk.
pub struct MemoryTreeSource {
    header: Header,
    epochs: Vec<f64>,
    tables: AHashMap<(String, usize), HaloTable>,
}

impl MemoryTreeSource {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            epochs: Vec::new(),
            tables: AHashMap::default(),
        }
    }

    pub fn insert(&mut self, z: f64, chunk: usize, table: HaloTable) {
        if !self.epochs.iter().any(|&e| format!("{e:.3}") == format!("{z:.3}")) {
            self.epochs.push(z);
            self.epochs.sort_by(f64::total_cmp);
        }
        self.tables.insert((format!("{z:.3}"), chunk), table);
    }
}

impl TreeSource for MemoryTreeSource {
    fn header(&self) -> &Header {
        &self.header
    }

    fn epochs(&self) -> &[f64] {
        &self.epochs
    }

    fn chunk_count(&self, z: f64) -> Result<usize> {
        let key = format!("{z:.3}");
        let chunks = self
            .tables
            .keys()
            .filter(|(k, _)| *k == key)
            .map(|&(_, c)| c)
            .collect();
        contiguous_chunk_count(z, chunks)
    }

    fn load_chunk(&self, z: f64, chunk: usize, with_progenitors: bool) -> Result<HaloTable> {
        let mut table = self
            .tables
            .get(&(format!("{z:.3}"), chunk))
            .cloned()
            .ok_or_else(|| anyhow!("no table for z={z:.3} chunk {chunk}"))?;
        if !with_progenitors {
            table.progenitors = None;
        }
        Ok(table)
    }
}
