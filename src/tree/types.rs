use anyhow::{Result, bail, ensure};
use ndarray::{Array2, ArrayView2, Axis, concatenate};

use super::ids::decode;
use crate::cosmology::DistanceTable;
use crate::geometry::Vec3;

/// All progenitor identities of a table, one contiguous run per halo.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgenitorList {
    pub ids: Vec<i64>,
    pub indptr: Vec<i64>, // len = n_halos + 1
}

impl ProgenitorList {
    /// Build from per-halo counts; runs are laid out back to back.
    pub fn from_counts(ids: Vec<i64>, counts: &[i64]) -> Result<Self> {
        let mut indptr = Vec::with_capacity(counts.len() + 1);
        indptr.push(0i64);
        for &c in counts {
            ensure!(c >= 0, "negative progenitor count {c}");
            let last = indptr[indptr.len() - 1];
            indptr.push(last + c);
        }
        let total = indptr[indptr.len() - 1];
        ensure!(
            total as usize == ids.len(),
            "progenitor counts sum to {total}, but {} progenitor ids are stored",
            ids.len()
        );
        Ok(Self { ids, indptr })
    }

    #[inline]
    pub fn n_halos(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    #[inline]
    pub fn row_slice(&self, r: usize) -> &[i64] {
        let lo = self.indptr[r] as usize;
        let hi = self.indptr[r + 1] as usize;
        &self.ids[lo..hi]
    }

    pub fn counts(&self) -> Vec<i64> {
        self.indptr.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

/// One chunk (or a concatenated window of chunks) of a merger-tree epoch.
#[derive(Debug, Clone)]
pub struct HaloTable {
    pub halo_id: Vec<i64>,
    pub position: Array2<f64>, // (n, 3)
    pub main_progenitor: Vec<i64>,
    pub progenitors: Option<ProgenitorList>,
}

impl HaloTable {
    pub fn new(
        halo_id: Vec<i64>,
        position: Array2<f64>,
        main_progenitor: Vec<i64>,
        progenitors: Option<ProgenitorList>,
    ) -> Result<Self> {
        let n = halo_id.len();
        ensure!(
            position.dim() == (n, 3),
            "positions have shape {:?}, expected ({n}, 3)",
            position.dim()
        );
        ensure!(
            main_progenitor.len() == n,
            "{} main progenitors for {n} halos",
            main_progenitor.len()
        );
        if let Some(p) = &progenitors {
            ensure!(
                p.n_halos() == n,
                "progenitor list covers {} halos, table has {n}",
                p.n_halos()
            );
        }
        Ok(Self {
            halo_id,
            position,
            main_progenitor,
            progenitors,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.halo_id.len()
    }

    #[inline]
    pub fn pos(&self, i: usize) -> Vec3 {
        let r = self.position.row(i);
        [r[0], r[1], r[2]]
    }

    /// Row `r` must hold the halo whose identity decodes to `(chunk, r)`.
    pub fn check_layout(&self, chunk: usize) -> Result<()> {
        for (row, &id) in self.halo_id.iter().enumerate() {
            let (c, local) = decode(id);
            if c != chunk || local != row {
                bail!(
                    "row {row} of chunk {chunk} holds halo {id} (chunk {c}, local {local})"
                );
            }
        }
        Ok(())
    }

    /// Stack tables in order. Progenitor lists are dropped unless every
    /// table carries one.
    pub fn concat(tables: &[HaloTable]) -> Result<Self> {
        let halo_id = tables.iter().flat_map(|t| t.halo_id.iter().copied()).collect();
        let main_progenitor = tables
            .iter()
            .flat_map(|t| t.main_progenitor.iter().copied())
            .collect();
        let views: Vec<ArrayView2<f64>> = tables.iter().map(|t| t.position.view()).collect();
        let position = if views.is_empty() {
            Array2::zeros((0, 3))
        } else {
            concatenate(Axis(0), &views)?
        };
        let progenitors = if !tables.is_empty() && tables.iter().all(|t| t.progenitors.is_some()) {
            let mut ids = Vec::new();
            let mut counts = Vec::new();
            for p in tables.iter().filter_map(|t| t.progenitors.as_ref()) {
                ids.extend_from_slice(&p.ids);
                counts.extend(p.counts());
            }
            Some(ProgenitorList::from_counts(ids, &counts)?)
        } else {
            None
        };
        HaloTable::new(halo_id, position, main_progenitor, progenitors)
    }
}

/// Simulation-wide metadata shared by every epoch.
#[derive(Debug, Clone)]
pub struct Header {
    pub box_size: f64,
    pub origins: Vec<Vec3>,
    pub distances: DistanceTable,
}

/// Where a lightcone entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntrySource {
    Crossing = 0,
    NoProgenitor = 1,
    Carried = 2,
}

impl EntrySource {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => EntrySource::Crossing,
            1 => EntrySource::NoProgenitor,
            2 => EntrySource::Carried,
            other => bail!("unknown entry source tag {other}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightconeEntry {
    pub halo_id: i64,
    pub chi: f64,
    pub position: Vec3,
    pub velocity: Vec3,
    pub source: EntrySource,
}
