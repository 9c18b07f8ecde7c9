use anyhow::{Context, Result, ensure};
use ndarray::{Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::checkpoint::write_atomic;
use crate::cosmology::DistanceTable;
use crate::tree::types::{EntrySource, LightconeEntry};

fn to_f32_rows(rows: impl ExactSizeIterator<Item = [f64; 3]>) -> Result<Array2<f32>> {
    let n = rows.len();
    let flat: Vec<f32> = rows.flat_map(|r| r.map(|v| v as f32)).collect();
    Ok(Array2::from_shape_vec((n, 3), flat)?)
}

/// One row of a written lightcone catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogRow {
    pub halo_id: i64,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub chi: f32,
    pub redshift: f32,
    pub source: EntrySource,
}

/// Thin-slab projection of the halos a unit put inside the shell band and of
/// their main progenitors.
#[derive(Debug, Clone, Default)]
pub struct SlabProjection {
    pub current_yz: Vec<[f64; 2]>,
    pub progenitor_yz: Vec<[f64; 2]>,
    pub chi_cur: f64,
    pub chi_prev: f64,
}

pub struct CatalogWriter {
    root: PathBuf,
}

impl CatalogWriter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn epoch_dir(&self, z: f64) -> PathBuf {
        self.root.join(format!("z{z:.3}"))
    }

    pub fn unit_path(&self, z: f64, origin: usize, chunk: usize) -> PathBuf {
        self.epoch_dir(z)
            .join(format!("lightcone_lc{origin}.{chunk:02}.npz"))
    }

    pub fn diagnostics_path(&self, z: f64, origin: usize, chunk: usize) -> PathBuf {
        self.root
            .join("diagnostics")
            .join(format!("z{z:.3}"))
            .join(format!("slab_lc{origin}.{chunk:02}.npz"))
    }

    /// Write one unit's entries. Redshifts outside the distance table are
    /// stored as NaN.
    pub fn write_unit(
        &self,
        z: f64,
        origin: usize,
        chunk: usize,
        entries: &[LightconeEntry],
        distances: &DistanceTable,
    ) -> Result<PathBuf> {
        let path = self.unit_path(z, origin, chunk);
        write_atomic(&path, |tmp| {
            let f = File::create(tmp).with_context(|| format!("create {}", tmp.display()))?;
            let mut npz = NpzWriter::new(f);

            let ids: Vec<i64> = entries.iter().map(|e| e.halo_id).collect();
            let chi: Vec<f32> = entries.iter().map(|e| e.chi as f32).collect();
            let redshift: Vec<f32> = entries
                .iter()
                .map(|e| distances.z_of_chi(e.chi).map_or(f32::NAN, |z| z as f32))
                .collect();
            let source: Vec<u8> = entries.iter().map(|e| e.source as u8).collect();

            npz.add_array("halo_id.npy", &Array1::from_vec(ids))?;
            npz.add_array(
                "pos_interp.npy",
                &to_f32_rows(entries.iter().map(|e| e.position))?,
            )?;
            npz.add_array(
                "vel_interp.npy",
                &to_f32_rows(entries.iter().map(|e| e.velocity))?,
            )?;
            npz.add_array("chi_interp.npy", &Array1::from_vec(chi))?;
            npz.add_array("z_interp.npy", &Array1::from_vec(redshift))?;
            npz.add_array("source.npy", &Array1::from_vec(source))?;

            let f = npz.finish()?;
            f.sync_all()?;
            Ok(())
        })
        .with_context(|| format!("write catalog {}", path.display()))?;
        Ok(path)
    }

    pub fn write_diagnostics(
        &self,
        z: f64,
        origin: usize,
        chunk: usize,
        slab: &SlabProjection,
    ) -> Result<PathBuf> {
        let path = self.diagnostics_path(z, origin, chunk);
        let to_arr = |rows: &[[f64; 2]]| -> Result<Array2<f64>> {
            let flat: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
            Ok(Array2::from_shape_vec((rows.len(), 2), flat)?)
        };
        write_atomic(&path, |tmp| {
            let f = File::create(tmp).with_context(|| format!("create {}", tmp.display()))?;
            let mut npz = NpzWriter::new(f);
            npz.add_array("current_yz.npy", &to_arr(&slab.current_yz)?)?;
            npz.add_array("progenitor_yz.npy", &to_arr(&slab.progenitor_yz)?)?;
            npz.add_array(
                "shells.npy",
                &Array1::from_vec(vec![slab.chi_cur, slab.chi_prev]),
            )?;
            npz.finish()?;
            Ok(())
        })
        .with_context(|| format!("write diagnostics {}", path.display()))?;
        Ok(path)
    }
}

pub fn read_catalog(path: &Path) -> Result<Vec<CatalogRow>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut npz = NpzReader::new(f).context("read npz")?;

    let ids: Array1<i64> = npz.by_name("halo_id.npy").context("missing halo_id")?;
    let pos: Array2<f32> = npz.by_name("pos_interp.npy").context("missing pos_interp")?;
    let vel: Array2<f32> = npz.by_name("vel_interp.npy").context("missing vel_interp")?;
    let chi: Array1<f32> = npz.by_name("chi_interp.npy").context("missing chi_interp")?;
    let z: Array1<f32> = npz.by_name("z_interp.npy").context("missing z_interp")?;
    let source: Array1<u8> = npz.by_name("source.npy").context("missing source")?;

    let n = ids.len();
    ensure!(
        pos.nrows() == n && vel.nrows() == n && chi.len() == n && z.len() == n && source.len() == n,
        "{}: catalog columns disagree in length",
        path.display()
    );

    (0..n)
        .map(|i| {
            Ok(CatalogRow {
                halo_id: ids[i],
                position: [pos[[i, 0]], pos[[i, 1]], pos[[i, 2]]],
                velocity: [vel[[i, 0]], vel[[i, 1]], vel[[i, 2]]],
                chi: chi[i],
                redshift: z[i],
                source: EntrySource::from_u8(source[i])?,
            })
        })
        .collect()
}
