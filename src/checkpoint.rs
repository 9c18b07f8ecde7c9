use anyhow::{Context, Result, ensure};
use ndarray::{Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter, read_npy, write_npy};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::eligibility::Eligibility;
use crate::tree::ids::ChunkWindow;
use crate::tree::types::{EntrySource, LightconeEntry};

const MARKER_FILE: &str = "z_prev_delta.npy";
const UNIT_PREFIX: &str = "pending_z";

/// Write through a sibling temp file and rename into place, so a reader never
/// sees a half-written file and a present file means the write finished.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp = PathBuf::from(tmp);
    write(&tmp)?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

fn positions_to_array(rows: impl ExactSizeIterator<Item = [f64; 3]>) -> Result<Array2<f64>> {
    let n = rows.len();
    let flat: Vec<f64> = rows.flat_map(|r| r.into_iter()).collect();
    Ok(Array2::from_shape_vec((n, 3), flat)?)
}

/// What one (epoch, origin, chunk) unit leaves behind for the progenitor
/// epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitCheckpoint {
    pub window: ChunkWindow,
    pub eligibility: Eligibility,
    pub carry: Vec<LightconeEntry>,
}

/// Redshift of the next epoch to process and the shell spacing just used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumeMarker {
    pub z_next: f64,
    pub delta_chi: f64,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `z_target` is the progenitor epoch the state is meant for.
    pub fn unit_path(&self, z_target: f64, origin: usize, chunk: usize) -> PathBuf {
        self.dir
            .join(format!("{UNIT_PREFIX}{z_target:.3}_lc{origin}.{chunk:02}.npz"))
    }

    pub fn has_unit(&self, z_target: f64, origin: usize, chunk: usize) -> bool {
        self.unit_path(z_target, origin, chunk).is_file()
    }

    /// Drop every checkpoint left by an earlier run.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.dir).with_context(|| format!("list {}", self.dir.display()))? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(UNIT_PREFIX) || name.starts_with(MARKER_FILE) {
                fs::remove_file(entry.path())
                    .with_context(|| format!("remove {}", entry.path().display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn save_unit(
        &self,
        z_target: f64,
        origin: usize,
        chunk: usize,
        ckpt: &UnitCheckpoint,
    ) -> Result<()> {
        ensure!(
            ckpt.window.len() == ckpt.eligibility.len(),
            "eligibility covers {} slots, window holds {}",
            ckpt.eligibility.len(),
            ckpt.window.len()
        );
        let path = self.unit_path(z_target, origin, chunk);
        write_atomic(&path, |tmp| {
            let f = File::create(tmp).with_context(|| format!("create {}", tmp.display()))?;
            let mut npz = NpzWriter::new(f);

            let chunks: Vec<i64> = ckpt.window.chunks().iter().map(|&c| c as i64).collect();
            let sizes: Vec<i64> = ckpt.window.sizes().iter().map(|&s| s as i64).collect();
            npz.add_array("window_chunks.npy", &Array1::from_vec(chunks))?;
            npz.add_array("window_sizes.npy", &Array1::from_vec(sizes))?;
            npz.add_array(
                "eligible.npy",
                &Array1::from_vec(ckpt.eligibility.to_u8()),
            )?;

            let ids: Vec<i64> = ckpt.carry.iter().map(|e| e.halo_id).collect();
            let chi: Vec<f64> = ckpt.carry.iter().map(|e| e.chi).collect();
            npz.add_array("halo_id.npy", &Array1::from_vec(ids))?;
            npz.add_array("chi.npy", &Array1::from_vec(chi))?;
            npz.add_array(
                "position.npy",
                &positions_to_array(ckpt.carry.iter().map(|e| e.position))?,
            )?;
            npz.add_array(
                "velocity.npy",
                &positions_to_array(ckpt.carry.iter().map(|e| e.velocity))?,
            )?;

            let f = npz.finish()?;
            f.sync_all()?;
            Ok(())
        })
        .with_context(|| format!("checkpoint {}", path.display()))
    }

    pub fn load_unit(&self, z_target: f64, origin: usize, chunk: usize) -> Result<UnitCheckpoint> {
        let path = self.unit_path(z_target, origin, chunk);
        let f = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let mut npz = NpzReader::new(f).context("read npz")?;

        let chunks: Array1<i64> = npz.by_name("window_chunks.npy").context("missing window_chunks")?;
        let sizes: Array1<i64> = npz.by_name("window_sizes.npy").context("missing window_sizes")?;
        let eligible: Array1<u8> = npz.by_name("eligible.npy").context("missing eligible")?;
        let window = ChunkWindow::new(
            chunks.iter().map(|&c| c as usize),
            sizes.iter().map(|&s| s as usize),
        );
        let eligibility = Eligibility::from_u8(&eligible.to_vec());
        ensure!(
            window.len() == eligibility.len(),
            "{}: eligibility covers {} slots, window holds {}",
            path.display(),
            eligibility.len(),
            window.len()
        );

        let ids: Array1<i64> = npz.by_name("halo_id.npy").context("missing halo_id")?;
        let chi: Array1<f64> = npz.by_name("chi.npy").context("missing chi")?;
        let pos: Array2<f64> = npz.by_name("position.npy").context("missing position")?;
        let vel: Array2<f64> = npz.by_name("velocity.npy").context("missing velocity")?;
        let n = ids.len();
        ensure!(
            chi.len() == n && pos.nrows() == n && vel.nrows() == n,
            "{}: carry-over columns disagree in length",
            path.display()
        );

        let carry = (0..n)
            .map(|i| LightconeEntry {
                halo_id: ids[i],
                chi: chi[i],
                position: [pos[[i, 0]], pos[[i, 1]], pos[[i, 2]]],
                velocity: [vel[[i, 0]], vel[[i, 1]], vel[[i, 2]]],
                source: EntrySource::Carried,
            })
            .collect();

        Ok(UnitCheckpoint {
            window,
            eligibility,
            carry,
        })
    }

    pub fn save_marker(&self, marker: ResumeMarker) -> Result<()> {
        let path = self.dir.join(MARKER_FILE);
        write_atomic(&path, |tmp| {
            write_npy(tmp, &Array1::from_vec(vec![marker.z_next, marker.delta_chi]))
                .with_context(|| format!("write {}", tmp.display()))
        })
    }

    pub fn load_marker(&self) -> Result<ResumeMarker> {
        let path = self.dir.join(MARKER_FILE);
        let arr: Array1<f64> =
            read_npy(&path).with_context(|| format!("read resume marker {}", path.display()))?;
        ensure!(arr.len() == 2, "resume marker holds {} values, expected 2", arr.len());
        Ok(ResumeMarker {
            z_next: arr[0],
            delta_chi: arr[1],
        })
    }
}
