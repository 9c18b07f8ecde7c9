use anyhow::{Context, Result, bail, ensure};
use ndarray::{Array1, Array2};
use ndarray_npy::NpzReader;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::{TreeSource, contiguous_chunk_count};
use super::types::{HaloTable, Header, ProgenitorList};
use crate::cosmology::DistanceTable;

pub const HEADER_FILE: &str = "header.npz";
const CHUNK_PREFIX: &str = "associations_z";
const CHUNK_SUFFIX: &str = ".npz";

pub fn chunk_file_name(z: f64, chunk: usize) -> String {
    format!("{CHUNK_PREFIX}{z:.3}.{chunk:02}{CHUNK_SUFFIX}")
}

fn read_i64<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Array1<i64>> {
    let arr: Array1<i64> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}
fn read_f64<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Array1<f64>> {
    let arr: Array1<f64> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}
fn read_f64_2d<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> Result<Array2<f64>> {
    let arr: Array2<f64> = npz
        .by_name(name)
        .with_context(|| format!("missing {}", name))?;
    Ok(arr)
}

pub fn load_header(path: &Path) -> Result<Header> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut npz = NpzReader::new(f).context("read npz")?;

    let box_size = read_f64(&mut npz, "BoxSize.npy")?;
    ensure!(!box_size.is_empty(), "BoxSize is empty");
    let box_size = box_size[0];
    ensure!(box_size > 0.0, "BoxSize must be positive, got {box_size}");

    let origins_arr = read_f64_2d(&mut npz, "LightConeOrigins.npy")?;
    ensure!(
        origins_arr.ncols() == 3 && origins_arr.nrows() > 0,
        "LightConeOrigins has shape {:?}, expected (K, 3)",
        origins_arr.dim()
    );
    let origins = origins_arr
        .outer_iter()
        .map(|r| [r[0], r[1], r[2]])
        .collect();

    let zs = read_f64(&mut npz, "Redshifts.npy")?.to_vec();
    let chis = read_f64(&mut npz, "CoordinateDistances.npy")?.to_vec();
    let distances = DistanceTable::new(zs, chis).context("distance table")?;

    Ok(Header {
        box_size,
        origins,
        distances,
    })
}

pub fn load_chunk_file(path: &Path, with_progenitors: bool) -> Result<HaloTable> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut npz = NpzReader::new(f).context("read npz")?;

    let halo_id = read_i64(&mut npz, "HaloIndex.npy")?.to_vec();
    let position = read_f64_2d(&mut npz, "Position.npy")?;
    let main_progenitor = read_i64(&mut npz, "MainProgenitor.npy")?.to_vec();

    let progenitors = if with_progenitors {
        // absent lists are reported by the caller, which knows whether it needs them
        let counts: Result<Array1<i64>, _> = npz.by_name("NumProgenitors.npy");
        let ids: Result<Array1<i64>, _> = npz.by_name("Progenitors.npy");
        match (counts, ids) {
            (Ok(counts), Ok(ids)) => Some(ProgenitorList::from_counts(ids.to_vec(), &counts.to_vec())?),
            _ => None,
        }
    } else {
        None
    };

    HaloTable::new(halo_id, position, main_progenitor, progenitors)
        .with_context(|| format!("table in {}", path.display()))
}

/// Merger-tree epochs stored as one NPZ per (epoch, chunk) next to a shared
/// `header.npz`.
pub struct NpzTreeSource {
    dir: PathBuf,
    header: Header,
    epochs: Vec<f64>,
    chunks: BTreeMap<String, Vec<usize>>,
}

fn parse_chunk_name(name: &str) -> Option<(String, usize)> {
    let body = name.strip_prefix(CHUNK_PREFIX)?.strip_suffix(CHUNK_SUFFIX)?;
    let (z, chunk) = body.rsplit_once('.')?;
    z.parse::<f64>().ok()?;
    Some((z.to_string(), chunk.parse().ok()?))
}

impl NpzTreeSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let header = load_header(&dir.join(HEADER_FILE))?;

        let mut chunks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((z, chunk)) = name.to_str().and_then(parse_chunk_name) {
                chunks.entry(z).or_default().push(chunk);
            }
        }
        if chunks.is_empty() {
            bail!("no {CHUNK_PREFIX}*{CHUNK_SUFFIX} files in {}", dir.display());
        }
        for list in chunks.values_mut() {
            list.sort_unstable();
        }

        let mut epochs: Vec<f64> = chunks.keys().filter_map(|z| z.parse().ok()).collect();
        epochs.sort_by(f64::total_cmp);

        Ok(Self {
            dir: dir.to_path_buf(),
            header,
            epochs,
            chunks,
        })
    }
}

impl TreeSource for NpzTreeSource {
    fn header(&self) -> &Header {
        &self.header
    }

    fn epochs(&self) -> &[f64] {
        &self.epochs
    }

    fn chunk_count(&self, z: f64) -> Result<usize> {
        let Some(list) = self.chunks.get(&format!("{z:.3}")) else {
            return Ok(0);
        };
        contiguous_chunk_count(z, list.clone())
    }

    fn load_chunk(&self, z: f64, chunk: usize, with_progenitors: bool) -> Result<HaloTable> {
        load_chunk_file(&self.dir.join(chunk_file_name(z, chunk)), with_progenitors)
    }
}
