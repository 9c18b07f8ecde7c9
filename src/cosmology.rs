use anyhow::{Result, anyhow, ensure};

/// Tabulated redshift / comoving-distance relation, linearly interpolated
/// both ways. Lookups outside the table are errors rather than extrapolated.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceTable {
    z: Vec<f64>,
    chi: Vec<f64>,
}

impl DistanceTable {
    pub fn new(z: Vec<f64>, chi: Vec<f64>) -> Result<Self> {
        ensure!(
            z.len() == chi.len(),
            "distance table has {} redshifts and {} distances",
            z.len(),
            chi.len()
        );
        ensure!(z.len() >= 2, "distance table needs at least two entries");

        let mut pairs: Vec<(f64, f64)> = z.into_iter().zip(chi).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        for w in pairs.windows(2) {
            ensure!(
                w[1].0 > w[0].0 && w[1].1 > w[0].1,
                "comoving distance must grow strictly with redshift (z={} -> {})",
                w[0].0,
                w[1].0
            );
        }
        let (z, chi) = pairs.into_iter().unzip();
        Ok(Self { z, chi })
    }

    pub fn chi_of_z(&self, z: f64) -> Result<f64> {
        interp(&self.z, &self.chi, z)
            .ok_or_else(|| anyhow!("redshift {z} outside the distance table"))
    }

    pub fn z_of_chi(&self, chi: f64) -> Result<f64> {
        interp(&self.chi, &self.z, chi)
            .ok_or_else(|| anyhow!("comoving distance {chi} outside the distance table"))
    }

    pub fn redshifts(&self) -> &[f64] {
        &self.z
    }

    pub fn distances(&self) -> &[f64] {
        &self.chi
    }
}

fn interp(xs: &[f64], ys: &[f64], x: f64) -> Option<f64> {
    let last = xs.len() - 1;
    if !(x >= xs[0] && x <= xs[last]) {
        return None;
    }
    let hi = xs.partition_point(|&v| v < x).clamp(1, last);
    let lo = hi - 1;
    let t = (x - xs[lo]) / (xs[hi] - xs[lo]);
    Some(ys[lo] + t * (ys[hi] - ys[lo]))
}
