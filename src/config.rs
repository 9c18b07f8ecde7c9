use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::eligibility::EligibilityPolicy;

/// Bounds of the thin slab dumped by the diagnostic mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabConfig {
    pub x_min: f64,
    pub width: f64,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            x_min: -500.0,
            width: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub sim_name: String,
    /// Parent of the per-simulation merger-tree directories.
    pub merger_dir: PathBuf,
    /// Parent of the per-simulation lightcone catalogs.
    pub output_dir: PathBuf,
    pub z_start: f64,
    /// Inclusive.
    pub z_stop: f64,
    pub resume: bool,
    pub plot: bool,
    pub policy: EligibilityPolicy,
    /// Progenitor-epoch chunks loaded on each side of the active chunk.
    pub padding: usize,
    /// Relative tolerance under which a crossing is treated as degenerate.
    pub degenerate_tol: f64,
    pub slab: SlabConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sim_name: "AbacusSummit_highbase_c000_ph100".to_string(),
            merger_dir: PathBuf::from("merger"),
            output_dir: PathBuf::from("light_cone_catalog"),
            z_start: 0.3,
            z_stop: 0.65,
            resume: false,
            plot: false,
            policy: EligibilityPolicy::MainProgenitor,
            padding: 1,
            degenerate_tol: 1e-9,
            slab: SlabConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.sim_name.is_empty(), "simulation name is empty");
        ensure!(
            self.z_start <= self.z_stop,
            "starting redshift {} lies above stopping redshift {}",
            self.z_start,
            self.z_stop
        );
        ensure!(
            self.degenerate_tol >= 0.0 && self.degenerate_tol.is_finite(),
            "degenerate tolerance must be a finite non-negative number"
        );
        ensure!(self.slab.width > 0.0, "diagnostic slab width must be positive");
        Ok(())
    }

    pub fn tree_dir(&self) -> PathBuf {
        self.merger_dir.join(&self.sim_name)
    }

    pub fn catalog_root(&self) -> PathBuf {
        self.output_dir.join(&self.sim_name).join("halos_light_cones")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.catalog_root().join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            r#"
sim_name = "AbacusSummit_base_c000_ph006"
z_start = 0.5
z_stop = 1.25
policy = "all-progenitors"

[slab]
x_min = -490.0
"#,
        )
        .unwrap();

        let cfg = RunConfig::load(&path).unwrap();
        assert_eq!(cfg.sim_name, "AbacusSummit_base_c000_ph006");
        assert_eq!(cfg.z_stop, 1.25);
        assert_eq!(cfg.policy, EligibilityPolicy::AllProgenitors);
        assert_eq!(cfg.padding, 1);
        assert_eq!(cfg.slab.x_min, -490.0);
        assert_eq!(cfg.slab.width, 10.0);
        cfg.validate().unwrap();
        assert!(cfg
            .checkpoint_dir()
            .ends_with("AbacusSummit_base_c000_ph006/halos_light_cones/tmp"));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let cfg = RunConfig {
            z_start: 1.0,
            z_stop: 0.5,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_policy_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "policy = \"every-other\"\n").unwrap();
        assert!(RunConfig::load(&path).is_err());
    }
}
