use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

mod catalog;
mod checkpoint;
mod config;
mod cosmology;
mod eligibility;
mod error;
mod geometry;
mod pipeline;
mod runtime;
mod tree;

use config::RunConfig;
use eligibility::EligibilityPolicy;
use tree::io::NpzTreeSource;

#[derive(Parser)]
#[command(name = "lightcone", about = "Build lightcone halo catalogs from merger-tree epochs")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug). LIGHTCONE_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the epochs from the starting to the stopping redshift.
    Run(RunArgs),

    /// Count the entries of written catalogs, per epoch and source.
    Inspect {
        /// Catalog root (`<output>/<sim>/halos_light_cones`).
        root: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// TOML run file; flags given on the command line take precedence.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    sim_name: Option<String>,

    /// Parent directory of the per-simulation merger trees.
    #[arg(long)]
    merger_dir: Option<PathBuf>,

    /// Parent directory of the per-simulation catalogs.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    z_start: Option<f64>,

    /// Inclusive.
    #[arg(long)]
    z_stop: Option<f64>,

    /// Continue from the checkpoints of an interrupted run.
    #[arg(long)]
    resume: bool,

    /// Dump thin-slab diagnostics for every unit.
    #[arg(long)]
    plot: bool,

    #[arg(long, value_enum)]
    policy: Option<EligibilityPolicy>,

    /// Progenitor chunks loaded on each side of the active chunk.
    #[arg(long)]
    padding: Option<usize>,

    #[arg(long)]
    degenerate_tol: Option<f64>,
}

impl RunArgs {
    fn resolve(self) -> Result<RunConfig> {
        let mut cfg = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(v) = self.sim_name {
            cfg.sim_name = v;
        }
        if let Some(v) = self.merger_dir {
            cfg.merger_dir = v;
        }
        if let Some(v) = self.output_dir {
            cfg.output_dir = v;
        }
        if let Some(v) = self.z_start {
            cfg.z_start = v;
        }
        if let Some(v) = self.z_stop {
            cfg.z_stop = v;
        }
        cfg.resume |= self.resume;
        cfg.plot |= self.plot;
        if let Some(v) = self.policy {
            cfg.policy = v;
        }
        if let Some(v) = self.padding {
            cfg.padding = v;
        }
        if let Some(v) = self.degenerate_tol {
            cfg.degenerate_tol = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn run(args: RunArgs) -> Result<()> {
    let cfg = args.resolve()?;
    let tree_dir = cfg.tree_dir();
    let source = NpzTreeSource::open(&tree_dir)
        .with_context(|| format!("open merger tree {}", tree_dir.display()))?;
    let summary = pipeline::run(&source, &cfg)?;

    for e in &summary.epochs {
        eprintln!(
            "[epoch] z={:.3} crossed={} deferred={} no_info={} carried_in={} resumed_units={}",
            e.z, e.counts.crossed, e.counts.deferred, e.counts.no_info, e.counts.carried_in, e.units_resumed
        );
    }
    let written: usize = summary.epochs.iter().map(|e| e.catalogs_written).sum();
    let placed: usize = summary
        .epochs
        .iter()
        .map(|e| e.counts.crossed + e.counts.no_info + e.counts.carried_in)
        .sum();
    eprintln!(
        "[done] {} epochs, {} catalogs, {} entries under {}",
        summary.epochs.len(),
        written,
        placed,
        cfg.catalog_root().display()
    );
    let left = summary.final_state.carried_total();
    if left > 0 {
        eprintln!(
            "[done] {left} deferred halos target z={:.3}; extend the stopping redshift to place them",
            summary.final_state.z
        );
    }
    Ok(())
}

fn inspect(root: &Path) -> Result<()> {
    let mut per_epoch: BTreeMap<String, [usize; 3]> = BTreeMap::new();
    for dir in std::fs::read_dir(root).with_context(|| format!("list {}", root.display()))? {
        let dir = dir?;
        let name = dir.file_name().to_string_lossy().into_owned();
        if !name.starts_with('z') || !dir.file_type()?.is_dir() {
            continue;
        }
        let tally = per_epoch.entry(name).or_default();
        for file in std::fs::read_dir(dir.path())? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("npz") {
                continue;
            }
            for row in catalog::read_catalog(&path)? {
                tally[row.source as usize] += 1;
            }
        }
    }

    println!("epoch    crossing  no-prog   carried");
    for (epoch, t) in &per_epoch {
        println!("{epoch:<8} {:>8} {:>8} {:>8}", t[0], t[1], t[2]);
    }
    let total: usize = per_epoch.values().flat_map(|t| t.iter()).sum();
    println!("{} epochs, {} entries", per_epoch.len(), total);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    runtime::init_logging(cli.verbose);
    runtime::configure_thread_pool();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Inspect { root } => inspect(&root),
    }
}
