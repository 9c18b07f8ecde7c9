//! The epoch loop: walk the requested redshift range from the nearest epoch
//! outwards, running every (chunk, origin) unit of an epoch in parallel and
//! handing eligibility and carry-over state to the progenitor epoch.

pub mod unit;

use ahash::AHashMap;
use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use rayon::prelude::*;

use crate::catalog::CatalogWriter;
use crate::checkpoint::{CheckpointStore, ResumeMarker, UnitCheckpoint};
use crate::config::RunConfig;
use crate::eligibility::Eligibility;
use crate::error::LightconeError;
use crate::geometry::Shells;
use crate::runtime;
use crate::tree::ids::{ChunkWindow, decode};
use crate::tree::types::{HaloTable, LightconeEntry};
use crate::tree::{TreeSource, load_window};
use unit::{EpochPlan, UnitCounts, UnitInput, UnitSettings, process_unit};

const RESUME_TOLERANCE: f64 = 1e-6;

/// Everything the units of one epoch inherit from the epoch processed before
/// it.
#[derive(Debug, Clone, Default)]
pub struct EpochState {
    pub z: f64,
    pub delta_chi_prev: f64,
    eligibility: AHashMap<(usize, usize), Eligibility>,
    carry: AHashMap<(usize, usize), Vec<LightconeEntry>>,
}

impl EpochState {
    pub fn fresh(z: f64, delta_chi_prev: f64) -> Self {
        Self {
            z,
            delta_chi_prev,
            ..Self::default()
        }
    }

    /// Fold one unit's checkpoint in. Window eligibility is cut per chunk and
    /// AND-merged with what other units already recorded; carried records go
    /// to the chunk their progenitor identity lives in.
    pub fn absorb(&mut self, origin: usize, ckpt: UnitCheckpoint) -> Result<()> {
        for (chunk, segment) in ckpt.eligibility.split(&ckpt.window)? {
            match self.eligibility.get_mut(&(origin, chunk)) {
                Some(existing) => existing
                    .merge(&segment)
                    .with_context(|| format!("merge eligibility of origin {origin} chunk {chunk}"))?,
                None => {
                    self.eligibility.insert((origin, chunk), segment);
                }
            }
        }
        for entry in ckpt.carry {
            let (chunk, _) = decode(entry.halo_id);
            self.carry.entry((origin, chunk)).or_default().push(entry);
        }
        Ok(())
    }

    pub fn eligibility(&self, origin: usize, chunk: usize) -> Option<&Eligibility> {
        self.eligibility.get(&(origin, chunk))
    }

    pub fn carried(&self, origin: usize, chunk: usize) -> &[LightconeEntry] {
        self.carry
            .get(&(origin, chunk))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn carried_total(&self) -> usize {
        self.carry.values().map(Vec::len).sum()
    }

    pub fn ineligible_total(&self) -> usize {
        self.eligibility.values().map(Eligibility::count_ineligible).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EpochSummary {
    pub z: f64,
    pub counts: UnitCounts,
    pub catalogs_written: usize,
    pub units_resumed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub epochs: Vec<EpochSummary>,
    /// State left for the epoch after the last processed one; its carry-over
    /// is never written to a catalog.
    pub final_state: EpochState,
}

struct UnitResult {
    origin: usize,
    checkpoint: UnitCheckpoint,
    counts: UnitCounts,
    written: bool,
    resumed: bool,
}

struct EpochContext<'a, S: TreeSource + ?Sized> {
    source: &'a S,
    config: &'a RunConfig,
    plan: EpochPlan,
    settings: UnitSettings,
    state: &'a EpochState,
    store: &'a CheckpointStore,
    writer: &'a CatalogWriter,
    n_chunks: usize,
}

fn nearest_epoch(epochs: &[f64], z: f64) -> Option<usize> {
    epochs
        .iter()
        .position_min_by(|a, b| (*a - z).abs().total_cmp(&(*b - z).abs()))
}

/// The current epoch must have as many chunks as the first processed epoch
/// `z_first`, and its progenitor epoch as many as the current one.
fn check_chunk_counts<S: TreeSource + ?Sized>(
    source: &S,
    z_first: f64,
    z_cur: f64,
    z_prev: f64,
    expected: usize,
) -> Result<()> {
    for (z, z_ref) in [(z_cur, z_first), (z_prev, z_cur)] {
        let found = source.chunk_count(z)?;
        if found < expected {
            return Err(LightconeError::IncompleteTree { z, expected, found }.into());
        }
        if found != expected {
            return Err(LightconeError::ChunkCountMismatch {
                z_this: z,
                n_this: found,
                z_other: z_ref,
                n_other: expected,
            }
            .into());
        }
    }
    Ok(())
}

/// Rebuild the state for epoch `z` from the unit checkpoints that target it.
fn restore_state(
    store: &CheckpointStore,
    marker: ResumeMarker,
    n_origins: usize,
    n_chunks: usize,
) -> Result<EpochState> {
    let z = marker.z_next;
    let mut state = EpochState::fresh(z, marker.delta_chi);
    for origin in 0..n_origins {
        for chunk in 0..n_chunks {
            if !store.has_unit(z, origin, chunk) {
                return Err(LightconeError::MissingCheckpoint { z, origin, chunk }.into());
            }
            let ckpt = store.load_unit(z, origin, chunk)?;
            state
                .absorb(origin, ckpt)
                .with_context(|| format!("restore z={z:.3} origin {origin} chunk {chunk}"))?;
        }
    }
    Ok(state)
}

fn load_chunk_tables<S: TreeSource + ?Sized>(
    ctx: &EpochContext<S>,
    chunk: usize,
) -> Result<(HaloTable, ChunkWindow, HaloTable)> {
    let with_lists = ctx.config.policy.needs_progenitor_lists();
    let (_, current) = load_window(ctx.source, ctx.plan.z_cur, &[chunk], with_lists)?;
    let neighbours = ChunkWindow::neighbourhood(chunk, ctx.config.padding, ctx.n_chunks);
    let (window, progenitors) = load_window(ctx.source, ctx.plan.z_prev, &neighbours, false)?;
    tracing::debug!(
        z = ctx.plan.z_cur,
        chunk,
        halos = current.len(),
        window = %window.chunks().iter().join(","),
        progenitors = progenitors.len(),
        "loaded chunk"
    );
    Ok((current, window, progenitors))
}

fn process_chunk<S: TreeSource + ?Sized>(ctx: &EpochContext<S>, chunk: usize) -> Result<Vec<UnitResult>> {
    let origins = &ctx.source.header().origins;
    let plan = &ctx.plan;
    let mut tables: Option<(HaloTable, ChunkWindow, HaloTable)> = None;
    let mut results = Vec::with_capacity(origins.len());

    for (o, &origin) in origins.iter().enumerate() {
        if ctx.config.resume && ctx.store.has_unit(plan.z_prev, o, chunk) {
            let checkpoint = ctx.store.load_unit(plan.z_prev, o, chunk)?;
            tracing::debug!(z = plan.z_cur, chunk, origin = o, "unit already complete");
            results.push(UnitResult {
                origin: o,
                checkpoint,
                counts: UnitCounts::default(),
                written: false,
                resumed: true,
            });
            continue;
        }

        if tables.is_none() {
            tables = Some(load_chunk_tables(ctx, chunk)?);
        }
        let Some((current, window, progenitors)) = tables.as_ref() else {
            bail!("chunk {chunk} tables missing after load");
        };

        let outcome = process_unit(
            plan,
            &ctx.settings,
            UnitInput {
                current,
                eligibility: ctx.state.eligibility(o, chunk),
                window,
                progenitors,
                carried_in: ctx.state.carried(o, chunk),
                origin,
            },
        )
        .with_context(|| format!("unit z={:.3} chunk {chunk} origin {o}", plan.z_cur))?;

        let c = &outcome.counts;
        tracing::debug!(
            z = plan.z_cur,
            chunk,
            origin = o,
            halos = c.classified(),
            ineligible = c.ineligible,
            outside = c.outside,
            crossed = c.crossed,
            deferred = c.deferred,
            no_info = c.no_info,
            carried_in = c.carried_in,
            unresolved = c.unresolved,
            degenerate = c.degenerate,
            "unit done"
        );
        if c.degenerate > 0 {
            tracing::warn!(
                z = plan.z_cur,
                chunk,
                origin = o,
                count = c.degenerate,
                "halos recede with the shell; crossing clamped to current position"
            );
        }

        let written = !outcome.entries.is_empty();
        if written {
            ctx.writer.write_unit(
                plan.z_cur,
                o,
                chunk,
                &outcome.entries,
                &ctx.source.header().distances,
            )?;
        } else {
            tracing::debug!(z = plan.z_cur, chunk, origin = o, "empty selection, no catalog written");
        }
        if let Some(slab) = &outcome.slab {
            ctx.writer.write_diagnostics(plan.z_cur, o, chunk, slab)?;
        }
        ctx.store
            .save_unit(plan.z_prev, o, chunk, &outcome.checkpoint)?;

        results.push(UnitResult {
            origin: o,
            checkpoint: outcome.checkpoint,
            counts: outcome.counts,
            written,
            resumed: false,
        });
    }
    Ok(results)
}

/// Process every epoch from `z_start` to `z_stop` (inclusive).
pub fn run<S: TreeSource + ?Sized>(source: &S, config: &RunConfig) -> Result<RunSummary> {
    config.validate()?;
    let header = source.header();
    let epochs = source.epochs();
    let (Some(start), Some(stop)) = (
        nearest_epoch(epochs, config.z_start),
        nearest_epoch(epochs, config.z_stop),
    ) else {
        bail!("no merger-tree epochs found");
    };
    if stop + 1 >= epochs.len() {
        return Err(LightconeError::MissingProgenitorEpoch { z: epochs[stop] }.into());
    }

    let n_chunks = source.chunk_count(epochs[start])?;
    if n_chunks == 0 {
        return Err(LightconeError::IncompleteTree {
            z: epochs[start],
            expected: 1,
            found: 0,
        }
        .into());
    }
    tracing::info!(
        sim = %config.sim_name,
        first = epochs[start],
        last = epochs[stop],
        chunks = n_chunks,
        origins = header.origins.len(),
        table_points = header.distances.redshifts().len(),
        chi_max = header.distances.distances().last().copied().unwrap_or(0.0),
        "lightcone run"
    );

    let store = CheckpointStore::open(&config.checkpoint_dir())?;
    let writer = CatalogWriter::new(&config.catalog_root());

    let mut state = if config.resume {
        let marker = store.load_marker()?;
        if (marker.z_next - epochs[start]).abs() >= RESUME_TOLERANCE {
            return Err(LightconeError::ResumeMismatch {
                recorded: marker.z_next,
                requested: epochs[start],
            }
            .into());
        }
        let state = restore_state(&store, marker, header.origins.len(), n_chunks)?;
        tracing::info!(
            z = state.z,
            carried = state.carried_total(),
            retired = state.ineligible_total(),
            "resumed"
        );
        state
    } else {
        let removed = store.clear()?;
        if removed > 0 {
            tracing::info!(removed, dir = %store.dir().display(), "cleared stale checkpoints");
        }
        EpochState::fresh(epochs[start], 0.0)
    };

    let budget = runtime::memory_budget_bytes();
    let mut summary = RunSummary::default();

    for i in start..=stop {
        let z_cur = epochs[i];
        let z_prev = epochs[i + 1];
        check_chunk_counts(source, epochs[start], z_cur, z_prev, n_chunks)?;

        let chi_cur = header.distances.chi_of_z(z_cur)?;
        let chi_prev = header.distances.chi_of_z(z_prev)?;
        let plan = EpochPlan {
            z_cur,
            z_prev,
            shells: Shells::new(chi_prev, chi_cur)
                .with_context(|| format!("shells for z={z_cur:.3} -> {z_prev:.3}"))?,
            delta_chi_prev: state.delta_chi_prev,
        };
        let ctx = EpochContext {
            source,
            config,
            plan,
            settings: UnitSettings {
                policy: config.policy,
                box_size: header.box_size,
                degenerate_tol: config.degenerate_tol,
                slab: config.plot.then_some(config.slab),
            },
            state: &state,
            store: &store,
            writer: &writer,
            n_chunks,
        };

        let pb = ProgressBar::new(n_chunks as u64);
        pb.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} chunks {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_message(format!("z={z_cur:.3}"));

        let per_chunk: Vec<Vec<UnitResult>> = (0..n_chunks)
            .into_par_iter()
            .map(|chunk| {
                let res = process_chunk(&ctx, chunk)
                    .with_context(|| format!("z={z_cur:.3} chunk {chunk}"));
                pb.inc(1);
                res
            })
            .collect::<Result<_>>()?;
        pb.finish_and_clear();

        let mut next = EpochState::fresh(z_prev, plan.delta_chi());
        let mut epoch = EpochSummary {
            z: z_cur,
            ..EpochSummary::default()
        };
        for unit in per_chunk.into_iter().flatten() {
            epoch.counts.add(&unit.counts);
            epoch.catalogs_written += usize::from(unit.written);
            epoch.units_resumed += usize::from(unit.resumed);
            next.absorb(unit.origin, unit.checkpoint)?;
        }

        store.save_marker(ResumeMarker {
            z_next: z_prev,
            delta_chi: plan.delta_chi(),
        })?;

        let c = &epoch.counts;
        tracing::info!(
            z = z_cur,
            chi = chi_cur,
            crossed = c.crossed,
            deferred = c.deferred,
            no_info = c.no_info,
            carried_in = c.carried_in,
            unresolved = c.unresolved,
            degenerate = c.degenerate,
            retired = c.retired,
            catalogs = epoch.catalogs_written,
            resumed = epoch.units_resumed,
            "epoch done"
        );
        runtime::report_memory(z_cur, budget)?;

        summary.epochs.push(epoch);
        state = next;
    }

    if state.carried_total() > 0 {
        tracing::warn!(
            z = state.z,
            carried = state.carried_total(),
            "carry-over for the epoch after the stopping redshift stays in the checkpoint store"
        );
    }
    summary.final_state = state;
    Ok(summary)
}
