//! One (epoch, chunk, origin) unit: select the halos of the current chunk
//! that sit inside the shell band, place them on the lightcone and retire
//! their progenitors.

use anyhow::{Result, ensure};
use ndarray::Array2;

use crate::catalog::SlabProjection;
use crate::checkpoint::UnitCheckpoint;
use crate::config::SlabConfig;
use crate::eligibility::{Eligibility, EligibilityPolicy, retire_progenitors};
use crate::geometry::{Shells, Vec3, distance, solve_crossing};
use crate::tree::ids::{ChunkWindow, has_progenitor};
use crate::tree::types::{EntrySource, HaloTable, LightconeEntry};

/// Shells of one epoch step.
#[derive(Debug, Clone, Copy)]
pub struct EpochPlan {
    pub z_cur: f64,
    /// The progenitor epoch, one step back in cosmic time.
    pub z_prev: f64,
    pub shells: Shells,
    /// Spacing used by the previously processed step, 0 on a fresh start.
    pub delta_chi_prev: f64,
}

impl EpochPlan {
    #[inline]
    pub fn delta_chi(&self) -> f64 {
        self.shells.spacing()
    }

    /// `(lo, hi]` bounds for halos without a usable progenitor.
    pub fn no_info_band(&self) -> (f64, f64) {
        let chi = self.shells.chi_cur;
        (chi - 0.5 * self.delta_chi_prev, chi + 0.5 * self.delta_chi())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnitSettings {
    pub policy: EligibilityPolicy,
    pub box_size: f64,
    pub degenerate_tol: f64,
    pub slab: Option<SlabConfig>,
}

/// Per-unit tallies. Every current halo lands in exactly one of
/// `ineligible`, `crossed`, `deferred`, `no_info` or `outside`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitCounts {
    pub ineligible: usize,
    pub crossed: usize,
    pub deferred: usize,
    pub no_info: usize,
    pub outside: usize,
    /// No-info halos whose main progenitor lives outside the loaded window.
    pub unresolved: usize,
    pub degenerate: usize,
    pub carried_in: usize,
    pub retired: usize,
}

impl UnitCounts {
    pub fn add(&mut self, other: &UnitCounts) {
        self.ineligible += other.ineligible;
        self.crossed += other.crossed;
        self.deferred += other.deferred;
        self.no_info += other.no_info;
        self.outside += other.outside;
        self.unresolved += other.unresolved;
        self.degenerate += other.degenerate;
        self.carried_in += other.carried_in;
        self.retired += other.retired;
    }

    pub fn classified(&self) -> usize {
        self.ineligible + self.crossed + self.deferred + self.no_info + self.outside
    }
}

pub struct UnitInput<'a> {
    pub current: &'a HaloTable,
    /// Eligibility of `current` rows; `None` means all eligible.
    pub eligibility: Option<&'a Eligibility>,
    pub window: &'a ChunkWindow,
    pub progenitors: &'a HaloTable,
    pub carried_in: &'a [LightconeEntry],
    pub origin: Vec3,
}

pub struct UnitOutcome {
    /// Finalized crossings, then no-info halos, then carried-in records.
    pub entries: Vec<LightconeEntry>,
    pub checkpoint: UnitCheckpoint,
    pub counts: UnitCounts,
    pub slab: Option<SlabProjection>,
}

fn in_slab(slab: &SlabConfig, p: Vec3) -> bool {
    p[0] >= slab.x_min && p[0] < slab.x_min + slab.width
}

pub fn process_unit(plan: &EpochPlan, settings: &UnitSettings, input: UnitInput) -> Result<UnitOutcome> {
    let UnitInput {
        current,
        eligibility,
        window,
        progenitors,
        carried_in,
        origin,
    } = input;
    let n = current.len();
    if let Some(e) = eligibility {
        ensure!(
            e.len() == n,
            "eligibility covers {} halos, current chunk holds {n}",
            e.len()
        );
    }
    ensure!(
        progenitors.len() == window.len(),
        "progenitor table holds {} halos, window expects {}",
        progenitors.len(),
        window.len()
    );

    let reference = Array2::from_shape_vec((1, 3), origin.to_vec())?;
    let radii = distance(current.position.view(), reference.view(), None)?;

    let Shells { chi_prev, chi_cur } = plan.shells;
    let (no_info_lo, no_info_hi) = plan.no_info_band();
    let slots = window.remap_all(&current.main_progenitor);

    let mut counts = UnitCounts::default();
    let mut finalized = Vec::new();
    let mut finalized_rows = Vec::new();
    let mut no_info = Vec::new();
    let mut carry = Vec::new();
    let mut main_slots = Vec::new();
    let mut slab = settings.slab.map(|_| SlabProjection {
        chi_cur,
        chi_prev,
        ..SlabProjection::default()
    });

    for row in 0..n {
        if eligibility.is_some_and(|e| !e.is_eligible(row)) {
            counts.ineligible += 1;
            continue;
        }
        let r2 = radii[row];
        let mp = current.main_progenitor[row];
        let slot = slots[row].filter(|_| has_progenitor(mp));

        let Some(slot) = slot else {
            if no_info_lo < r2 && r2 <= no_info_hi {
                if has_progenitor(mp) {
                    counts.unresolved += 1;
                }
                counts.no_info += 1;
                no_info.push(LightconeEntry {
                    halo_id: current.halo_id[row],
                    chi: chi_cur,
                    position: current.pos(row),
                    velocity: [0.0; 3],
                    source: EntrySource::NoProgenitor,
                });
            } else {
                counts.outside += 1;
            }
            continue;
        };

        if !(chi_cur < r2 && r2 <= chi_prev) {
            counts.outside += 1;
            continue;
        }

        let pos_cur = current.pos(row);
        let pos_prev = progenitors.pos(slot);
        let crossing = solve_crossing(
            pos_prev,
            pos_cur,
            plan.shells,
            settings.box_size,
            origin,
            settings.degenerate_tol,
        );
        if crossing.degenerate {
            counts.degenerate += 1;
        }
        main_slots.push(slot);

        if let (Some(cfg), Some(proj)) = (settings.slab.as_ref(), slab.as_mut()) {
            if in_slab(cfg, pos_cur) {
                proj.current_yz.push([pos_cur[1], pos_cur[2]]);
                proj.progenitor_yz.push([pos_prev[1], pos_prev[2]]);
            }
        }

        if crossing.closer_to_current {
            counts.crossed += 1;
            finalized_rows.push(row);
            finalized.push(LightconeEntry {
                halo_id: current.halo_id[row],
                chi: crossing.chi,
                position: crossing.position,
                velocity: crossing.velocity,
                source: EntrySource::Crossing,
            });
        } else {
            counts.deferred += 1;
            carry.push(LightconeEntry {
                halo_id: progenitors.halo_id[slot],
                chi: crossing.chi,
                position: crossing.position,
                velocity: crossing.velocity,
                source: EntrySource::Carried,
            });
        }
    }

    let mut window_eligibility = Eligibility::all_eligible(window.len());
    counts.retired = retire_progenitors(
        settings.policy,
        &mut window_eligibility,
        &main_slots,
        &finalized_rows,
        current.progenitors.as_ref(),
        window,
    )?;

    counts.carried_in = carried_in.len();
    let mut entries = finalized;
    entries.append(&mut no_info);
    entries.extend(carried_in.iter().cloned().map(|mut e| {
        e.source = EntrySource::Carried;
        e
    }));

    Ok(UnitOutcome {
        entries,
        checkpoint: UnitCheckpoint {
            window: window.clone(),
            eligibility: window_eligibility,
            carry,
        },
        counts,
        slab,
    })
}
