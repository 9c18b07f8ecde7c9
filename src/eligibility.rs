//! Which halos may still be claimed by a lightcone shell.
//!
//! A slot starts eligible and can only ever be switched off. Once a halo has
//! been assigned to a shell its main progenitor (and, under the stricter
//! policy, every listed progenitor) is switched off in the epoch that is
//! processed next.

use anyhow::{Result, ensure};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::LightconeError;
use crate::tree::ids::ChunkWindow;
use crate::tree::types::ProgenitorList;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EligibilityPolicy {
    /// Only the main progenitor of an assigned halo is retired.
    #[default]
    MainProgenitor,
    /// Every progenitor of a finalized crossing is retired as well.
    AllProgenitors,
}

impl EligibilityPolicy {
    #[inline]
    pub fn needs_progenitor_lists(self) -> bool {
        matches!(self, EligibilityPolicy::AllProgenitors)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    flags: Vec<bool>,
}

impl Eligibility {
    pub fn all_eligible(n: usize) -> Self {
        Self {
            flags: vec![true; n],
        }
    }

    pub fn from_u8(raw: &[u8]) -> Self {
        Self {
            flags: raw.iter().map(|&b| b != 0).collect(),
        }
    }

    pub fn to_u8(&self) -> Vec<u8> {
        self.flags.iter().map(|&f| f as u8).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[inline]
    pub fn is_eligible(&self, slot: usize) -> bool {
        self.flags[slot]
    }

    #[inline]
    pub fn mark_ineligible(&mut self, slot: usize) {
        self.flags[slot] = false;
    }

    pub fn count_ineligible(&self) -> usize {
        self.flags.iter().filter(|&&f| !f).count()
    }

    /// Fold another view of the same slots in; a slot stays eligible only if
    /// both sides agree.
    pub fn merge(&mut self, other: &Eligibility) -> Result<()> {
        ensure!(
            self.flags.len() == other.flags.len(),
            "cannot merge eligibility of {} slots with {} slots",
            self.flags.len(),
            other.flags.len()
        );
        for (a, &b) in self.flags.iter_mut().zip(other.flags.iter()) {
            *a &= b;
        }
        Ok(())
    }

    /// Cut a window-wide array into one array per window chunk.
    pub fn split(&self, window: &ChunkWindow) -> Result<Vec<(usize, Eligibility)>> {
        ensure!(
            window.len() == self.flags.len(),
            "window holds {} halos, eligibility has {} slots",
            window.len(),
            self.flags.len()
        );
        let mut out = Vec::with_capacity(window.chunks().len());
        for &chunk in window.chunks() {
            if let Some(span) = window.span(chunk) {
                out.push((
                    chunk,
                    Eligibility {
                        flags: self.flags[span].to_vec(),
                    },
                ));
            }
        }
        Ok(out)
    }
}

/// Retire the progenitors of halos assigned to the current shell.
///
/// `main_slots` are the window slots of the main progenitors of every halo
/// inside the shell band, finalized or deferred. `finalized` lists the rows
/// (into `progenitors`) of halos that crossed now; under
/// [`EligibilityPolicy::AllProgenitors`] each of their listed progenitors
/// found in `window` is retired too. Returns how many slots were switched off.
pub fn retire_progenitors(
    policy: EligibilityPolicy,
    target: &mut Eligibility,
    main_slots: &[usize],
    finalized: &[usize],
    progenitors: Option<&ProgenitorList>,
    window: &ChunkWindow,
) -> Result<usize> {
    let before = target.count_ineligible();
    for &slot in main_slots {
        target.mark_ineligible(slot);
    }

    if policy == EligibilityPolicy::AllProgenitors {
        let list = progenitors.ok_or(LightconeError::MissingProgenitorLists)?;
        for &row in finalized {
            for &id in list.row_slice(row) {
                if let Some(slot) = window.remap(id) {
                    target.mark_ineligible(slot);
                }
            }
        }
    }
    Ok(target.count_ineligible() - before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ids::encode;

    #[test]
    fn merge_never_reenables() {
        let mut a = Eligibility::all_eligible(4);
        a.mark_ineligible(1);
        let mut b = Eligibility::all_eligible(4);
        b.mark_ineligible(3);
        a.merge(&b).unwrap();
        assert_eq!(a.to_u8(), vec![1, 0, 1, 0]);

        a.merge(&Eligibility::all_eligible(4)).unwrap();
        assert_eq!(a.count_ineligible(), 2);
        assert!(a.merge(&Eligibility::all_eligible(3)).is_err());
    }

    #[test]
    fn split_follows_window_layout() {
        let window = ChunkWindow::new([3, 0], [2, 3]);
        let mut e = Eligibility::all_eligible(5);
        e.mark_ineligible(1);
        e.mark_ineligible(4);
        let parts = e.split(&window).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, 3);
        assert_eq!(parts[0].1.to_u8(), vec![1, 0]);
        assert_eq!(parts[1].0, 0);
        assert_eq!(parts[1].1.to_u8(), vec![1, 1, 0]);
    }

    #[test]
    fn main_progenitor_policy_ignores_lists() {
        let window = ChunkWindow::new([0], [4]);
        let list = ProgenitorList::from_counts(vec![encode(1, 0, 2), encode(1, 0, 3)], &[2]).unwrap();
        let mut e = Eligibility::all_eligible(4);
        let n = retire_progenitors(
            EligibilityPolicy::MainProgenitor,
            &mut e,
            &[0],
            &[0],
            Some(&list),
            &window,
        )
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(e.to_u8(), vec![0, 1, 1, 1]);
    }

    #[test]
    fn all_progenitors_policy_walks_the_list() {
        let window = ChunkWindow::new([0], [4]);
        // halo 0 crossed now with progenitors 0 and 2; halo 1 was deferred
        // with progenitors 1 and 3 that must stay eligible except its main one
        let list = ProgenitorList::from_counts(
            vec![
                encode(1, 0, 0),
                encode(1, 0, 2),
                encode(1, 0, 1),
                encode(1, 0, 3),
                encode(1, 7, 0),
            ],
            &[2, 3],
        )
        .unwrap();
        let mut e = Eligibility::all_eligible(4);
        let n = retire_progenitors(
            EligibilityPolicy::AllProgenitors,
            &mut e,
            &[0, 1],
            &[0],
            Some(&list),
            &window,
        )
        .unwrap();
        assert_eq!(n, 3);
        assert_eq!(e.to_u8(), vec![0, 0, 0, 1]);

        let mut e = Eligibility::all_eligible(4);
        let err =
            retire_progenitors(EligibilityPolicy::AllProgenitors, &mut e, &[], &[0], None, &window)
                .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightconeError>(),
            Some(LightconeError::MissingProgenitorLists)
        ));
    }
}
