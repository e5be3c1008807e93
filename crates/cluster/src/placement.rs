//! Ensemble placement.
//!
//! The ledger client consumes an [`EnsemblePlacementPolicy`] to pick the
//! bookies of a new ledger and to pick a substitute when a bookie fails
//! mid-write. [`RandomPlacementPolicy`] is the stock implementation: it
//! samples uniformly among the writable bookies it was told about.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt::Debug,
};

use parking_lot::RwLock;
use rand::seq::{IndexedRandom, SliceRandom};

use crate::{
    error::PlacementError,
    types::{BookieId, QuorumSizes},
};

/// Capability contract for choosing ensemble members.
pub trait EnsemblePlacementPolicy: Send + Sync + Debug {
    /// Chooses an ordered ensemble of exactly `quorum.ensemble_size()` bookies,
    /// none of them in `excluded`.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::NotEnoughBookies`] when too few writable
    /// bookies remain.
    fn new_ensemble(
        &self,
        quorum: QuorumSizes,
        custom_metadata: &BTreeMap<String, Vec<u8>>,
        excluded: &HashSet<BookieId>,
    ) -> Result<Vec<BookieId>, PlacementError>;

    /// Chooses a substitute for `failed` that is neither in `current_ensemble`
    /// nor in `excluded`.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::NotEnoughBookies`] when no candidate remains.
    fn replace_bookie(
        &self,
        quorum: QuorumSizes,
        custom_metadata: &BTreeMap<String, Vec<u8>>,
        current_ensemble: &[BookieId],
        failed: &BookieId,
        excluded: &HashSet<BookieId>,
    ) -> Result<BookieId, PlacementError>;

    /// Informs the policy of the current cluster membership.
    fn on_cluster_changed(&self, writable: &BTreeSet<BookieId>, read_only: &BTreeSet<BookieId>);
}

#[derive(Debug, Default)]
struct KnownBookies {
    writable: BTreeSet<BookieId>,
    read_only: BTreeSet<BookieId>,
}

/// Picks ensemble members uniformly at random among writable bookies.
#[derive(Debug, Default)]
pub struct RandomPlacementPolicy {
    known: RwLock<KnownBookies>,
}

impl RandomPlacementPolicy {
    /// Creates a policy that knows about the given writable bookies.
    pub fn new(writable: impl IntoIterator<Item = BookieId>) -> Self {
        Self {
            known: RwLock::new(KnownBookies {
                writable: writable.into_iter().collect(),
                read_only: BTreeSet::new(),
            }),
        }
    }

    /// Returns the writable bookies the policy currently knows about.
    #[must_use]
    pub fn writable_bookies(&self) -> BTreeSet<BookieId> {
        self.known.read().writable.clone()
    }

    fn candidates(&self, skip: impl Fn(&BookieId) -> bool) -> Vec<BookieId> {
        self.known.read().writable.iter().filter(|bookie| !skip(bookie)).cloned().collect()
    }
}

impl EnsemblePlacementPolicy for RandomPlacementPolicy {
    fn new_ensemble(
        &self,
        quorum: QuorumSizes,
        _custom_metadata: &BTreeMap<String, Vec<u8>>,
        excluded: &HashSet<BookieId>,
    ) -> Result<Vec<BookieId>, PlacementError> {
        let mut candidates = self.candidates(|bookie| excluded.contains(bookie));
        let required = quorum.ensemble_size();
        if candidates.len() < required {
            return Err(PlacementError::NotEnoughBookies {
                required,
                available: candidates.len(),
            });
        }
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(required);
        Ok(candidates)
    }

    fn replace_bookie(
        &self,
        _quorum: QuorumSizes,
        _custom_metadata: &BTreeMap<String, Vec<u8>>,
        current_ensemble: &[BookieId],
        failed: &BookieId,
        excluded: &HashSet<BookieId>,
    ) -> Result<BookieId, PlacementError> {
        let candidates = self.candidates(|bookie| {
            bookie == failed || excluded.contains(bookie) || current_ensemble.contains(bookie)
        });
        candidates
            .choose(&mut rand::rng())
            .cloned()
            .ok_or(PlacementError::NotEnoughBookies { required: 1, available: 0 })
    }

    fn on_cluster_changed(&self, writable: &BTreeSet<BookieId>, read_only: &BTreeSet<BookieId>) {
        let mut known = self.known.write();
        if known.writable != *writable || known.read_only != *read_only {
            tracing::info!(
                writable = writable.len(),
                read_only = read_only.len(),
                "placement policy cluster membership changed",
            );
        }
        known.writable = writable.clone();
        known.read_only = read_only.clone();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn bookies(n: usize) -> Vec<BookieId> {
        (0..n).map(|i| BookieId::new(format!("bookie-{i}"))).collect()
    }

    fn quorum(e: usize, w: usize, a: usize) -> QuorumSizes {
        QuorumSizes::new(e, w, a).unwrap()
    }

    #[rstest]
    #[case::exact_fit(3, 3)]
    #[case::spare_bookies(5, 3)]
    #[case::single(1, 1)]
    fn new_ensemble_has_distinct_members(#[case] available: usize, #[case] ensemble: usize) {
        let policy = RandomPlacementPolicy::new(bookies(available));
        let chosen =
            policy.new_ensemble(quorum(ensemble, 1, 1), &BTreeMap::new(), &HashSet::new()).unwrap();

        assert_eq!(chosen.len(), ensemble);
        let distinct: BTreeSet<_> = chosen.iter().collect();
        assert_eq!(distinct.len(), ensemble);
    }

    #[test]
    fn new_ensemble_respects_exclusions() {
        let all = bookies(4);
        let policy = RandomPlacementPolicy::new(all.clone());
        let excluded: HashSet<_> = [all[0].clone()].into_iter().collect();

        let chosen = policy.new_ensemble(quorum(3, 2, 2), &BTreeMap::new(), &excluded).unwrap();
        assert!(!chosen.contains(&all[0]));
    }

    #[test]
    fn new_ensemble_fails_when_short() {
        let policy = RandomPlacementPolicy::new(bookies(2));
        let err =
            policy.new_ensemble(quorum(3, 2, 2), &BTreeMap::new(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, PlacementError::NotEnoughBookies { required: 3, available: 2 }));
    }

    #[test]
    fn replace_bookie_picks_outsider() {
        let all = bookies(4);
        let policy = RandomPlacementPolicy::new(all.clone());
        let ensemble = all[..3].to_vec();

        let replacement = policy
            .replace_bookie(quorum(3, 2, 2), &BTreeMap::new(), &ensemble, &all[1], &HashSet::new())
            .unwrap();
        assert_eq!(replacement, all[3]);
    }

    #[test]
    fn replace_bookie_fails_without_spare() {
        let all = bookies(3);
        let policy = RandomPlacementPolicy::new(all.clone());

        let result =
            policy.replace_bookie(quorum(3, 3, 3), &BTreeMap::new(), &all, &all[0], &HashSet::new());
        assert!(result.is_err());
    }

    #[test]
    fn cluster_change_removes_dead_bookies() {
        let all = bookies(4);
        let policy = RandomPlacementPolicy::new(all.clone());
        let writable: BTreeSet<_> = all[..2].iter().cloned().collect();
        let read_only: BTreeSet<_> = [all[2].clone()].into_iter().collect();

        policy.on_cluster_changed(&writable, &read_only);

        assert_eq!(policy.writable_bookies(), writable);
        let err =
            policy.new_ensemble(quorum(3, 3, 3), &BTreeMap::new(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, PlacementError::NotEnoughBookies { available: 2, .. }));
    }
}
