//! Round-robin striping of entries over an ensemble.
//!
//! Entry `e` of a ledger with ensemble size E and write quorum W is stored on
//! the W consecutive ensemble positions starting at `e mod E`:
//!
//! ```text
//! E = 5, W = 3
//!
//! entry 0 ──▶ positions 0 1 2
//! entry 1 ──▶ positions 1 2 3
//! entry 3 ──▶ positions 3 4 0
//! ```
//!
//! The schedule also owns the quorum arithmetic: [`AckSet`] decides when an
//! add is durable or hopeless, and [`CoverageSet`] decides when enough
//! bookies answered a last-add-confirmed query to trust its result.

use quorumlog_cluster::QuorumSizes;

/// Maps entry ids to ensemble positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionSchedule {
    quorum: QuorumSizes,
}

impl DistributionSchedule {
    /// Creates the schedule for a ledger's quorum sizes.
    #[must_use]
    pub fn new(quorum: QuorumSizes) -> Self {
        Self { quorum }
    }

    /// The quorum sizes this schedule stripes for.
    #[must_use]
    pub fn quorum(&self) -> QuorumSizes {
        self.quorum
    }

    /// Ordered ensemble positions that store `entry_id`.
    #[must_use]
    pub fn write_set(&self, entry_id: i64) -> Vec<usize> {
        let ensemble = self.quorum.ensemble_size();
        let first = first_position(entry_id, ensemble);
        (0..self.quorum.write_quorum()).map(|i| (first + i) % ensemble).collect()
    }

    /// Returns `true` if `position` stores `entry_id`.
    #[must_use]
    pub fn has_entry(&self, entry_id: i64, position: usize) -> bool {
        let ensemble = self.quorum.ensemble_size();
        if position >= ensemble {
            return false;
        }
        let first = first_position(entry_id, ensemble);
        (position + ensemble - first) % ensemble < self.quorum.write_quorum()
    }

    /// Returns `true` if every position stores every entry.
    #[must_use]
    pub fn is_fully_replicated(&self) -> bool {
        self.quorum.write_quorum() == self.quorum.ensemble_size()
    }

    /// Tracker for the acknowledgements of one add.
    #[must_use]
    pub fn ack_set(&self, entry_id: i64) -> AckSet {
        AckSet::new(self.write_set(entry_id), self.quorum.ack_quorum())
    }

    /// Tracker for the answers to one last-add-confirmed query.
    #[must_use]
    pub fn coverage_set(&self) -> CoverageSet {
        CoverageSet::new(*self)
    }
}

fn first_position(entry_id: i64, ensemble: usize) -> usize {
    let ensemble = i64::try_from(ensemble).unwrap_or(i64::MAX);
    usize::try_from(entry_id.rem_euclid(ensemble)).unwrap_or(0)
}

/// Per-position state inside a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    /// No answer yet.
    Pending,
    /// The position acknowledged.
    Success,
    /// The position failed or timed out.
    Failed,
}

/// Acknowledgement tracker for one add.
///
/// Succeeds once `ack_quorum` distinct positions of the write set
/// acknowledged; becomes infeasible once more than `W - A` failed.
#[derive(Debug, Clone)]
pub struct AckSet {
    write_set: Vec<usize>,
    states: Vec<PositionState>,
    ack_quorum: usize,
}

impl AckSet {
    fn new(write_set: Vec<usize>, ack_quorum: usize) -> Self {
        let states = vec![PositionState::Pending; write_set.len()];
        Self { write_set, states, ack_quorum }
    }

    /// Ensemble positions this add was sent to.
    #[must_use]
    pub fn write_set(&self) -> &[usize] {
        &self.write_set
    }

    fn slot(&self, position: usize) -> Option<usize> {
        self.write_set.iter().position(|p| *p == position)
    }

    /// Records an acknowledgement; returns `true` if the quorum is now met.
    ///
    /// Acks from positions outside the write set, and repeated acks, are ignored.
    pub fn complete_ack(&mut self, position: usize) -> bool {
        if let Some(slot) = self.slot(position) {
            self.states[slot] = PositionState::Success;
        }
        self.has_quorum()
    }

    /// Records a failure; returns `true` if the quorum is still reachable.
    ///
    /// A position that already acknowledged keeps its ack.
    pub fn fail(&mut self, position: usize) -> bool {
        if let Some(slot) = self.slot(position) {
            if self.states[slot] != PositionState::Success {
                self.states[slot] = PositionState::Failed;
            }
        }
        self.is_feasible()
    }

    /// Forgets the outcome of a position about to be re-sent to a new bookie.
    pub fn reset(&mut self, position: usize) {
        if let Some(slot) = self.slot(position) {
            self.states[slot] = PositionState::Pending;
        }
    }

    /// State of one position, `None` outside the write set.
    #[must_use]
    pub fn state(&self, position: usize) -> Option<PositionState> {
        self.slot(position).map(|slot| self.states[slot])
    }

    /// Number of distinct acknowledgements.
    #[must_use]
    pub fn acks(&self) -> usize {
        self.states.iter().filter(|s| **s == PositionState::Success).count()
    }

    /// Number of failed positions.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.states.iter().filter(|s| **s == PositionState::Failed).count()
    }

    /// Returns `true` once the ack quorum is met.
    #[must_use]
    pub fn has_quorum(&self) -> bool {
        self.acks() >= self.ack_quorum
    }

    /// Returns `true` while the ack quorum can still be met.
    #[must_use]
    pub fn is_feasible(&self) -> bool {
        self.failures() <= self.write_set.len() - self.ack_quorum
    }
}

/// Answer tracker for a last-add-confirmed query over a whole ensemble.
///
/// The answers cover the ensemble once every distinct write set has at least
/// `W - A + 1` positions that answered. Any entry acknowledged by an ack
/// quorum is then guaranteed to be visible in at least one answer.
#[derive(Debug, Clone)]
pub struct CoverageSet {
    schedule: DistributionSchedule,
    states: Vec<PositionState>,
}

impl CoverageSet {
    fn new(schedule: DistributionSchedule) -> Self {
        let states = vec![PositionState::Pending; schedule.quorum.ensemble_size()];
        Self { schedule, states }
    }

    /// Records that `position` answered, with data or with "nothing stored".
    /// Returns `true` if the ensemble is now covered.
    pub fn add_answer(&mut self, position: usize) -> bool {
        if let Some(state) = self.states.get_mut(position) {
            *state = PositionState::Success;
        }
        self.is_covered()
    }

    /// Records that `position` failed. Returns `true` while coverage is
    /// still reachable.
    pub fn add_failure(&mut self, position: usize) -> bool {
        if let Some(state) = self.states.get_mut(position) {
            if *state != PositionState::Success {
                *state = PositionState::Failed;
            }
        }
        self.is_reachable()
    }

    /// Returns `true` once the answers cover every write set.
    #[must_use]
    pub fn is_covered(&self) -> bool {
        let needed = self.schedule.quorum.tolerated_failures() + 1;
        self.count_per_write_set(PositionState::Success).all(|answered| answered >= needed)
    }

    /// Returns `true` while the remaining positions can still cover every write set.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        let ack_quorum = self.schedule.quorum.ack_quorum();
        self.count_per_write_set(PositionState::Failed).all(|failed| failed < ack_quorum)
    }

    fn count_per_write_set(&self, wanted: PositionState) -> impl Iterator<Item = usize> + '_ {
        let ensemble = self.schedule.quorum.ensemble_size();
        (0..ensemble).map(move |first| {
            self.schedule
                .write_set(i64::try_from(first).unwrap_or(0))
                .into_iter()
                .filter(|position| self.states[*position] == wanted)
                .count()
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn schedule(e: usize, w: usize, a: usize) -> DistributionSchedule {
        DistributionSchedule::new(QuorumSizes::new(e, w, a).unwrap())
    }

    #[rstest]
    #[case::first_entry(0, vec![0, 1, 2])]
    #[case::middle(1, vec![1, 2, 3])]
    #[case::wraps(3, vec![3, 4, 0])]
    #[case::second_round(7, vec![2, 3, 4])]
    fn write_set_is_round_robin(#[case] entry_id: i64, #[case] expected: Vec<usize>) {
        assert_eq!(schedule(5, 3, 2).write_set(entry_id), expected);
    }

    #[test]
    fn has_entry_agrees_with_write_set() {
        let s = schedule(5, 3, 2);
        for entry in 0..20 {
            let set = s.write_set(entry);
            for position in 0..5 {
                assert_eq!(s.has_entry(entry, position), set.contains(&position));
            }
        }
        assert!(!s.has_entry(0, 5));
    }

    #[test]
    fn ack_set_needs_ack_quorum() {
        let mut acks = schedule(3, 3, 2).ack_set(0);
        assert!(!acks.complete_ack(0));
        assert!(!acks.complete_ack(0), "duplicate acks are not double counted");
        assert!(acks.complete_ack(2));
    }

    #[test]
    fn ack_set_ignores_positions_outside_write_set() {
        let mut acks = schedule(4, 2, 2).ack_set(0);
        assert!(!acks.complete_ack(3));
        assert_eq!(acks.acks(), 0);
    }

    #[rstest]
    #[case::tolerates_none(3, 3, 3, 0)]
    #[case::tolerates_one(3, 3, 2, 1)]
    #[case::tolerates_two(5, 3, 1, 2)]
    fn ack_set_feasibility(
        #[case] e: usize,
        #[case] w: usize,
        #[case] a: usize,
        #[case] tolerated: usize,
    ) {
        let mut acks = schedule(e, w, a).ack_set(0);
        let write_set = acks.write_set().to_vec();
        for (i, position) in write_set.iter().enumerate() {
            let feasible = acks.fail(*position);
            assert_eq!(feasible, i < tolerated, "after {} failures", i + 1);
        }
    }

    #[test]
    fn ack_set_failure_does_not_erase_ack() {
        let mut acks = schedule(3, 2, 2).ack_set(0);
        acks.complete_ack(0);
        acks.fail(0);
        assert_eq!(acks.state(0), Some(PositionState::Success));
    }

    #[test]
    fn ack_set_reset_clears_failure() {
        let mut acks = schedule(3, 3, 3).ack_set(0);
        assert!(!acks.fail(1));
        acks.reset(1);
        assert!(acks.is_feasible());
        assert_eq!(acks.state(1), Some(PositionState::Pending));
    }

    #[test]
    fn coverage_with_full_replication_needs_one_answer() {
        let mut coverage = schedule(5, 5, 5).coverage_set();
        assert!(coverage.add_answer(3));
    }

    #[test]
    fn coverage_with_striping_needs_every_write_set() {
        // E=3, W=2, A=2: every write set needs one answer.
        let mut coverage = schedule(3, 2, 2).coverage_set();
        assert!(!coverage.add_answer(0), "write set {{1, 2}} is uncovered");
        assert!(coverage.add_answer(1));
    }

    #[test]
    fn coverage_unreachable_once_a_write_set_loses_ack_quorum() {
        // E=3, W=3, A=2: two failures leave only one responder, but W-A+1 = 2 are needed.
        let mut coverage = schedule(3, 3, 2).coverage_set();
        assert!(coverage.add_failure(0));
        assert!(!coverage.add_failure(1));
    }

    #[test]
    fn coverage_failure_after_answer_keeps_answer() {
        let mut coverage = schedule(3, 3, 3).coverage_set();
        coverage.add_answer(0);
        assert!(coverage.add_failure(0));
        assert!(coverage.is_covered());
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// Every write set has W distinct positions, all inside the ensemble.
            #[test]
            fn write_sets_are_distinct_positions(
                e in 1..12usize,
                w_off in 0..12usize,
                entry in 0..10_000i64,
            ) {
                let w = 1 + w_off % e;
                let s = schedule(e, w, 1);
                let set = s.write_set(entry);
                prop_assert_eq!(set.len(), w);
                let mut sorted = set.clone();
                sorted.sort_unstable();
                sorted.dedup();
                prop_assert_eq!(sorted.len(), w);
                prop_assert!(set.iter().all(|p| *p < e));
            }

            /// Over E consecutive entries each position stores exactly W entries.
            #[test]
            fn striping_is_balanced(e in 1..12usize, w_off in 0..12usize, start in 0..1_000i64) {
                let w = 1 + w_off % e;
                let s = schedule(e, w, 1);
                let mut load = vec![0usize; e];
                for entry in start..start + e as i64 {
                    for position in s.write_set(entry) {
                        load[position] += 1;
                    }
                }
                prop_assert!(load.iter().all(|l| *l == w));
            }
        }
    }
}
