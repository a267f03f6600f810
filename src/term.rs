//! Term Tracker
//!
//! Fencing terms. A device's term lives in its role record; this module
//! owns the rule for when it moves: exactly once per newly installed
//! master, by exactly one.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::role::{MastershipTerm, RoleRecord};

/// Applies the fencing rule to role record transitions
#[derive(Debug, Default)]
pub struct TermTracker {
    /// Committed terms issued by this process
    bumps: AtomicU64,
}

impl TermTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Term following `current`
    pub fn bump(current: MastershipTerm) -> MastershipTerm {
        current.saturating_add(1)
    }

    /// Carry the term from `previous` into `next`, bumping it if `next`
    /// installs a different master.
    ///
    /// Standby reordering, demotion to no master and re-confirming the same
    /// master leave the term unchanged. Returns the new term if bumped.
    /// Nothing is counted until the record is committed, see [`Self::committed`].
    pub fn fence(&self, previous: &RoleRecord, next: &mut RoleRecord) -> Option<MastershipTerm> {
        next.term = previous.term;
        match &next.master {
            Some(master) if previous.master.as_ref() != Some(master) => {
                next.term = Self::bump(previous.term);
                Some(next.term)
            }
            _ => None,
        }
    }

    /// Note a committed transition; counts it if the term moved
    pub fn committed(&self, previous: &RoleRecord, current: &RoleRecord) {
        if current.term > previous.term {
            self.bumps.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of committed terms issued by this process
    pub fn bumps_issued(&self) -> u64 {
        self.bumps.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::NodeId;

    fn record(master: Option<&str>, standbys: &[&str], term: MastershipTerm) -> RoleRecord {
        RoleRecord {
            master: master.map(NodeId::new),
            standbys: standbys.iter().map(|s| NodeId::new(*s)).collect(),
            term,
        }
    }

    #[test]
    fn test_bootstrap_goes_from_zero_to_one() {
        let terms = TermTracker::new();
        let previous = RoleRecord::new();
        let mut next = record(Some("node-1"), &[], 0);
        assert_eq!(terms.fence(&previous, &mut next), Some(1));
        assert_eq!(next.term, 1);
    }

    #[test]
    fn test_only_committed_bumps_are_counted() {
        let terms = TermTracker::new();
        let previous = RoleRecord::new();

        // Fenced three times by lost rounds, committed once
        let mut next = record(Some("node-1"), &[], 0);
        for _ in 0..3 {
            terms.fence(&previous, &mut next);
        }
        assert_eq!(terms.bumps_issued(), 0);

        terms.committed(&previous, &next);
        assert_eq!(terms.bumps_issued(), 1);

        let mut reordered = record(Some("node-1"), &["node-2"], 0);
        terms.fence(&next, &mut reordered);
        terms.committed(&next, &reordered);
        assert_eq!(terms.bumps_issued(), 1);
    }

    #[test]
    fn test_standby_reorder_keeps_term() {
        let terms = TermTracker::new();
        let previous = record(Some("node-1"), &["node-2", "node-3"], 5);
        let mut next = record(Some("node-1"), &["node-3", "node-2"], 0);
        assert_eq!(terms.fence(&previous, &mut next), None);
        assert_eq!(next.term, 5);
    }

    #[test]
    fn test_losing_master_keeps_term_until_next_master() {
        let terms = TermTracker::new();
        let previous = record(Some("node-1"), &[], 3);
        let mut orphaned = record(None, &[], 0);
        assert_eq!(terms.fence(&previous, &mut orphaned), None);
        assert_eq!(orphaned.term, 3);

        // Even the same node coming back is a new assignment
        let mut next = record(Some("node-1"), &[], 0);
        assert_eq!(terms.fence(&orphaned, &mut next), Some(4));
    }

    #[test]
    fn test_caller_cannot_forge_term() {
        let terms = TermTracker::new();
        let previous = record(Some("node-1"), &[], 2);
        let mut next = record(Some("node-2"), &["node-1"], 42);
        terms.fence(&previous, &mut next);
        assert_eq!(next.term, 3);
    }
}
