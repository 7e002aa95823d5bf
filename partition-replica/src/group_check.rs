//! Per-member liveness bookkeeping for the group check protocol.
//!
//! The primary broadcasts a group check every `group_check_interval`. Each
//! round, a member whose previous check is still unanswered has its missed
//! counter bumped; an answer resets it. Members that reach the threshold are
//! returned to the caller for escalation.
//!
//! ```text
//! Primary                         Secondary
//!   │── GroupCheck(ballot, lcd) ──>│   round 1
//!   │<── GroupCheckReply(ok) ──────│   missed = 0
//!   │── GroupCheck(ballot, lcd) ──>│   round 2
//!   │        ✗                     │
//!   │── GroupCheck ...            │   round 3: missed = 1
//!   │── GroupCheck ...            │   round 4: missed = 2
//!   │── GroupCheck ...            │   round 5: missed = 3 → escalate
//! ```
//!
//! Time is a `Duration` from an arbitrary epoch so the tracker works with
//! logical time in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeAddress;

/// Liveness record for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCheckRecord {
    /// Time of the last acknowledged check.
    pub last_ack_time: Duration,
    /// Whether the latest check is still unanswered.
    pub outstanding: bool,
    /// Consecutive rounds that ended unanswered.
    pub missed_periods: u32,
}

/// Tracks group check acknowledgments for every supervised member.
#[derive(Debug, Clone)]
pub struct GroupCheckTracker {
    records: BTreeMap<NodeAddress, GroupCheckRecord>,
    max_missed_periods: u32,
}

impl GroupCheckTracker {
    /// Create an empty tracker escalating after `max_missed_periods` misses.
    pub fn new(max_missed_periods: u32) -> Self {
        Self {
            records: BTreeMap::new(),
            max_missed_periods: max_missed_periods.max(1),
        }
    }

    /// Forget every member.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Start supervising `node`, treating it as alive at `now`.
    pub fn add_member(&mut self, node: NodeAddress, now: Duration) {
        self.records.insert(
            node,
            GroupCheckRecord {
                last_ack_time: now,
                outstanding: false,
                missed_periods: 0,
            },
        );
    }

    /// Stop supervising `node`.
    pub fn remove_member(&mut self, node: &NodeAddress) -> bool {
        self.records.remove(node).is_some()
    }

    /// Whether `node` is supervised.
    pub fn contains(&self, node: &NodeAddress) -> bool {
        self.records.contains_key(node)
    }

    /// Begin a new round. Returns the members that crossed the threshold.
    pub fn begin_round(&mut self) -> Vec<NodeAddress> {
        let mut failed = Vec::new();
        for (node, record) in self.records.iter_mut() {
            if record.outstanding {
                record.missed_periods += 1;
            }
            record.outstanding = true;
            if record.missed_periods >= self.max_missed_periods {
                failed.push(*node);
            }
        }
        failed
    }

    /// Record an answered check. Returns `false` for unknown members.
    pub fn record_ack(&mut self, node: &NodeAddress, now: Duration) -> bool {
        match self.records.get_mut(node) {
            Some(record) => {
                record.outstanding = false;
                record.missed_periods = 0;
                record.last_ack_time = now;
                true
            }
            None => false,
        }
    }

    /// Record of a single member.
    pub fn record(&self, node: &NodeAddress) -> Option<&GroupCheckRecord> {
        self.records.get(node)
    }

    /// All records, ordered by address.
    pub fn records(&self) -> impl Iterator<Item = (&NodeAddress, &GroupCheckRecord)> + '_ {
        self.records.iter()
    }

    /// Time since `node` last answered.
    pub fn time_since_last_ack(&self, node: &NodeAddress, now: Duration) -> Option<Duration> {
        self.records
            .get(node)
            .map(|r| now.saturating_sub(r.last_ack_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::make_addr;

    #[test]
    fn test_answered_rounds_never_fail() {
        let mut tracker = GroupCheckTracker::new(3);
        let a = make_addr(5002);
        tracker.add_member(a, Duration::ZERO);

        for round in 1..=10u64 {
            assert!(tracker.begin_round().is_empty());
            assert!(tracker.record_ack(&a, Duration::from_millis(round * 100)));
        }
        let record = tracker.record(&a).expect("record");
        assert_eq!(record.missed_periods, 0);
        assert_eq!(record.last_ack_time, Duration::from_millis(1000));
    }

    #[test]
    fn test_three_missed_rounds_escalate() {
        let mut tracker = GroupCheckTracker::new(3);
        let a = make_addr(5002);
        let b = make_addr(5003);
        tracker.add_member(a, Duration::ZERO);
        tracker.add_member(b, Duration::ZERO);

        // Round 1 sends; A never answers, B always does.
        assert!(tracker.begin_round().is_empty());
        tracker.record_ack(&b, Duration::from_millis(100));
        assert!(tracker.begin_round().is_empty());
        tracker.record_ack(&b, Duration::from_millis(200));
        assert!(tracker.begin_round().is_empty());
        tracker.record_ack(&b, Duration::from_millis(300));

        let failed = tracker.begin_round();
        assert_eq!(failed, vec![a]);
        assert_eq!(tracker.record(&a).map(|r| r.missed_periods), Some(3));
    }

    #[test]
    fn test_ack_resets_missed_counter() {
        let mut tracker = GroupCheckTracker::new(3);
        let a = make_addr(5002);
        tracker.add_member(a, Duration::ZERO);
        tracker.begin_round();
        tracker.begin_round();
        tracker.begin_round();
        assert_eq!(tracker.record(&a).map(|r| r.missed_periods), Some(2));
        tracker.record_ack(&a, Duration::from_millis(300));
        assert!(tracker.begin_round().is_empty());
        assert_eq!(tracker.record(&a).map(|r| r.missed_periods), Some(0));
    }

    #[test]
    fn test_unknown_member() {
        let mut tracker = GroupCheckTracker::new(3);
        assert!(!tracker.record_ack(&make_addr(5009), Duration::ZERO));
        assert!(tracker.time_since_last_ack(&make_addr(5009), Duration::ZERO).is_none());
    }
}
