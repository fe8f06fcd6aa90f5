//! Candidate server address tracking
//!
//! The address list itself lives in [`PeeringRecord::peer_server_addresses`](crate::PeeringRecord);
//! the tracker only holds the cursor of the current pass and per-address
//! failure counts, and reorders the record's list in place.
//!
//! Within a pass candidates are tried strictly in list order. Reordering
//! happens only when a new pass starts: addresses that failed at least
//! `failover_threshold` times in a row move to the back (stable, so relative
//! order is kept), and a candidate that connects moves to the front. Nothing
//! is ever removed except by an authoritative replacement of the whole list.

use std::collections::HashMap;

/// Cursor and failure counts over a peering's address list
#[derive(Debug, Clone)]
pub struct AddressTracker {
    cursor: usize,
    failures: HashMap<String, u32>,
    threshold: u32,
}

impl AddressTracker {
    /// Create a tracker with the given consecutive-failure threshold
    pub fn new(threshold: u32) -> Self {
        Self {
            cursor: 0,
            failures: HashMap::new(),
            threshold: threshold.max(1),
        }
    }

    /// Begin a new pass: demote repeatedly failing addresses and rewind
    ///
    /// Returns whether the order of `addresses` changed.
    pub fn start_pass(&mut self, addresses: &mut Vec<String>) -> bool {
        self.cursor = 0;
        let before = addresses.clone();
        // sort_by_key is stable, so healthy and failing groups keep their order
        addresses.sort_by_key(|addr| self.failures_of(addr) >= self.threshold);
        *addresses != before
    }

    /// Next candidate of the current pass, `None` once the pass is exhausted
    pub fn next_candidate(&mut self, addresses: &[String]) -> Option<String> {
        let candidate = addresses.get(self.cursor).cloned();
        if candidate.is_some() {
            self.cursor += 1;
        }
        candidate
    }

    /// Record a failed connection attempt
    pub fn report_failure(&mut self, address: &str) {
        *self.failures.entry(address.to_string()).or_insert(0) += 1;
    }

    /// Record a successful connection: reset its failures and move it to the front
    ///
    /// Returns whether the order of `addresses` changed.
    pub fn report_success(&mut self, address: &str, addresses: &mut Vec<String>) -> bool {
        self.failures.remove(address);
        match addresses.iter().position(|a| a == address) {
            Some(0) | None => false,
            Some(pos) => {
                let addr = addresses.remove(pos);
                addresses.insert(0, addr);
                true
            }
        }
    }

    /// Replace the whole list with an authoritative update
    ///
    /// Failure counts survive for addresses that are still present; the
    /// cursor rewinds so the next pass starts from the new head.
    pub fn replace(&mut self, addresses: &mut Vec<String>, update: Vec<String>) {
        self.failures.retain(|addr, _| update.contains(addr));
        *addresses = update;
        self.cursor = 0;
    }

    /// Drop failure counts for addresses no longer in `addresses`
    ///
    /// Used when the list was replaced by another writer of the record.
    pub fn retain(&mut self, addresses: &[String]) {
        self.failures.retain(|addr, _| addresses.contains(addr));
    }

    /// Consecutive failures recorded for `address`
    pub fn failures_of(&self, address: &str) -> u32 {
        self.failures.get(address).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_candidates_follow_list_order_within_a_pass() {
        let mut list = addrs(&["a", "b", "c"]);
        let mut tracker = AddressTracker::new(2);
        tracker.start_pass(&mut list);

        let first = tracker.next_candidate(&list).unwrap();
        assert_eq!(first, "a");
        tracker.report_failure(&first);
        assert_eq!(tracker.next_candidate(&list).as_deref(), Some("b"));
        tracker.report_failure("b");
        assert_eq!(tracker.next_candidate(&list).as_deref(), Some("c"));
        tracker.report_failure("c");
        assert_eq!(tracker.next_candidate(&list), None);
    }

    #[test]
    fn test_new_pass_restarts_from_the_top() {
        let mut list = addrs(&["a", "b"]);
        let mut tracker = AddressTracker::new(2);
        tracker.start_pass(&mut list);
        while let Some(addr) = tracker.next_candidate(&list) {
            tracker.report_failure(&addr);
        }
        // one failure each is below the threshold, so order is unchanged
        assert!(!tracker.start_pass(&mut list));
        assert_eq!(tracker.next_candidate(&list).as_deref(), Some("a"));
    }

    #[test]
    fn test_repeated_failures_move_to_back_but_stay_listed() {
        let mut list = addrs(&["a", "b", "c"]);
        let mut tracker = AddressTracker::new(2);
        tracker.report_failure("a");
        tracker.report_failure("a");
        tracker.report_failure("b");

        assert!(tracker.start_pass(&mut list));
        assert_eq!(list, addrs(&["b", "c", "a"]));
    }

    #[test]
    fn test_success_moves_to_front_and_clears_failures() {
        let mut list = addrs(&["a", "b", "c"]);
        let mut tracker = AddressTracker::new(1);
        tracker.report_failure("c");
        assert!(tracker.report_success("c", &mut list));
        assert_eq!(list, addrs(&["c", "a", "b"]));
        assert_eq!(tracker.failures_of("c"), 0);
        assert!(!tracker.report_success("c", &mut list));
    }

    #[test]
    fn test_replace_keeps_counts_for_surviving_addresses() {
        let mut list = addrs(&["a", "b"]);
        let mut tracker = AddressTracker::new(2);
        tracker.report_failure("a");
        tracker.report_failure("b");
        tracker.next_candidate(&list);

        tracker.replace(&mut list, addrs(&["b", "d"]));
        assert_eq!(list, addrs(&["b", "d"]));
        assert_eq!(tracker.failures_of("a"), 0);
        assert_eq!(tracker.failures_of("b"), 1);
        assert_eq!(tracker.next_candidate(&list).as_deref(), Some("b"));
    }

    #[test]
    fn test_empty_list_has_no_candidates() {
        let mut list = Vec::new();
        let mut tracker = AddressTracker::new(2);
        tracker.start_pass(&mut list);
        assert_eq!(tracker.next_candidate(&list), None);
    }
}
