//! Contiguous offset tracking for out-of-order settlement.
//!
//! Deliveries are settled in whatever order processing finishes, but a
//! Kafka commit covers every offset below it. Committing offset `n + 1`
//! is therefore only safe once every delivered offset up to `n` in that
//! partition has been settled.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct PartitionOffsets {
    // Delivered offsets, `true` once settled.
    in_flight: BTreeMap<i64, bool>,
    // Next offset to read, as last committed.
    position: Option<i64>,
}

/// Per-partition record of delivered and settled offsets.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was handed to the consumer.
    pub fn delivered(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .in_flight
            .insert(offset, false);
    }

    /// Record that `offset` was settled.
    ///
    /// Returns the new commit position (one past the highest contiguous
    /// settled offset) if it advanced, `None` otherwise. Unknown offsets are
    /// ignored.
    pub fn settled(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let offsets = self.partitions.get_mut(&partition)?;
        match offsets.in_flight.get_mut(&offset) {
            Some(settled) => *settled = true,
            None => return None,
        }

        let mut advanced = None;
        while let Some(entry) = offsets.in_flight.first_entry() {
            if !*entry.get() {
                break;
            }
            advanced = Some(*entry.key() + 1);
            entry.remove();
        }

        if advanced.is_some() {
            offsets.position = advanced;
        }
        advanced
    }

    /// Delivered offsets not yet settled, across all partitions.
    #[must_use]
    pub fn unsettled(&self) -> usize {
        self.partitions
            .values()
            .map(|offsets| offsets.in_flight.values().filter(|settled| !**settled).count())
            .sum()
    }

    /// Latest commit position of every partition that has one.
    #[must_use]
    pub fn positions(&self) -> Vec<(i32, i64)> {
        self.partitions
            .iter()
            .filter_map(|(partition, offsets)| offsets.position.map(|position| (*partition, position)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_settlement_advances_each_time() {
        let mut tracker = OffsetTracker::new();
        tracker.delivered(0, 10);
        tracker.delivered(0, 11);

        assert_eq!(tracker.settled(0, 10), Some(11));
        assert_eq!(tracker.settled(0, 11), Some(12));
        assert_eq!(tracker.unsettled(), 0);
    }

    #[test]
    fn gap_holds_the_commit_back() {
        let mut tracker = OffsetTracker::new();
        for offset in 0..4 {
            tracker.delivered(0, offset);
        }

        assert_eq!(tracker.settled(0, 2), None);
        assert_eq!(tracker.settled(0, 1), None);
        assert_eq!(tracker.unsettled(), 2);
        // Offset 0 closes the gap up to 2.
        assert_eq!(tracker.settled(0, 0), Some(3));
        assert_eq!(tracker.settled(0, 3), Some(4));
        assert_eq!(tracker.positions(), vec![(0, 4)]);
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.delivered(0, 5);
        tracker.delivered(1, 7);
        tracker.delivered(1, 8);

        assert_eq!(tracker.settled(1, 8), None);
        assert_eq!(tracker.settled(0, 5), Some(6));
        assert_eq!(tracker.positions(), vec![(0, 6)]);
        assert_eq!(tracker.settled(1, 7), Some(9));
        assert_eq!(tracker.positions(), vec![(0, 6), (1, 9)]);
    }

    #[test]
    fn unknown_and_repeated_settlements_are_ignored() {
        let mut tracker = OffsetTracker::new();
        assert_eq!(tracker.settled(3, 1), None);

        tracker.delivered(0, 1);
        assert_eq!(tracker.settled(0, 1), Some(2));
        assert_eq!(tracker.settled(0, 1), None);
        assert_eq!(tracker.positions(), vec![(0, 2)]);
    }
}
