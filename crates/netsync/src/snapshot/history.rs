use std::collections::VecDeque;
use std::sync::Arc;

use super::world::WorldSnapshot;

/// 5 seconds of history at the default 20 Hz update rate.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLookup {
    Exact(Arc<WorldSnapshot>),
    Between {
        before: Arc<WorldSnapshot>,
        after: Arc<WorldSnapshot>,
    },
    /// The requested time lies outside the stored range; this is the nearest edge.
    Clamped(Arc<WorldSnapshot>),
}

impl SnapshotLookup {
    /// The two snapshots to blend between. Single-snapshot results return it twice.
    pub fn bracket(&self) -> (&Arc<WorldSnapshot>, &Arc<WorldSnapshot>) {
        match self {
            Self::Exact(s) | Self::Clamped(s) => (s, s),
            Self::Between { before, after } => (before, after),
        }
    }
}

/// Fixed-capacity, timestamp-ordered snapshot ring.
///
/// Snapshots are shared out as `Arc`s and never mutated once stored.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    snapshots: VecDeque<Arc<WorldSnapshot>>,
    capacity: usize,
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` when the snapshot was older than everything in a full history.
    pub fn insert(&mut self, snapshot: WorldSnapshot) -> bool {
        self.insert_shared(Arc::new(snapshot))
    }

    pub fn insert_shared(&mut self, snapshot: Arc<WorldSnapshot>) -> bool {
        let timestamp = snapshot.timestamp;
        let mut index = self.snapshots.partition_point(|s| s.timestamp < timestamp);

        if self
            .snapshots
            .get(index)
            .is_some_and(|s| s.timestamp == timestamp)
        {
            self.snapshots[index] = snapshot;
            return true;
        }

        if self.snapshots.len() >= self.capacity {
            if index == 0 {
                return false;
            }
            self.snapshots.pop_front();
            index -= 1;
        }

        self.snapshots.insert(index, snapshot);
        true
    }

    pub fn get_snapshot(&self, timestamp: u64) -> Option<SnapshotLookup> {
        let first = self.snapshots.front()?;
        let last = self.snapshots.back()?;

        if timestamp <= first.timestamp {
            return Some(if timestamp == first.timestamp {
                SnapshotLookup::Exact(Arc::clone(first))
            } else {
                SnapshotLookup::Clamped(Arc::clone(first))
            });
        }
        if timestamp >= last.timestamp {
            return Some(if timestamp == last.timestamp {
                SnapshotLookup::Exact(Arc::clone(last))
            } else {
                SnapshotLookup::Clamped(Arc::clone(last))
            });
        }

        let index = self.snapshots.partition_point(|s| s.timestamp < timestamp);
        let after = &self.snapshots[index];
        if after.timestamp == timestamp {
            return Some(SnapshotLookup::Exact(Arc::clone(after)));
        }
        Some(SnapshotLookup::Between {
            before: Arc::clone(&self.snapshots[index - 1]),
            after: Arc::clone(after),
        })
    }

    pub fn get(&self, timestamp: u64) -> Option<Arc<WorldSnapshot>> {
        let index = self.snapshots.partition_point(|s| s.timestamp < timestamp);
        self.snapshots
            .get(index)
            .filter(|s| s.timestamp == timestamp)
            .cloned()
    }

    pub fn latest(&self) -> Option<Arc<WorldSnapshot>> {
        self.snapshots.back().cloned()
    }

    pub fn oldest(&self) -> Option<Arc<WorldSnapshot>> {
        self.snapshots.front().cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorldSnapshot>> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_with(timestamps: &[u64], capacity: usize) -> SnapshotHistory {
        let mut history = SnapshotHistory::new(capacity);
        for &t in timestamps {
            history.insert(WorldSnapshot::new(t));
        }
        history
    }

    fn timestamps(history: &SnapshotHistory) -> Vec<u64> {
        history.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn out_of_order_inserts_stay_sorted() {
        let history = history_with(&[300, 100, 200, 150], 10);
        assert_eq!(timestamps(&history), vec![100, 150, 200, 300]);
    }

    #[test]
    fn full_history_evicts_oldest() {
        let mut history = history_with(&[100, 200, 300], 3);
        assert!(history.insert(WorldSnapshot::new(400)));
        assert_eq!(timestamps(&history), vec![200, 300, 400]);

        // Older than everything left: discarded.
        assert!(!history.insert(WorldSnapshot::new(50)));
        assert_eq!(timestamps(&history), vec![200, 300, 400]);

        // In the middle: still evicts the oldest.
        assert!(history.insert(WorldSnapshot::new(350)));
        assert_eq!(timestamps(&history), vec![300, 350, 400]);
        assert_eq!(history.len(), history.capacity());
    }

    #[test]
    fn equal_timestamp_replaces() {
        let mut history = history_with(&[100, 200], 2);
        let replacement = WorldSnapshot::new(200)
            .with_entity(crate::snapshot::EntitySnapshot::new(1, glam::Vec2::ONE));
        assert!(history.insert(replacement));
        assert_eq!(history.len(), 2);
        assert_eq!(history.get(200).unwrap().len(), 1);
    }

    #[test]
    fn lookup_cases() {
        let history = history_with(&[100, 150, 200], 10);

        assert!(matches!(history.get_snapshot(150), Some(SnapshotLookup::Exact(s)) if s.timestamp == 150));
        assert!(matches!(
            history.get_snapshot(125),
            Some(SnapshotLookup::Between { before, after }) if before.timestamp == 100 && after.timestamp == 150
        ));
        assert!(matches!(history.get_snapshot(50), Some(SnapshotLookup::Clamped(s)) if s.timestamp == 100));
        assert!(matches!(history.get_snapshot(999), Some(SnapshotLookup::Clamped(s)) if s.timestamp == 200));
        assert!(matches!(history.get_snapshot(200), Some(SnapshotLookup::Exact(s)) if s.timestamp == 200));
    }

    #[test]
    fn empty_history_has_no_lookup() {
        let history = SnapshotHistory::default();
        assert!(history.get_snapshot(0).is_none());
        assert!(history.latest().is_none());
        assert_eq!(history.capacity(), DEFAULT_HISTORY_CAPACITY);
    }

    #[test]
    fn single_snapshot_clamps_both_ways() {
        let history = history_with(&[500], 4);
        let lookup = history.get_snapshot(100).unwrap();
        let (a, b) = lookup.bracket();
        assert_eq!(a.timestamp, 500);
        assert_eq!(b.timestamp, 500);
    }
}
