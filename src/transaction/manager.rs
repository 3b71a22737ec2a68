// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::time::{Timestamp, TimestampCounter};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

/// Graph-wide vertex and edge counts.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub(crate) struct GraphProperties {
    pub num_vertices: i64,
    pub num_edges: i64,
}

/// Engine-wide transaction bookkeeping: the timestamp source, the list of
/// active transactions (whose minimum start time is the high water mark used
/// by pruning and version GC), and the versioned history of the graph
/// properties, keyed by commit time so that any snapshot can read the counts
/// that were current when it started.
pub(crate) struct TransactionManager {
    counter: TimestampCounter,

    /// Serializes transaction begin and commit, so a transaction that starts
    /// after a commit completed always observes its effects.
    boundary_latch: Mutex<()>,

    /// Start times of all pending transactions.
    actives: SkipMap<Timestamp, ()>,

    /// Commit time -> cumulative graph properties.
    properties: SkipMap<Timestamp, GraphProperties>,
}

impl TransactionManager {
    pub fn new() -> Self {
        let manager = Self {
            counter: TimestampCounter::default(),
            boundary_latch: Mutex::new(()),
            actives: SkipMap::new(),
            properties: SkipMap::new(),
        };
        manager.properties.insert(0, GraphProperties::default());
        let _ = manager.counter.next(); // timestamp 0 is the properties base
        manager
    }

    /// Starts a transaction: assigns the start time and registers it as
    /// active.
    pub fn register(&self) -> Timestamp {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let _guard = self.boundary_latch.lock().expect("lock is poisoned");

        let start_time = self.counter.next();
        self.actives.insert(start_time, ());
        start_time
    }

    pub fn unregister(&self, start_time: Timestamp) {
        self.actives.remove(&start_time);
    }

    /// Assigns a commit time and appends the cumulative graph properties.
    ///
    /// The caller stores the returned commit time as the transaction's write
    /// id before the latch guard is dropped.
    pub fn commit(&self, delta: GraphProperties) -> (Timestamp, MutexGuard<'_, ()>) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let guard = self.boundary_latch.lock().expect("lock is poisoned");

        let commit_time = self.counter.next();

        #[expect(clippy::expect_used, reason = "the base entry at time 0 is never removed")]
        let last = *self.properties.back().expect("property list is empty").value();
        self.properties.insert(
            commit_time,
            GraphProperties {
                num_vertices: last.num_vertices + delta.num_vertices,
                num_edges: last.num_edges + delta.num_edges,
            },
        );

        (commit_time, guard)
    }

    /// The minimum start time among pending transactions; every version
    /// older than this is invisible to all current and future snapshots.
    pub fn high_water_mark(&self) -> Timestamp {
        self.actives
            .front()
            .map_or_else(|| self.counter.get(), |entry| *entry.key())
    }

    /// The graph properties as of the given snapshot.
    pub fn properties_at(&self, snapshot: Timestamp) -> GraphProperties {
        self.properties
            .upper_bound(Bound::Included(&snapshot))
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    /// Drops property history entries no live snapshot can read anymore.
    pub fn prune_properties(&self) {
        let high_water_mark = self.high_water_mark();

        let stale = self
            .properties
            .range(..high_water_mark)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();

        // keep the newest entry below the mark as the base for live snapshots
        for key in stale.iter().rev().skip(1) {
            self.properties.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn properties_are_versioned() {
        let manager = TransactionManager::new();
        assert_eq!(GraphProperties::default(), manager.properties_at(0));

        let (t1, guard) = manager.commit(GraphProperties {
            num_vertices: 2,
            num_edges: 1,
        });
        drop(guard);

        let (t2, guard) = manager.commit(GraphProperties {
            num_vertices: -1,
            num_edges: 0,
        });
        drop(guard);

        assert_eq!(GraphProperties::default(), manager.properties_at(t1 - 1));
        assert_eq!(
            GraphProperties {
                num_vertices: 2,
                num_edges: 1
            },
            manager.properties_at(t1)
        );
        assert_eq!(
            GraphProperties {
                num_vertices: 1,
                num_edges: 1
            },
            manager.properties_at(t2)
        );
    }

    #[test]
    fn high_water_mark_tracks_actives() {
        let manager = TransactionManager::new();
        let t1 = manager.register();
        let t2 = manager.register();
        assert_eq!(t1, manager.high_water_mark());

        manager.unregister(t1);
        assert_eq!(t2, manager.high_water_mark());

        manager.unregister(t2);
        assert!(manager.high_water_mark() > t2);
    }

    #[test]
    fn prune_keeps_base_entry() {
        let manager = TransactionManager::new();
        let mut last = 0;
        for i in 0..4 {
            let (t, guard) = manager.commit(GraphProperties {
                num_vertices: 1,
                num_edges: i,
            });
            drop(guard);
            last = t;
        }

        manager.prune_properties();

        // no active transactions: everything but the newest entry may go
        assert_eq!(
            GraphProperties {
                num_vertices: 4,
                num_edges: 3
            },
            manager.properties_at(last)
        );
        assert_eq!(1, manager.properties.len());
    }
}
