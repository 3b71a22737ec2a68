// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{Acquire, Release},
    },
    Arc,
};

/// Logical timestamp, drawn from a single engine-wide counter.
///
/// Transactions receive one at start and another at commit; the GC uses the
/// same notion of time for its epochs. A higher timestamp happens-after a
/// lower one.
pub type Timestamp = u64;

/// Thread-safe timestamp generator
#[derive(Clone, Default, Debug)]
pub(crate) struct TimestampCounter(Arc<AtomicU64>);

impl TimestampCounter {
    /// Gets the would-be-next timestamp, without incrementing the counter.
    #[must_use]
    pub fn get(&self) -> Timestamp {
        self.0.load(Acquire)
    }

    /// Gets the next timestamp.
    #[must_use]
    #[allow(clippy::missing_panics_doc, reason = "we should never run out of u64s")]
    pub fn next(&self) -> Timestamp {
        let ts = self.0.fetch_add(1, Release);

        // The MSB is reserved for the pending-transaction write sentinel,
        // which is computed as start time + (u64::MAX >> 1).
        //
        // This gives us 63-bit timestamps technically.
        assert!(ts < 0x8000_0000_0000_0000, "Ran out of timestamps");

        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn timestamps_are_monotonic() {
        let counter = TimestampCounter::default();
        let a = counter.next();
        let b = counter.next();
        assert!(a < b);
        assert_eq!(b + 1, counter.get());
    }

    #[test]
    fn counter_is_shared_between_clones() {
        let counter = TimestampCounter::default();
        let clone = counter.clone();
        let a = counter.next();
        let b = clone.next();
        assert!(a < b);
    }
}
