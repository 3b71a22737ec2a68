// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::error::Abort;
use std::sync::atomic::{
    AtomicU64,
    Ordering::{Acquire, Relaxed, Release},
};

/// A versioned latch supporting optimistic readers.
///
/// The latch packs, from the most significant bit: `PAYLOAD_BITS` of user
/// payload, a phantom-lock bit, a write-lock bit and a version counter. The
/// all-ones non-payload pattern is the "invalidated" sentinel.
///
/// Writers acquire the latch in mutual exclusion and bump the version on
/// release. Readers snapshot the version, read the protected region, then
/// re-validate: a mismatch means a writer interfered and the whole logical
/// operation must restart with [`Abort`].
///
/// The phantom mode is exclusive like the write mode but does NOT alter the
/// version on release; it is used by maintenance passes that leave the
/// protected content logically untouched, so concurrent optimistic readers
/// are not disturbed.
pub(crate) struct OptimisticLatch<const PAYLOAD_BITS: u32> {
    version: AtomicU64,
}

impl<const PAYLOAD_BITS: u32> OptimisticLatch<PAYLOAD_BITS> {
    const MASK_LATCH: u64 = u64::MAX >> PAYLOAD_BITS;
    const MASK_PAYLOAD: u64 = !Self::MASK_LATCH;
    const MASK_PLOCK: u64 = 1 << (63 - PAYLOAD_BITS);
    const MASK_XLOCK: u64 = Self::MASK_PLOCK >> 1;
    const MASK_VERSION: u64 = Self::MASK_XLOCK - 1;

    pub fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
        }
    }

    fn is_invalid_word(word: u64) -> bool {
        (word & Self::MASK_LATCH) == Self::MASK_LATCH
    }

    /// Snapshots the current version, spinning while a writer holds the latch.
    pub fn read_version(&self) -> Result<u64, Abort> {
        loop {
            let word = self.version.load(Acquire) & Self::MASK_LATCH;

            if Self::is_invalid_word(word) {
                return Err(Abort);
            }

            if (word & Self::MASK_XLOCK) != 0 {
                std::hint::spin_loop();
                continue;
            }

            return Ok(word & Self::MASK_VERSION);
        }
    }

    pub fn is_version(&self, version: u64) -> bool {
        (self.version.load(Acquire) & (Self::MASK_XLOCK | Self::MASK_VERSION)) == version
    }

    /// Fails with [`Abort`] if the version moved past the given snapshot or
    /// the latch was invalidated.
    pub fn validate_version(&self, version: u64) -> Result<(), Abort> {
        if self.is_version(version) {
            Ok(())
        } else {
            Err(Abort)
        }
    }

    pub fn get_payload(&self) -> u64 {
        const { assert!(PAYLOAD_BITS > 0, "no payload stored in the latch") };
        self.version.load(Acquire) >> (64 - PAYLOAD_BITS)
    }

    pub fn set_payload(&self, value: u64) -> Result<(), Abort> {
        loop {
            let cur = self.version.load(Acquire);
            if Self::is_invalid_word(cur) {
                return Err(Abort);
            }

            let new = (cur & Self::MASK_LATCH) | (value << (64 - PAYLOAD_BITS));
            if self
                .version
                .compare_exchange_weak(cur, new, Release, Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Acquires exclusive (writer) access, spinning until the latch is free.
    pub fn lock(&self) -> Result<(), Abort> {
        loop {
            let cur = self.version.load(Acquire);
            if Self::is_invalid_word(cur) {
                return Err(Abort);
            }

            // While held by another thread, speculate on the word it will
            // publish on release: a phantom holder restores the version
            // untouched, a writer bumps it.
            let expected = if (cur & Self::MASK_PLOCK) != 0 {
                cur & (Self::MASK_PAYLOAD | Self::MASK_VERSION)
            } else if (cur & Self::MASK_XLOCK) != 0 {
                ((cur & Self::MASK_VERSION) + 1) | (cur & Self::MASK_PAYLOAD)
            } else {
                cur
            };

            if self
                .version
                .compare_exchange_weak(expected, expected | Self::MASK_XLOCK, Release, Relaxed)
                .is_ok()
            {
                return Ok(());
            }

            std::hint::spin_loop();
        }
    }

    /// Acquires the write lock iff the current version equals `version`.
    pub fn update(&self, version: u64) -> Result<(), Abort> {
        loop {
            let cur = self.version.load(Acquire);
            if (cur & (Self::MASK_XLOCK | Self::MASK_VERSION)) != version {
                return Err(Abort);
            }

            let expected = if (cur & Self::MASK_PLOCK) != 0 {
                cur & (Self::MASK_PAYLOAD | Self::MASK_VERSION)
            } else {
                cur
            };

            if self
                .version
                .compare_exchange_weak(expected, expected | Self::MASK_XLOCK, Release, Relaxed)
                .is_ok()
            {
                return Ok(());
            }

            std::hint::spin_loop();
        }
    }

    /// Releases the write lock, incrementing the version.
    pub fn unlock(&self) {
        let cur = self.version.load(Acquire);
        debug_assert!((cur & Self::MASK_XLOCK) != 0, "latch not held in x-mode");
        debug_assert!((cur & Self::MASK_PLOCK) == 0, "latch held in phantom mode");
        debug_assert!(!Self::is_invalid_word(cur), "latch is invalid");

        self.version.store(
            ((cur & Self::MASK_VERSION) + 1) | (cur & Self::MASK_PAYLOAD),
            Release,
        );
    }

    /// Acquires the latch exclusively without altering the version on release.
    pub fn phantom_lock(&self) -> Result<(), Abort> {
        loop {
            let cur = self.version.load(Acquire);
            if Self::is_invalid_word(cur) {
                return Err(Abort);
            }

            let expected = if (cur & Self::MASK_PLOCK) != 0 {
                cur & (Self::MASK_PAYLOAD | Self::MASK_VERSION)
            } else if (cur & Self::MASK_XLOCK) != 0 {
                ((cur & Self::MASK_VERSION) + 1) | (cur & Self::MASK_PAYLOAD)
            } else {
                cur
            };

            if self
                .version
                .compare_exchange_weak(expected, expected | Self::MASK_PLOCK, Release, Relaxed)
                .is_ok()
            {
                return Ok(());
            }

            std::hint::spin_loop();
        }
    }

    /// Releases the phantom lock, leaving the version untouched.
    pub fn phantom_unlock(&self) -> u64 {
        let cur = self.version.load(Acquire);
        debug_assert!((cur & Self::MASK_PLOCK) != 0, "latch not held in phantom mode");
        debug_assert!((cur & Self::MASK_XLOCK) == 0, "latch held in x-mode");
        debug_assert!(!Self::is_invalid_word(cur), "latch is invalid");

        self.version
            .store(cur & (Self::MASK_VERSION | Self::MASK_PAYLOAD), Release);
        cur & Self::MASK_VERSION
    }

    pub fn is_invalid(&self) -> bool {
        Self::is_invalid_word(self.version.load(Acquire))
    }

    /// Marks the latch as permanently invalid; every subsequent operation
    /// fails with [`Abort`]. Used when the protected segment or node is
    /// being deleted.
    pub fn invalidate(&self) {
        loop {
            let cur = self.version.load(Acquire);
            let new = (cur & Self::MASK_PAYLOAD) | Self::MASK_LATCH;
            if self
                .version
                .compare_exchange_weak(cur, new, Release, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<const PAYLOAD_BITS: u32> Default for OptimisticLatch<PAYLOAD_BITS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn version_bumps_on_unlock() {
        let latch = OptimisticLatch::<1>::new();
        let v0 = latch.read_version().unwrap();

        latch.lock().unwrap();
        latch.unlock();

        let v1 = latch.read_version().unwrap();
        assert_ne!(v0, v1);
        assert!(latch.validate_version(v0).is_err());
        assert!(latch.validate_version(v1).is_ok());
    }

    #[test]
    fn phantom_mode_preserves_version() {
        let latch = OptimisticLatch::<1>::new();
        let v0 = latch.read_version().unwrap();

        latch.phantom_lock().unwrap();
        let released = latch.phantom_unlock();

        assert_eq!(v0, released);
        assert!(latch.validate_version(v0).is_ok());
    }

    #[test]
    fn update_requires_matching_version() {
        let latch = OptimisticLatch::<1>::new();
        let v0 = latch.read_version().unwrap();

        latch.lock().unwrap();
        latch.unlock();

        assert_eq!(Err(Abort), latch.update(v0));

        let v1 = latch.read_version().unwrap();
        latch.update(v1).unwrap();
        latch.unlock();
    }

    #[test]
    fn invalidate_is_permanent() {
        let latch = OptimisticLatch::<1>::new();
        latch.invalidate();

        assert!(latch.is_invalid());
        assert_eq!(Err(Abort), latch.read_version());
        assert_eq!(Err(Abort), latch.lock());
        assert_eq!(Err(Abort), latch.phantom_lock());
    }

    #[test]
    fn payload_survives_locking() {
        let latch = OptimisticLatch::<1>::new();
        assert_eq!(0, latch.get_payload());

        latch.set_payload(1).unwrap();
        assert_eq!(1, latch.get_payload());

        latch.lock().unwrap();
        latch.unlock();
        assert_eq!(1, latch.get_payload());

        latch.invalidate();
        assert_eq!(1, latch.get_payload());
    }
}
