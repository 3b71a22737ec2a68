// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::TransactionImpl;
use crate::memstore::update::Update;
use crate::time::Timestamp;
use std::sync::{Arc, Mutex};

/// An entry in a per-item version chain.
///
/// The chain head hangs off a storage version record; every entry carries the
/// prior image of the change its transaction performed, and a pointer to the
/// next-older entry. Entries are owned by the referencing storage cells and
/// by younger chain entries; the transaction's undo buffer holds an
/// additional reference until commit or rollback.
pub(crate) struct Undo {
    transaction: Arc<TransactionImpl>,
    payload: Update,
    next: Mutex<Option<Arc<Undo>>>,
}

impl Undo {
    pub fn new(transaction: Arc<TransactionImpl>, payload: Update) -> Self {
        Self {
            transaction,
            payload,
            next: Mutex::new(None),
        }
    }

    pub fn transaction(&self) -> &Arc<TransactionImpl> {
        &self.transaction
    }

    /// The prior image restored when this record is rolled back.
    pub fn payload(&self) -> Update {
        self.payload
    }

    pub fn next(&self) -> Option<Arc<Undo>> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.next.lock().expect("lock is poisoned").clone()
    }

    pub fn set_next(&self, next: Option<Arc<Undo>>) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.next.lock().expect("lock is poisoned");
        *guard = next;
    }

    /// Prunes the chain hanging off `head` against the given high water mark
    /// (the minimum start time among active transactions).
    ///
    /// Returns `None` when the whole chain is obsolete (every active and
    /// future transaction reads the storage image), otherwise the retained
    /// head and the length of the retained chain.
    pub fn prune(head: &Arc<Undo>, high_water_mark: Timestamp) -> Option<(Arc<Undo>, u8)> {
        let tx = head.transaction();
        if tx.is_terminated() && tx.write_id() <= high_water_mark {
            return None;
        }

        let mut length: u8 = 1;
        let mut current = head.clone();
        loop {
            let Some(next) = current.next() else {
                return Some((head.clone(), length));
            };

            let tx = next.transaction();
            if tx.is_terminated() && tx.write_id() <= high_water_mark {
                // `next` is visible to every live snapshot; its prior image
                // and everything older can never be read again.
                next.set_next(None);
                return Some((head.clone(), length + 1));
            }

            length = length.saturating_add(1);
            current = next;
        }
    }
}

impl std::fmt::Debug for Undo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Undo {{ tx: {}, payload: {} }}",
            self.transaction.start_time(),
            self.payload
        )
    }
}
