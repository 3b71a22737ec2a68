// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::Key;
use crate::memstore::art::Art;
use crate::memstore::leaf::Leaf;
use std::sync::{Arc, RwLock};

/// A published segment: the leaf that owns it and its position inside.
#[derive(Clone)]
pub(crate) struct IndexEntry {
    pub leaf: Arc<Leaf>,
    pub segment_id: usize,
}

/// The global trie mapping keys to `(leaf, segment)` entries.
///
/// An entry is published under the segment's low fence key; a lookup takes
/// the entry with the greatest key not past the search key, then refines
/// through the leaf-local fence lookup. Rebalances update the trie at commit
/// time; readers re-validate through the segment latches, so a stale hit
/// only costs a retry.
pub(crate) struct Index {
    trie: RwLock<Art<IndexEntry>>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(Art::new()),
        }
    }

    /// The entry responsible for the given key.
    pub fn find(&self, key: Key) -> IndexEntry {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let trie = self.trie.read().expect("lock is poisoned");

        #[expect(clippy::expect_used, reason = "KEY_MIN is always published")]
        let (_, entry) = trie.floor(&key.encode()).expect("the index is empty");
        entry.clone()
    }

    pub fn insert(&self, key: Key, entry: IndexEntry) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut trie = self.trie.write().expect("lock is poisoned");
        trie.insert(key.encode(), entry);
    }

    pub fn remove(&self, key: Key) -> bool {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut trie = self.trie.write().expect("lock is poisoned");
        trie.remove(&key.encode()).is_some()
    }

    pub fn len(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let trie = self.trie.read().expect("lock is poisoned");
        trie.len()
    }
}
