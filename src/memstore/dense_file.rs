// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The dense file: segment storage for workloads a sparse file cannot hold.
//!
//! Installed when a sparse file runs out of space (typically a high-degree
//! vertex). An ART trie maps keys to positions in an append-only item array;
//! removed positions stay allocated as tombstones until the next rebalance
//! rebuilds the segment. A small transaction-locks list mirrors the sparse
//! file's vertex lock flags.

use crate::error::Error;
use crate::key::Key;
use crate::memstore::art::Art;
use crate::memstore::remove_vertex::RemoveVertex;
use crate::memstore::update::Update;
use crate::memstore::WriteError;
use crate::rebalance::scratchpad::{LoadedElement, LoadedVersion, ScratchEntry, ScratchPad};
use crate::time::Timestamp;
use crate::transaction::{TransactionImpl, Undo, Visibility};
use std::sync::Arc;

/// An entry of the item file: the storage image plus its version chain.
struct DataItem {
    /// The stored element; its insert/remove tag is the storage state.
    update: Update,
    version: Option<LoadedVersion>,
}

#[derive(Default)]
pub(crate) struct DenseFile {
    /// key -> position in `items`
    trie: Art<usize>,

    /// Append-only; `None` marks a tombstoned position.
    items: Vec<Option<DataItem>>,

    /// Vertices held by removers, the dense analogue of the lock flag.
    transaction_locks: Vec<u64>,
}

impl DenseFile {
    /// Materialises the content of a sparse file (already streamed into the
    /// scratchpad) into an item file and trie.
    pub fn from_scratchpad(scratchpad: &ScratchPad) -> Self {
        let mut file = Self::default();

        for entry in scratchpad.entries() {
            let key = entry.element.key();
            let is_insert = entry
                .version
                .as_ref()
                .is_none_or(|version| !version.is_remove);

            let update = match &entry.element {
                LoadedElement::Vertex { id, lock } => {
                    if *lock {
                        file.transaction_locks.push(*id);
                    }
                    Update::vertex(is_insert, *id)
                }
                LoadedElement::Edge {
                    source,
                    destination,
                    weight,
                } => Update::edge(is_insert, Key::new(*source, *destination), *weight),
            };

            let position = file.items.len();
            file.items.push(Some(DataItem {
                update,
                version: entry.version.clone(),
            }));
            file.trie.insert(key.encode(), position);
        }

        file
    }

    /// Rough qword footprint, comparable with the sparse file's accounting.
    pub fn used_space(&self) -> u64 {
        self.trie.len() as u64 * 3
    }

    pub fn cardinality(&self) -> u64 {
        self.trie.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    pub fn get_minimum(&self) -> Option<Key> {
        self.trie
            .ceiling(&crate::key::KEY_MIN.encode())
            .map(|(key, _)| Key::decode(key))
    }

    fn item(&self, position: usize) -> Option<&DataItem> {
        self.items.get(position).and_then(Option::as_ref)
    }

    fn item_mut(&mut self, position: usize) -> Option<&mut DataItem> {
        self.items.get_mut(position).and_then(Option::as_mut)
    }

    fn is_locked(&self, vertex_id: u64) -> bool {
        self.transaction_locks.contains(&vertex_id)
    }

    /// The image of an item as seen by the transaction; `None` = invisible.
    fn resolve(&self, tx: &TransactionImpl, item: &DataItem) -> Option<Update> {
        let image = match &item.version {
            None => item.update,
            Some(version) => match &version.undo {
                None => item.update,
                Some(head) => match tx.can_read(head) {
                    Visibility::Storage => item.update,
                    Visibility::Payload(payload) => payload,
                },
            },
        };
        image.is_insert().then_some(image)
    }

    fn check_writable(&self, tx: &TransactionImpl, item: &DataItem, key: Key) -> Result<(), Error> {
        let head = item.version.as_ref().and_then(|v| v.undo.as_ref());
        if let Some(head) = head {
            if !tx.can_write(head) {
                return Err(if key.is_vertex() {
                    Error::VertexLocked(key.source())
                } else {
                    Error::EdgeLocked(key.source(), key.destination())
                });
            }
        }
        Ok(())
    }

    /*************************************************************************
     * update                                                                *
     *************************************************************************/

    /// Applies the update. Unlike the sparse file, the dense file never runs
    /// out of space: the item array grows and the rebalancer splits later.
    pub fn update(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        has_source_vertex: bool,
        source_in_range: bool,
    ) -> Result<(), WriteError> {
        let key = update.key();

        if update.is_vertex() {
            self.update_item(tx, update, *update)
                .map_err(WriteError::User)
        } else {
            if self.is_locked(key.source()) && update.is_insert() {
                return Err(Error::VertexPhantomWrite(key.source()).into());
            }

            if update.is_insert() && !has_source_vertex {
                match self.source_evidence(tx, key.source()) {
                    SourceEvidence::Visible => {}
                    SourceEvidence::Removed => {
                        return Err(Error::VertexDoesNotExist(key.source()).into());
                    }
                    SourceEvidence::Unknown if source_in_range => {
                        // the vertex record would live in this segment
                        return Err(Error::VertexDoesNotExist(key.source()).into());
                    }
                    SourceEvidence::Unknown => {
                        return Err(WriteError::NotSureIfItHasSourceVertex);
                    }
                }
            }

            self.update_item(tx, update, *update)
                .map_err(WriteError::User)
        }
    }

    fn update_item(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        stored: Update,
    ) -> Result<(), Error> {
        let key = update.key();

        match self.trie.get(&key.encode()).copied() {
            Some(position) => {
                #[expect(clippy::expect_used, reason = "the trie only references live items")]
                let item = self.item(position).expect("tombstoned item in the trie");

                self.check_writable(tx, item, key)?;
                if key.is_vertex() && self.is_locked(key.source()) {
                    return Err(Error::VertexLocked(key.source()));
                }

                let currently_present = item.update.is_insert();
                if update.is_insert() && currently_present {
                    return Err(if key.is_vertex() {
                        Error::VertexAlreadyExists(key.source())
                    } else {
                        Error::EdgeAlreadyExists(key.source(), key.destination())
                    });
                }
                if update.is_remove() && !currently_present {
                    return Err(if key.is_vertex() {
                        Error::VertexDoesNotExist(key.source())
                    } else {
                        Error::EdgeDoesNotExist(key.source(), key.destination())
                    });
                }

                // prior image: a re-insertion restores the stored weight
                let prior = if update.is_remove() {
                    item.update
                } else {
                    update.flipped()
                };

                let undo = tx.add_undo(prior);
                let old_version = item.version.as_ref();
                undo.set_next(old_version.and_then(|v| v.undo.clone()));
                let length = old_version.map_or(0, |v| v.length);

                #[expect(clippy::expect_used, reason = "checked right above")]
                let item = self.item_mut(position).expect("tombstoned item in the trie");
                item.version = Some(LoadedVersion {
                    is_remove: update.is_remove(),
                    length: (length + 1).min(crate::memstore::sparse_file::MAX_UNDO_LENGTH),
                    undo: Some(undo),
                });
                item.update = stored;
                Ok(())
            }
            None => {
                if update.is_remove() {
                    return Err(if key.is_vertex() {
                        Error::VertexDoesNotExist(key.source())
                    } else {
                        Error::EdgeDoesNotExist(key.source(), key.destination())
                    });
                }

                let undo = tx.add_undo(update.flipped());
                let position = self.items.len();
                self.items.push(Some(DataItem {
                    update: stored,
                    version: Some(LoadedVersion {
                        is_remove: false,
                        length: 1,
                        undo: Some(undo),
                    }),
                }));
                self.trie.insert(key.encode(), position);
                Ok(())
            }
        }
    }

    /// What the items reveal about the reachability of an edge's source.
    fn source_evidence(&self, tx: &TransactionImpl, source: u64) -> SourceEvidence {
        if let Some(&position) = self.trie.get(&Key::vertex(source).encode()) {
            if let Some(item) = self.item(position) {
                return match self.resolve(tx, item) {
                    Some(_) => SourceEvidence::Visible,
                    None => SourceEvidence::Removed,
                };
            }
        }

        // no vertex record: any visible edge of the source is evidence
        let mut probe = Key::new(source, 1);
        while let Some((key, &position)) = self.trie.ceiling(&probe.encode()) {
            let key = Key::decode(key);
            if key.source() != source {
                break;
            }
            if let Some(item) = self.item(position) {
                if self.resolve(tx, item).is_some() {
                    return SourceEvidence::Visible;
                }
            }
            probe = key.successor();
        }

        SourceEvidence::Unknown
    }

    /*************************************************************************
     * rollback                                                              *
     *************************************************************************/

    pub fn rollback(&mut self, update: &Update, next: Option<Arc<Undo>>) {
        let key = update.key();
        let Some(&position) = self.trie.get(&key.encode()) else {
            debug_assert!(false, "rolling back an element that is not stored");
            return;
        };

        match next {
            Some(next_head) => {
                let Some(item) = self.item_mut(position) else {
                    debug_assert!(false, "tombstoned item in the trie");
                    return;
                };
                let length = item.version.as_ref().map_or(1, |v| v.length);
                item.version = Some(LoadedVersion {
                    is_remove: update.is_remove(),
                    length: if length < crate::memstore::sparse_file::MAX_UNDO_LENGTH {
                        length.saturating_sub(1).max(1)
                    } else {
                        length
                    },
                    undo: Some(next_head),
                });
                item.update = *update;
            }
            None => {
                if update.is_remove() {
                    // rolling back the insertion: the item disappears
                    self.items[position] = None;
                    self.trie.remove(&key.encode());
                } else {
                    let Some(item) = self.item_mut(position) else {
                        debug_assert!(false, "tombstoned item in the trie");
                        return;
                    };
                    item.version = None;
                    item.update = *update;
                }
            }
        }
    }

    /*************************************************************************
     * point lookups                                                         *
     *************************************************************************/

    pub fn has_item(&self, tx: &TransactionImpl, key: Key, is_unlocked: bool) -> Result<bool, Error> {
        if key.is_vertex() && is_unlocked && self.is_locked(key.source()) {
            return Err(Error::VertexPhantomWrite(key.source()));
        }

        let Some(&position) = self.trie.get(&key.encode()) else {
            return Ok(false);
        };
        let Some(item) = self.item(position) else {
            return Ok(false);
        };
        Ok(self.resolve(tx, item).is_some())
    }

    pub fn get_weight(&self, tx: &TransactionImpl, key: Key) -> Result<f64, Error> {
        let missing = || Error::EdgeDoesNotExist(key.source(), key.destination());
        let &position = self.trie.get(&key.encode()).ok_or_else(missing)?;
        let item = self.item(position).ok_or_else(missing)?;
        self.resolve(tx, item)
            .map(|image| image.weight())
            .ok_or_else(missing)
    }

    pub fn get_degree(&self, tx: &TransactionImpl, vertex_id: u64) -> u64 {
        let mut degree = 0;
        let mut probe = Key::new(vertex_id, 1);

        while let Some((key, &position)) = self.trie.ceiling(&probe.encode()) {
            let key = Key::decode(key);
            if key.source() != vertex_id {
                break;
            }
            if let Some(item) = self.item(position) {
                if self.resolve(tx, item).is_some() {
                    degree += 1;
                }
            }
            probe = key.successor();
        }

        degree
    }

    /*************************************************************************
     * scan                                                                  *
     *************************************************************************/

    pub fn scan(
        &self,
        tx: &TransactionImpl,
        from: Key,
        callback: &mut dyn FnMut(u64, u64, f64) -> bool,
    ) -> bool {
        let mut probe = from;

        while let Some((key, &position)) = self.trie.ceiling(&probe.encode()) {
            let key = Key::decode(key);
            if let Some(item) = self.item(position) {
                if let Some(image) = self.resolve(tx, item) {
                    let proceed = if key.is_vertex() {
                        callback(key.source(), 0, 0.0)
                    } else {
                        callback(key.source(), key.destination(), image.weight())
                    };
                    if !proceed {
                        return false;
                    }
                }
            }
            probe = key.successor();
        }

        true
    }

    /*************************************************************************
     * remove vertex                                                         *
     *************************************************************************/

    pub fn remove_vertex(
        &mut self,
        tx: &Arc<TransactionImpl>,
        instance: &mut RemoveVertex,
    ) -> Result<bool, Error> {
        let vertex_id = instance.vertex_id();
        let vertex_key = Key::vertex(vertex_id);

        // the authoritative record, when this segment owns it
        if let Some(&position) = self.trie.get(&vertex_key.encode()) {
            if self.is_locked(vertex_id) {
                return Err(Error::VertexLocked(vertex_id));
            }
            #[expect(clippy::expect_used, reason = "the trie only references live items")]
            let item = self.item(position).expect("tombstoned item in the trie");
            self.check_writable(tx, item, vertex_key)?;
            if self.resolve(tx, item).is_none() {
                return Err(Error::VertexDoesNotExist(vertex_id));
            }
        }

        // collect the removals first: conflicts must surface before any
        // mutation
        let mut removals = Vec::new();
        let mut probe = Key::new(vertex_id, 1);
        while let Some((key, &position)) = self.trie.ceiling(&probe.encode()) {
            let key = Key::decode(key);
            if key.source() != vertex_id {
                break;
            }
            if let Some(item) = self.item(position) {
                self.check_writable(tx, item, key)?;
                if let Some(image) = self.resolve(tx, item) {
                    removals.push((key, image.weight()));
                }
            }
            probe = key.successor();
        }

        if self.trie.get(&vertex_key.encode()).is_some() {
            let remove = Update::vertex(false, vertex_id);
            self.update_item(tx, &remove, remove)?;
            instance.record_found();
        }

        for (key, weight) in removals {
            let remove = Update::edge(false, key, weight);
            self.update_item(tx, &remove, remove)?;
            instance.record_outgoing(key.destination());
        }

        self.transaction_locks.push(vertex_id);
        instance.record_locked();

        Ok(true)
    }

    pub fn unlock_vertex(&mut self, vertex_id: u64) {
        self.transaction_locks.retain(|&id| id != vertex_id);
    }

    /*************************************************************************
     * load / prune                                                          *
     *************************************************************************/

    pub fn load(&self, scratchpad: &mut ScratchPad) {
        self.trie.for_each(&mut |key, &position| {
            let Some(item) = self.item(position) else {
                return;
            };
            let key = Key::decode(key);

            let element = if key.is_vertex() {
                LoadedElement::Vertex {
                    id: key.source(),
                    lock: self.is_locked(key.source()),
                }
            } else {
                LoadedElement::Edge {
                    source: key.source(),
                    destination: key.destination(),
                    weight: if item.update.is_edge() {
                        item.update.weight()
                    } else {
                        0.0
                    },
                }
            };

            scratchpad.push(ScratchEntry {
                element,
                version: item.version.clone(),
            });
        });
    }

    pub fn prune(&mut self, high_water_mark: Timestamp) {
        enum Action {
            Keep,
            DropVersion,
            DropItem,
        }

        let mut positions = Vec::new();
        self.trie.for_each(&mut |key, &position| {
            positions.push((Key::decode(key), position));
        });

        for (key, position) in positions {
            let action = {
                let Some(item) = self.item_mut(position) else {
                    continue;
                };
                let Some(version) = item.version.as_mut() else {
                    continue;
                };

                if let Some(head) = version.undo.clone() {
                    match Undo::prune(&head, high_water_mark) {
                        Some((head, length)) => {
                            version.undo = Some(head);
                            version.length = length;
                            Action::Keep
                        }
                        None => {
                            version.undo = None;
                            version.length = 0;
                            if version.is_remove {
                                Action::DropItem
                            } else {
                                Action::DropVersion
                            }
                        }
                    }
                } else if version.is_remove {
                    Action::DropItem
                } else {
                    Action::DropVersion
                }
            };

            match action {
                Action::Keep => {}
                Action::DropVersion => {
                    if let Some(item) = self.item_mut(position) {
                        item.version = None;
                    }
                }
                Action::DropItem => {
                    self.items[position] = None;
                    self.trie.remove(&key.encode());
                }
            }
        }
    }

    pub fn clear_versions(&mut self) {
        for item in self.items.iter_mut().flatten() {
            item.version = None;
        }
    }
}

enum SourceEvidence {
    Visible,
    Removed,
    Unknown,
}

impl std::fmt::Debug for DenseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DenseFile {{ items: {}, live: {}, locks: {} }}",
            self.items.len(),
            self.trie.len(),
            self.transaction_locks.len()
        )
    }
}
