// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The memstore: a two-level ordered container for the whole graph.
//!
//! An ART index maps keys to leaves; each leaf holds a fixed number of
//! segments; each segment stores a sparse file or, on overflow, a dense
//! file. This module owns the entry loops: writers take a segment
//! exclusively through its state machine, readers go through the optimistic
//! path and retry on [`Abort`].

pub(crate) mod art;
pub(crate) mod dense_file;
pub(crate) mod index;
pub(crate) mod leaf;
pub(crate) mod remove_vertex;
pub(crate) mod segment;
pub(crate) mod sparse_file;
pub(crate) mod update;

use crate::bp::BufferPool;
use crate::error::{Abort, Error};
use crate::gc::{GarbageCollector, ScopedEpoch};
use crate::key::{Key, VertexId, KEY_MAX, KEY_MIN};
use crate::memstore::dense_file::DenseFile;
use crate::memstore::index::{Index, IndexEntry};
use crate::memstore::leaf::Leaf;
use crate::memstore::remove_vertex::RemoveVertex;
use crate::memstore::segment::{File, Segment, SegmentFile};
use crate::memstore::update::Update;
use crate::rebalance::scratchpad::ScratchPad;
use crate::transaction::{TransactionImpl, TransactionManager, Undo};
use crate::Result;
use std::sync::{Arc, Mutex};

/// Outcome of a storage write: either a user-visible error, or the internal
/// signal that the file could not prove the source vertex reachable and the
/// caller must check explicitly before retrying.
pub(crate) enum WriteError {
    User(Error),
    NotSureIfItHasSourceVertex,
}

impl From<Error> for WriteError {
    fn from(error: Error) -> Self {
        Self::User(error)
    }
}

pub(crate) struct Memstore {
    pub(crate) index: Index,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) gc: Arc<GarbageCollector>,
    pub(crate) txm: Arc<TransactionManager>,
    pub(crate) directed: bool,
    pub(crate) num_segments_per_leaf: usize,
    pub(crate) max_num_segments_per_leaf: usize,

    /// Segment file capacity, in qwords.
    pub(crate) segment_qwords: u64,

    /// Height of the calibrator tree; 0 derives it from the leaf size.
    pub(crate) calibrator_tree_height: usize,

    /// Hook into the asynchronous rebalancer, set once the service starts.
    rebalance_queue: Mutex<Option<crossbeam_channel::Sender<Key>>>,
}

impl Memstore {
    pub fn new(
        pool: Arc<BufferPool>,
        gc: Arc<GarbageCollector>,
        txm: Arc<TransactionManager>,
        directed: bool,
        num_segments_per_leaf: usize,
        max_num_segments_per_leaf: usize,
        calibrator_tree_height: usize,
    ) -> Result<Self> {
        let segment_qwords = (pool.page_size() / 8) as u64;
        let memstore = Self {
            index: Index::new(),
            pool,
            gc,
            txm,
            directed,
            num_segments_per_leaf,
            max_num_segments_per_leaf: max_num_segments_per_leaf
                .clamp(num_segments_per_leaf, num_segments_per_leaf * 2),
            segment_qwords,
            calibrator_tree_height,
            rebalance_queue: Mutex::new(None),
        };

        // the initial empty leaf covers the whole key space
        let leaf = Leaf::create(&memstore.pool, num_segments_per_leaf)?;
        leaf.set_lfkey(KEY_MIN);
        leaf.set_hfkey(KEY_MAX);
        leaf.segment(0).set_fence_key(KEY_MIN);
        memstore.index.insert(
            KEY_MIN,
            IndexEntry {
                leaf,
                segment_id: 0,
            },
        );

        Ok(memstore)
    }

    pub fn attach_rebalancer(&self, queue: crossbeam_channel::Sender<Key>) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.rebalance_queue.lock().expect("lock is poisoned");
        *guard = Some(queue);
    }

    pub fn detach_rebalancer(&self) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.rebalance_queue.lock().expect("lock is poisoned");
        *guard = None;
    }

    fn request_rebalance(&self, key: Key) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let guard = self.rebalance_queue.lock().expect("lock is poisoned");
        if let Some(queue) = guard.as_ref() {
            let _ = queue.send(key);
        }
    }

    /*************************************************************************
     * segment access                                                        *
     *************************************************************************/

    /// Locates and acquires, in write mode, the segment owning `key`.
    /// Re-routes whenever the fence keys moved underneath.
    fn writer_enter(&self, key: Key) -> (Arc<Leaf>, usize) {
        loop {
            let entry = self.index.find(key);
            let leaf = entry.leaf;
            let segment_id = leaf.locate_segment(key);
            let segment = leaf.segment(segment_id);

            match segment.enter_write() {
                Ok(()) => {
                    if segment.latch().is_invalid() {
                        // the leaf was deleted by a merge
                        segment.exit();
                        continue;
                    }

                    let low = segment.fence_key();
                    let high = leaf.segment_high_fence(segment_id);
                    if key < low || key >= high {
                        segment.exit();
                        continue;
                    }

                    if segment.latch().lock().is_err() {
                        segment.exit();
                        continue;
                    }

                    return (leaf, segment_id);
                }
                Err(waiter) => {
                    let _ = waiter.recv();
                }
            }
        }
    }

    fn writer_exit(&self, leaf: &Leaf, segment_id: usize) {
        let segment = leaf.segment(segment_id);
        segment.latch().unlock();
        segment.exit();
    }

    /// Locates and acquires, in (locked) read mode, the segment owning `key`.
    fn reader_enter(&self, key: Key) -> (Arc<Leaf>, usize) {
        loop {
            let entry = self.index.find(key);
            let leaf = entry.leaf;
            let segment_id = leaf.locate_segment(key);
            let segment = leaf.segment(segment_id);

            match segment.enter_read() {
                Ok(()) => {
                    if segment.latch().is_invalid() {
                        segment.exit();
                        continue;
                    }

                    let low = segment.fence_key();
                    let high = leaf.segment_high_fence(segment_id);
                    if key < low || key >= high {
                        segment.exit();
                        continue;
                    }

                    return (leaf, segment_id);
                }
                Err(waiter) => {
                    let _ = waiter.recv();
                }
            }
        }
    }

    fn reader_exit(&self, leaf: &Leaf, segment_id: usize) {
        leaf.segment(segment_id).exit();
    }

    /// One attempt of the optimistic read protocol: snapshot the latch
    /// version, read, re-validate.
    fn try_optimistic<T>(
        &self,
        key: Key,
        op: &impl Fn(&File) -> Result<T>,
    ) -> std::result::Result<Result<T>, Abort> {
        let entry = self.index.find(key);
        let leaf = entry.leaf;
        let segment_id = leaf.locate_segment(key);
        let segment = leaf.segment(segment_id);

        if let Err(waiter) = segment.enter_optimistic() {
            // a crawler owns the segment; park until it releases
            let _ = waiter.recv();
            return Err(Abort);
        }

        let version = segment.latch().read_version()?;

        let low = segment.fence_key();
        let high = leaf.segment_high_fence(segment_id);
        if key < low || key >= high {
            return Err(Abort);
        }

        let result = {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let file = segment.file().read().expect("lock is poisoned");
            op(&file)
        };

        segment.latch().validate_version(version)?;
        Ok(result)
    }

    fn optimistic_read<T>(&self, key: Key, op: impl Fn(&File) -> Result<T>) -> Result<T> {
        loop {
            let _epoch = ScopedEpoch::new(&self.gc);
            match self.try_optimistic(key, &op) {
                Ok(result) => return result,
                Err(Abort) => { /* retry */ }
            }
        }
    }

    /*************************************************************************
     * writes                                                                *
     *************************************************************************/

    /// Applies a single update, taking the owning segment in write mode.
    pub fn write(
        &self,
        tx: &Arc<TransactionImpl>,
        update: Update,
        has_source_vertex: bool,
    ) -> std::result::Result<(), WriteError> {
        debug_assert!(!tx.is_terminated(), "the transaction is already terminated");

        let _epoch = ScopedEpoch::new(&self.gc);
        let (leaf, segment_id) = self.writer_enter(update.key());
        let segment = leaf.segment(segment_id);

        let result = self.apply_update(segment, tx, &update, has_source_vertex);
        let rebalance = result.is_ok() && self.needs_rebalance(segment);

        self.writer_exit(&leaf, segment_id);

        if rebalance {
            self.request_rebalance(segment.fence_key());
        }
        result
    }

    fn apply_update(
        &self,
        segment: &Segment,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        has_source_vertex: bool,
    ) -> std::result::Result<(), WriteError> {
        let source_in_range = segment.fence_key() <= Key::vertex(update.source());

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut file = segment.file().write().expect("lock is poisoned");

        if file.update(tx, update, has_source_vertex, source_in_range)? {
            return Ok(());
        }

        // the sparse file is full: upgrade to a dense file and retry
        log::debug!(
            "segment overflow on {:?}, upgrading to a dense file",
            update.key()
        );
        Self::to_dense_file(segment, &mut file);

        let done = file.update(tx, update, has_source_vertex, source_in_range)?;
        debug_assert!(done, "dense files do not run out of space");
        Ok(())
    }

    fn to_dense_file(segment: &Segment, file: &mut File) {
        let dense = {
            let File::Sparse(sparse) = &*file else {
                unreachable!("only sparse files overflow");
            };
            let mut scratchpad = ScratchPad::new();
            sparse.load(&mut scratchpad);
            DenseFile::from_scratchpad(&scratchpad)
        };

        // replacing the variant releases the sparse file's page to the pool
        *file = File::Dense(dense);
        let _ = segment.latch().set_payload(1);
    }

    /// Whether the segment should be handed to the asynchronous rebalancer.
    pub(crate) fn needs_rebalance(&self, segment: &Segment) -> bool {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let file = segment.file().read().expect("lock is poisoned");
        file.is_dense() || file.used_space() * 10 >= self.segment_qwords * 9
    }

    /// Reverts a single undo record against the storage.
    pub fn rollback_record(&self, record: &Arc<Undo>) {
        let update = record.payload();
        let next = record.next();

        let _epoch = ScopedEpoch::new(&self.gc);
        let (leaf, segment_id) = self.writer_enter(update.key());
        {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut file = leaf.segment(segment_id).file().write().expect("lock is poisoned");
            file.rollback(&update, next);
        }
        self.writer_exit(&leaf, segment_id);
    }

    fn write_user(&self, tx: &Arc<TransactionImpl>, update: Update) -> Result<()> {
        match self.write(tx, update, true) {
            Ok(()) => Ok(()),
            Err(WriteError::User(error)) => Err(error),
            Err(WriteError::NotSureIfItHasSourceVertex) => {
                unreachable!("the source check was disabled")
            }
        }
    }

    /*************************************************************************
     * graph operations                                                      *
     *************************************************************************/

    pub fn insert_vertex(&self, tx: &Arc<TransactionImpl>, vertex_id: VertexId) -> Result<()> {
        self.write_user(tx, Update::vertex(true, vertex_id))?;
        tx.record_vertex_delta(1);
        Ok(())
    }

    pub fn insert_edge(
        &self,
        tx: &Arc<TransactionImpl>,
        source: VertexId,
        destination: VertexId,
        weight: f64,
    ) -> Result<()> {
        if source == destination {
            return Err(Error::EdgeSelf(source));
        }

        let update = Update::edge(true, Key::new(source, destination), weight);

        if self.directed {
            // the source is validated by the write itself; the destination
            // needs an explicit, phantom-safe check
            if !self.has_item(tx, Key::vertex(destination), true)? {
                return Err(Error::VertexDoesNotExist(destination));
            }
            self.do_insert_edge(tx, update)?;
        } else {
            // undirected graphs store both directions
            self.do_insert_edge(tx, update)?;

            let mut mirror = update;
            mirror.swap();
            if let Err(error) = self.do_insert_edge(tx, mirror) {
                // revert the first leg
                tx.rollback_last(self, 1);
                return Err(error);
            }
        }

        tx.record_edge_delta(1);
        Ok(())
    }

    fn do_insert_edge(&self, tx: &Arc<TransactionImpl>, update: Update) -> Result<()> {
        match self.write(tx, update, false) {
            Ok(()) => Ok(()),
            Err(WriteError::User(error)) => Err(error),
            Err(WriteError::NotSureIfItHasSourceVertex) => {
                // the file could not prove the source vertex reachable;
                // check explicitly, then retry trusting the outcome
                if !self.has_item(tx, Key::vertex(update.source()), true)? {
                    return Err(Error::VertexDoesNotExist(update.source()));
                }
                match self.write(tx, update, true) {
                    Ok(()) => Ok(()),
                    Err(WriteError::User(error)) => Err(error),
                    Err(WriteError::NotSureIfItHasSourceVertex) => {
                        unreachable!("the source check was disabled")
                    }
                }
            }
        }
    }

    pub fn remove_edge(
        &self,
        tx: &Arc<TransactionImpl>,
        source: VertexId,
        destination: VertexId,
    ) -> Result<()> {
        let update = Update::edge(false, Key::new(source, destination), 0.0);
        self.write_user(tx, update)?;

        if !self.directed {
            let mut mirror = update;
            mirror.swap();
            if let Err(error) = self.write_user(tx, mirror) {
                tx.rollback_last(self, 1);
                return Err(error);
            }
        }

        tx.record_edge_delta(-1);
        Ok(())
    }

    /// Removes a vertex and all of its attached edges. Returns the number
    /// of outgoing edges removed.
    pub fn remove_vertex(&self, tx: &Arc<TransactionImpl>, vertex_id: VertexId) -> Result<u64> {
        let mut instance = RemoveVertex::new(vertex_id);
        let undo_mark = tx.num_undo_records();

        let result = self.remove_vertex_pass(tx, &mut instance).and_then(|()| {
            if !self.directed {
                // fix-up: remove the reverse edges
                let outgoing = instance.outgoing().to_vec();
                for destination in outgoing {
                    self.write_user(
                        tx,
                        Update::edge(false, Key::new(destination, vertex_id), 0.0),
                    )?;
                }
            }
            Ok(())
        });

        // the unlock pass runs regardless of the outcome
        if instance.needs_unlock() {
            self.unlock_vertex_pass(vertex_id);
        }

        match result {
            Ok(()) => {
                let num_edges = instance.outgoing().len() as u64;
                tx.record_vertex_delta(-1);
                tx.record_edge_delta(-(num_edges as i64));
                Ok(num_edges)
            }
            Err(error) => {
                // revert the partial effect
                let applied = tx.num_undo_records() - undo_mark;
                tx.rollback_last(self, applied);
                Err(error)
            }
        }
    }

    fn remove_vertex_pass(
        &self,
        tx: &Arc<TransactionImpl>,
        instance: &mut RemoveVertex,
    ) -> Result<()> {
        let vertex_id = instance.vertex_id();
        let mut next = Key::vertex(vertex_id);
        let group_end = Key::new(vertex_id, u64::MAX);

        loop {
            let _epoch = ScopedEpoch::new(&self.gc);
            let (leaf, segment_id) = self.writer_enter(next);
            let segment = leaf.segment(segment_id);
            let high = leaf.segment_high_fence(segment_id);

            let result = {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut file = segment.file().write().expect("lock is poisoned");
                match file.remove_vertex(tx, instance) {
                    Ok(false) => {
                        // out of space: the removal versions need a dense file
                        Self::to_dense_file(segment, &mut file);
                        file.remove_vertex(tx, instance).map(|done| {
                            debug_assert!(done);
                        })
                    }
                    other => other.map(|_| ()),
                }
            };

            self.writer_exit(&leaf, segment_id);
            result?;

            if high > group_end || high == KEY_MAX {
                break;
            }
            next = high;
        }

        if !instance.found() {
            return Err(Error::VertexDoesNotExist(vertex_id));
        }
        Ok(())
    }

    fn unlock_vertex_pass(&self, vertex_id: VertexId) {
        let mut next = Key::vertex(vertex_id);
        let group_end = Key::new(vertex_id, u64::MAX);

        loop {
            let _epoch = ScopedEpoch::new(&self.gc);
            let (leaf, segment_id) = self.writer_enter(next);
            let high = leaf.segment_high_fence(segment_id);
            {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut file = leaf.segment(segment_id).file().write().expect("lock is poisoned");
                file.unlock_vertex(vertex_id);
            }
            self.writer_exit(&leaf, segment_id);

            if high > group_end || high == KEY_MAX {
                break;
            }
            next = high;
        }
    }

    /*************************************************************************
     * reads                                                                 *
     *************************************************************************/

    /// Whether the given key exists and is visible to the transaction. With
    /// `is_unlocked`, the key must be a vertex not held by a remover.
    pub fn has_item(&self, tx: &TransactionImpl, key: Key, is_unlocked: bool) -> Result<bool> {
        self.optimistic_read(key, |file| file.has_item(tx, key, is_unlocked))
    }

    pub fn get_weight(&self, tx: &TransactionImpl, source: VertexId, destination: VertexId) -> Result<f64> {
        let key = Key::new(source, destination);
        self.optimistic_read(key, |file| file.get_weight(tx, key))
    }

    /// The number of visible outgoing edges of the vertex, accumulated
    /// across the segments spanning its key range.
    pub fn get_degree(&self, tx: &TransactionImpl, vertex_id: VertexId) -> Result<u64> {
        if !self.has_item(tx, Key::vertex(vertex_id), false)? {
            return Err(Error::VertexDoesNotExist(vertex_id));
        }

        let mut degree = 0;
        let mut next = Key::vertex(vertex_id);
        let group_end = Key::new(vertex_id, u64::MAX);

        loop {
            let _epoch = ScopedEpoch::new(&self.gc);
            let (leaf, segment_id) = self.reader_enter(next);
            let high = leaf.segment_high_fence(segment_id);
            {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let file = leaf.segment(segment_id).file().read().expect("lock is poisoned");
                degree += file.get_degree(tx, vertex_id);
            }
            self.reader_exit(&leaf, segment_id);

            if high > group_end || high == KEY_MAX {
                break;
            }
            next = high;
        }

        Ok(degree)
    }

    /// Scans all visible elements with key >= `from` in key order, segment
    /// by segment, until the callback requests a stop.
    pub fn scan(
        &self,
        tx: &TransactionImpl,
        from: Key,
        callback: &mut dyn FnMut(u64, u64, f64) -> bool,
    ) {
        let mut next = from;

        loop {
            let _epoch = ScopedEpoch::new(&self.gc);
            let (leaf, segment_id) = self.reader_enter(next);
            let high = leaf.segment_high_fence(segment_id);
            let proceed = {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let file = leaf.segment(segment_id).file().read().expect("lock is poisoned");
                file.scan(tx, next, callback)
            };
            self.reader_exit(&leaf, segment_id);

            if !proceed || high == KEY_MAX {
                return;
            }
            next = high;
        }
    }

    /*************************************************************************
     * shutdown                                                              *
     *************************************************************************/

    /// Detaches every pending version and schedules the leaves for
    /// reclamation. Invoked at engine shutdown, after the background
    /// services stopped.
    pub fn clear(&self) {
        log::debug!("clearing the memstore");
        let _epoch = ScopedEpoch::new(&self.gc);
        let mut key = KEY_MIN;

        loop {
            let entry = self.index.find(key);
            let leaf = entry.leaf;

            for segment_id in 0..leaf.num_segments() {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut file = leaf.segment(segment_id).file().write().expect("lock is poisoned");
                file.clear_versions();
            }

            let next = leaf.hfkey();
            self.gc.mark(Box::new(move || drop(leaf)));

            if next == KEY_MAX {
                break;
            }
            key = next;
        }
    }
}
