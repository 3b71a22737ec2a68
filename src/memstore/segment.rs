// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A segment: the unit of latching inside a leaf.
//!
//! Access is arbitrated by a FREE/READ/WRITE/REBAL state machine with a
//! purpose-tagged wait queue, plus an optimistic latch whose version lets
//! lock-free readers detect that a writer or a rebalance interfered. The
//! latch payload bit records which file kind currently backs the segment.

use crate::error::Error;
use crate::key::{Key, KEY_MAX};
use crate::latch::OptimisticLatch;
use crate::memstore::dense_file::DenseFile;
use crate::memstore::remove_vertex::RemoveVertex;
use crate::memstore::sparse_file::SparseFile;
use crate::memstore::update::Update;
use crate::memstore::WriteError;
use crate::rebalance::scratchpad::ScratchPad;
use crate::time::Timestamp;
use crate::transaction::{TransactionImpl, Undo};
use crossbeam_channel::{Receiver, Sender};
use enum_dispatch::enum_dispatch;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

/// Operations shared by the two file kinds backing a segment.
#[enum_dispatch]
pub(crate) trait SegmentFile {
    fn used_space(&self) -> u64;
    fn cardinality(&self) -> u64;
    fn is_empty(&self) -> bool;
    fn get_minimum(&self) -> Option<Key>;

    fn update(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        has_source_vertex: bool,
        source_in_range: bool,
    ) -> Result<bool, WriteError>;

    fn rollback(&mut self, update: &Update, next: Option<Arc<Undo>>);

    fn has_item(&self, tx: &TransactionImpl, key: Key, is_unlocked: bool) -> Result<bool, Error>;
    fn get_weight(&self, tx: &TransactionImpl, key: Key) -> Result<f64, Error>;
    fn get_degree(&self, tx: &TransactionImpl, vertex_id: u64) -> u64;
    fn scan(
        &self,
        tx: &TransactionImpl,
        from: Key,
        callback: &mut dyn FnMut(u64, u64, f64) -> bool,
    ) -> bool;

    fn remove_vertex(
        &mut self,
        tx: &Arc<TransactionImpl>,
        instance: &mut RemoveVertex,
    ) -> Result<bool, Error>;
    fn unlock_vertex(&mut self, vertex_id: u64);

    fn load(&self, scratchpad: &mut ScratchPad);
    fn prune(&mut self, high_water_mark: Timestamp);
    fn clear_versions(&mut self);
}

impl SegmentFile for SparseFile {
    fn used_space(&self) -> u64 {
        SparseFile::used_space(self)
    }

    fn cardinality(&self) -> u64 {
        SparseFile::cardinality(self)
    }

    fn is_empty(&self) -> bool {
        SparseFile::is_empty(self)
    }

    fn get_minimum(&self) -> Option<Key> {
        SparseFile::get_minimum(self)
    }

    fn update(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        has_source_vertex: bool,
        _source_in_range: bool,
    ) -> Result<bool, WriteError> {
        SparseFile::update(self, tx, update, has_source_vertex)
    }

    fn rollback(&mut self, update: &Update, next: Option<Arc<Undo>>) {
        SparseFile::rollback(self, update, next);
    }

    fn has_item(&self, tx: &TransactionImpl, key: Key, is_unlocked: bool) -> Result<bool, Error> {
        SparseFile::has_item(self, tx, key, is_unlocked)
    }

    fn get_weight(&self, tx: &TransactionImpl, key: Key) -> Result<f64, Error> {
        SparseFile::get_weight(self, tx, key)
    }

    fn get_degree(&self, tx: &TransactionImpl, vertex_id: u64) -> u64 {
        SparseFile::get_degree(self, tx, vertex_id)
    }

    fn scan(
        &self,
        tx: &TransactionImpl,
        from: Key,
        callback: &mut dyn FnMut(u64, u64, f64) -> bool,
    ) -> bool {
        SparseFile::scan(self, tx, from, callback)
    }

    fn remove_vertex(
        &mut self,
        tx: &Arc<TransactionImpl>,
        instance: &mut RemoveVertex,
    ) -> Result<bool, Error> {
        SparseFile::remove_vertex(self, tx, instance)
    }

    fn unlock_vertex(&mut self, vertex_id: u64) {
        SparseFile::unlock_vertex(self, vertex_id);
    }

    fn load(&self, scratchpad: &mut ScratchPad) {
        SparseFile::load(self, scratchpad);
    }

    fn prune(&mut self, high_water_mark: Timestamp) {
        SparseFile::prune(self, high_water_mark);
    }

    fn clear_versions(&mut self) {
        SparseFile::clear_versions(self);
    }
}

impl SegmentFile for DenseFile {
    fn used_space(&self) -> u64 {
        DenseFile::used_space(self)
    }

    fn cardinality(&self) -> u64 {
        DenseFile::cardinality(self)
    }

    fn is_empty(&self) -> bool {
        DenseFile::is_empty(self)
    }

    fn get_minimum(&self) -> Option<Key> {
        DenseFile::get_minimum(self)
    }

    fn update(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        has_source_vertex: bool,
        source_in_range: bool,
    ) -> Result<bool, WriteError> {
        DenseFile::update(self, tx, update, has_source_vertex, source_in_range).map(|()| true)
    }

    fn rollback(&mut self, update: &Update, next: Option<Arc<Undo>>) {
        DenseFile::rollback(self, update, next);
    }

    fn has_item(&self, tx: &TransactionImpl, key: Key, is_unlocked: bool) -> Result<bool, Error> {
        DenseFile::has_item(self, tx, key, is_unlocked)
    }

    fn get_weight(&self, tx: &TransactionImpl, key: Key) -> Result<f64, Error> {
        DenseFile::get_weight(self, tx, key)
    }

    fn get_degree(&self, tx: &TransactionImpl, vertex_id: u64) -> u64 {
        DenseFile::get_degree(self, tx, vertex_id)
    }

    fn scan(
        &self,
        tx: &TransactionImpl,
        from: Key,
        callback: &mut dyn FnMut(u64, u64, f64) -> bool,
    ) -> bool {
        DenseFile::scan(self, tx, from, callback)
    }

    fn remove_vertex(
        &mut self,
        tx: &Arc<TransactionImpl>,
        instance: &mut RemoveVertex,
    ) -> Result<bool, Error> {
        DenseFile::remove_vertex(self, tx, instance)
    }

    fn unlock_vertex(&mut self, vertex_id: u64) {
        DenseFile::unlock_vertex(self, vertex_id);
    }

    fn load(&self, scratchpad: &mut ScratchPad) {
        DenseFile::load(self, scratchpad);
    }

    fn prune(&mut self, high_water_mark: Timestamp) {
        DenseFile::prune(self, high_water_mark);
    }

    fn clear_versions(&mut self) {
        DenseFile::clear_versions(self);
    }
}

/// The storage backing a segment.
#[enum_dispatch(SegmentFile)]
pub(crate) enum File {
    Sparse(SparseFile),
    Dense(DenseFile),
}

impl File {
    pub fn is_dense(&self) -> bool {
        matches!(self, Self::Dense(_))
    }
}

/// Access states of a segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Idle, no holder.
    Free,
    /// One or more locked readers active.
    Read,
    /// Exactly one writer active.
    Write,
    /// A crawler owns the segment for rebalancing.
    Rebal,
}

/// An entry of the wait queue. `Free` entries are optimistic readers parked
/// during a rebalance.
pub(crate) struct WaitEntry {
    pub purpose: State,
    pub waker: Sender<()>,
}

/// The queue-protected part of the segment.
pub(crate) struct SegmentQueue {
    pub state: State,
    pub num_active_threads: u32,
    pub queue: VecDeque<WaitEntry>,

    /// Token of the crawler owning the segment while in `Rebal`.
    pub rebalancer: Option<Arc<crate::rebalance::crawler::CrawlerShared>>,
}

impl SegmentQueue {
    /// Wakes the next batch of waiters according to their purpose: parked
    /// optimistic readers are skipped unless alone, READ and REBAL entries
    /// wake contiguously, WRITE entries wake one at a time.
    pub fn wake_next(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        if self.queue.front().is_some_and(|e| e.purpose == State::Free) {
            let size = self.queue.len();
            let mut rotated = 0;
            while rotated < size
                && self.queue.front().is_some_and(|e| e.purpose == State::Free)
            {
                #[expect(clippy::expect_used, reason = "the queue is non-empty")]
                let entry = self.queue.pop_front().expect("queue is empty");
                self.queue.push_back(entry);
                rotated += 1;
            }

            if rotated == size {
                // only optimistic readers are parked
                self.wake_all();
                return;
            }
        }

        #[expect(clippy::expect_used, reason = "the queue is non-empty")]
        let purpose = self.queue.front().expect("queue is empty").purpose;
        match purpose {
            State::Write => {
                if let Some(entry) = self.queue.pop_front() {
                    let _ = entry.waker.send(());
                }
            }
            State::Read | State::Rebal => {
                while self.queue.front().is_some_and(|e| e.purpose == purpose) {
                    if let Some(entry) = self.queue.pop_front() {
                        let _ = entry.waker.send(());
                    }
                }
            }
            State::Free => unreachable!("handled above"),
        }
    }

    /// Drains the whole queue. Used when the fence keys may have changed:
    /// waiters must re-route through the index.
    pub fn wake_all(&mut self) {
        while let Some(entry) = self.queue.pop_front() {
            let _ = entry.waker.send(());
        }
    }
}

pub(crate) struct Segment {
    /// Payload bit: 0 = sparse file, 1 = dense file.
    latch: OptimisticLatch<1>,

    queue: Mutex<SegmentQueue>,

    /// Low fence key: the minimum key that may reside in this segment.
    fence_key: Mutex<Key>,

    file: RwLock<File>,

    /// Back-off reference for the asynchronous rebalancer.
    time_last_rebalance: Mutex<Instant>,
}

impl Segment {
    pub fn new(file: File) -> Self {
        Self {
            latch: OptimisticLatch::new(),
            queue: Mutex::new(SegmentQueue {
                state: State::Free,
                num_active_threads: 0,
                queue: VecDeque::new(),
                rebalancer: None,
            }),
            fence_key: Mutex::new(KEY_MAX),
            file: RwLock::new(file),
            time_last_rebalance: Mutex::new(Instant::now()),
        }
    }

    pub fn latch(&self) -> &OptimisticLatch<1> {
        &self.latch
    }

    pub fn file(&self) -> &RwLock<File> {
        &self.file
    }

    pub fn queue(&self) -> MutexGuard<'_, SegmentQueue> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.queue.lock().expect("lock is poisoned")
    }

    pub fn fence_key(&self) -> Key {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        *self.fence_key.lock().expect("lock is poisoned")
    }

    pub fn set_fence_key(&self, key: Key) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.fence_key.lock().expect("lock is poisoned");
        *guard = key;
    }

    pub fn mark_rebalanced(&self) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.time_last_rebalance.lock().expect("lock is poisoned");
        *guard = Instant::now();
    }

    pub fn time_last_rebalance(&self) -> Instant {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        *self.time_last_rebalance.lock().expect("lock is poisoned")
    }

    /*************************************************************************
     * admission                                                             *
     *************************************************************************/

    /// Attempts to enter as the exclusive writer; on contention returns the
    /// receiver to wait on before retrying.
    pub fn enter_write(&self) -> Result<(), Receiver<()>> {
        let mut queue = self.queue();
        match queue.state {
            State::Free => {
                queue.state = State::Write;
                queue.num_active_threads = 1;
                Ok(())
            }
            _ => {
                let (tx, rx) = crossbeam_channel::bounded(1);
                queue.queue.push_back(WaitEntry {
                    purpose: State::Write,
                    waker: tx,
                });
                Err(rx)
            }
        }
    }

    /// Attempts to enter as a locked reader; additional readers admit
    /// directly.
    pub fn enter_read(&self) -> Result<(), Receiver<()>> {
        let mut queue = self.queue();
        match queue.state {
            State::Free | State::Read => {
                queue.state = State::Read;
                queue.num_active_threads += 1;
                Ok(())
            }
            _ => {
                let (tx, rx) = crossbeam_channel::bounded(1);
                queue.queue.push_back(WaitEntry {
                    purpose: State::Read,
                    waker: tx,
                });
                Err(rx)
            }
        }
    }

    /// Optimistic readers do not register; they only park while a crawler
    /// owns the segment, because every read would abort anyway.
    pub fn enter_optimistic(&self) -> Result<(), Receiver<()>> {
        let mut queue = self.queue();
        if queue.state == State::Rebal {
            let (tx, rx) = crossbeam_channel::bounded(1);
            queue.queue.push_back(WaitEntry {
                purpose: State::Free,
                waker: tx,
            });
            Err(rx)
        } else {
            Ok(())
        }
    }

    /// Releases a READ or WRITE admission. When a crawler marked the
    /// segment REBAL in the meantime, the state is left to it and the
    /// departure wakes its queued promises.
    pub fn exit(&self) {
        let mut queue = self.queue();
        debug_assert!(queue.num_active_threads > 0);
        queue.num_active_threads -= 1;

        if queue.num_active_threads > 0 {
            return;
        }

        if queue.state != State::Rebal {
            queue.state = State::Free;
        }
        queue.wake_next();
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue();
        write!(
            f,
            "Segment {{ state: {:?}, active: {}, fence: {:?} }}",
            queue.state,
            queue.num_active_threads,
            self.fence_key()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn wait_entry(purpose: State) -> (WaitEntry, Receiver<()>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            WaitEntry {
                purpose,
                waker: tx,
            },
            rx,
        )
    }

    #[test]
    fn wake_next_batches_readers() {
        let mut queue = SegmentQueue {
            state: State::Free,
            num_active_threads: 0,
            queue: VecDeque::new(),
            rebalancer: None,
        };

        let (r1, rx1) = wait_entry(State::Read);
        let (r2, rx2) = wait_entry(State::Read);
        let (w1, rx3) = wait_entry(State::Write);
        queue.queue.push_back(r1);
        queue.queue.push_back(r2);
        queue.queue.push_back(w1);

        queue.wake_next();
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());

        queue.wake_next();
        assert!(rx3.try_recv().is_ok());
    }

    #[test]
    fn wake_next_skips_parked_optimistic_readers() {
        let mut queue = SegmentQueue {
            state: State::Free,
            num_active_threads: 0,
            queue: VecDeque::new(),
            rebalancer: None,
        };

        let (f1, rx_free) = wait_entry(State::Free);
        let (w1, rx_write) = wait_entry(State::Write);
        queue.queue.push_back(f1);
        queue.queue.push_back(w1);

        queue.wake_next();
        // the writer wakes, the optimistic reader is rotated behind
        assert!(rx_write.try_recv().is_ok());
        assert!(rx_free.try_recv().is_err());

        // alone in the queue, the optimistic reader wakes
        queue.wake_next();
        assert!(rx_free.try_recv().is_ok());
    }

    #[test]
    fn write_admission_is_exclusive() {
        let pool = crate::bp::BufferPool::new(4096, 2, 1 << 20, false).unwrap();
        let segment = Segment::new(File::Sparse(SparseFile::new(
            pool.allocate_page().unwrap(),
        )));

        assert!(segment.enter_write().is_ok());
        let waiter = segment.enter_write().unwrap_err();

        segment.exit();
        assert!(waiter.recv().is_ok());
        assert!(segment.enter_write().is_ok());
        segment.exit();
    }
}
