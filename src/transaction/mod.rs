// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Timestamp-ordered snapshot isolation.
//!
//! A transaction reads the database as of its start time and buffers the
//! prior image of every change in its undo chain. Conflicts are detected at
//! update time (first writer wins); commit assigns the commit timestamp that
//! makes the changes visible to later snapshots.

mod manager;
mod undo;

pub(crate) use manager::{GraphProperties, TransactionManager};
pub(crate) use undo::Undo;

use crate::error::{Error, Result};
use crate::memstore::update::Update;
use crate::memstore::Memstore;
use crate::time::Timestamp;
use std::sync::{
    atomic::{
        AtomicI64, AtomicU64, AtomicU8,
        Ordering::{Acquire, Relaxed, Release},
    },
    Arc, Mutex,
};

/// Added to the start time to form the write id of a pending transaction:
/// unique, and greater than every committed timestamp, so version checks
/// read "locked by someone not yet committed".
const PENDING_OFFSET: u64 = u64::MAX >> 1;

const STATE_PENDING: u8 = 0;
const STATE_COMMITTED: u8 = 1;
const STATE_ABORTED: u8 = 2;

/// What a transaction sees when resolving an undo chain.
pub(crate) enum Visibility {
    /// The storage image is visible.
    Storage,

    /// The storage image is too new; this prior image applies instead.
    Payload(Update),
}

pub(crate) struct TransactionImpl {
    manager: Arc<TransactionManager>,
    start_time: Timestamp,

    /// `start_time + PENDING_OFFSET` while pending, the commit time once
    /// committed, the start time again once aborted.
    write_id: AtomicU64,

    state: AtomicU8,
    read_only: bool,

    /// Undo records in creation order; rolled back in reverse.
    undo_buffer: Mutex<Vec<Arc<Undo>>>,

    /// Local graph-property delta, folded into the global counters at commit.
    delta_vertices: AtomicI64,
    delta_edges: AtomicI64,
}

impl TransactionImpl {
    pub fn start(manager: Arc<TransactionManager>, read_only: bool) -> Arc<Self> {
        let start_time = manager.register();
        log::trace!("transaction {start_time} started, read_only: {read_only}");

        Arc::new(Self {
            manager,
            start_time,
            write_id: AtomicU64::new(start_time + PENDING_OFFSET),
            state: AtomicU8::new(STATE_PENDING),
            read_only,
            undo_buffer: Mutex::new(Vec::new()),
            delta_vertices: AtomicI64::new(0),
            delta_edges: AtomicI64::new(0),
        })
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// The transaction's write timestamp, as observed by version checks.
    pub fn write_id(&self) -> Timestamp {
        self.write_id.load(Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.load(Acquire) != STATE_PENDING
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn owns(&self, undo: &Undo) -> bool {
        std::ptr::eq(self, Arc::as_ptr(undo.transaction()))
    }

    /// Resolves which image of an element this transaction sees, walking the
    /// undo chain hanging off the given head.
    pub fn can_read(&self, head: &Arc<Undo>) -> Visibility {
        if self.owns(head) || head.transaction().write_id() <= self.start_time {
            return Visibility::Storage;
        }

        let mut current = head.clone();
        loop {
            let payload = current.payload();
            match current.next() {
                None => return Visibility::Payload(payload),
                Some(next) => {
                    if self.owns(&next) || next.transaction().write_id() <= self.start_time {
                        return Visibility::Payload(payload);
                    }
                    current = next;
                }
            }
        }
    }

    /// Whether this transaction may install a new version over the given
    /// chain head: the head must be its own, or belong to a terminated
    /// transaction whose write timestamp is within this snapshot.
    pub fn can_write(&self, head: &Arc<Undo>) -> bool {
        if self.owns(head) {
            return true;
        }

        let tx = head.transaction();
        tx.is_terminated() && tx.write_id() <= self.start_time
    }

    /// Appends a record carrying the given prior image to the undo buffer.
    pub fn add_undo(self: &Arc<Self>, prior_image: Update) -> Arc<Undo> {
        debug_assert!(!self.read_only, "read-only transactions cannot write");
        let undo = Arc::new(Undo::new(self.clone(), prior_image));

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut buffer = self.undo_buffer.lock().expect("lock is poisoned");
        buffer.push(undo.clone());
        undo
    }

    /// Number of undo records currently buffered; paired with
    /// [`rollback_last`](Self::rollback_last) to revert a partial operation.
    pub fn num_undo_records(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.undo_buffer.lock().expect("lock is poisoned").len()
    }

    pub fn record_vertex_delta(&self, delta: i64) {
        self.delta_vertices.fetch_add(delta, Relaxed);
    }

    pub fn record_edge_delta(&self, delta: i64) {
        self.delta_edges.fetch_add(delta, Relaxed);
    }

    /// The transaction's uncommitted graph-property delta.
    pub fn local_delta(&self) -> GraphProperties {
        GraphProperties {
            num_vertices: self.delta_vertices.load(Relaxed),
            num_edges: self.delta_edges.load(Relaxed),
        }
    }

    /// The minimum start time among the pending transactions.
    pub fn high_water_mark(&self) -> Timestamp {
        self.manager.high_water_mark()
    }

    pub fn commit(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::LogicalError("the transaction is already terminated"));
        }

        if self.read_only {
            self.write_id.store(self.start_time, Release);
            self.state.store(STATE_COMMITTED, Release);
            self.manager.unregister(self.start_time);
            return Ok(());
        }

        let delta = GraphProperties {
            num_vertices: self.delta_vertices.load(Relaxed),
            num_edges: self.delta_edges.load(Relaxed),
        };

        let (commit_time, boundary_guard) = self.manager.commit(delta);
        self.write_id.store(commit_time, Release);
        self.state.store(STATE_COMMITTED, Release);
        drop(boundary_guard);

        log::trace!(
            "transaction {} committed at {commit_time}, delta: {delta:?}",
            self.start_time
        );

        // Drop the buffer's references: from here on the undo chains stay
        // alive only through the storage cells that still point at them.
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.undo_buffer.lock().expect("lock is poisoned").clear();

        self.manager.unregister(self.start_time);
        Ok(())
    }

    /// Reverts the `count` most recent undo records.
    pub fn rollback_last(&self, memstore: &Memstore, count: usize) {
        let records = {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut buffer = self.undo_buffer.lock().expect("lock is poisoned");
            let keep = buffer.len().saturating_sub(count);
            buffer.split_off(keep)
        };

        for record in records.into_iter().rev() {
            memstore.rollback_record(&record);
        }
    }

    pub fn rollback(&self, memstore: &Memstore) -> Result<()> {
        if self.is_terminated() {
            return Err(Error::LogicalError("the transaction is already terminated"));
        }

        self.rollback_last(memstore, usize::MAX);

        self.write_id.store(self.start_time, Release);
        self.state.store(STATE_ABORTED, Release);
        self.manager.unregister(self.start_time);

        log::trace!("transaction {} rolled back", self.start_time);
        Ok(())
    }
}

impl std::fmt::Debug for TransactionImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Acquire) {
            STATE_PENDING => "pending",
            STATE_COMMITTED => "committed",
            _ => "aborted",
        };
        write!(f, "Transaction {{ start: {}, {state} }}", self.start_time)
    }
}
