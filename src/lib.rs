// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An in-memory transactional graph storage engine.
//!
//! The engine stores a weighted graph, directed or undirected, as a sorted
//! collection of vertices and their outgoing edges, and exposes
//! snapshot-isolated transactions over it.
//!
//! Storage is a two-level ordered container: a trie index maps keys to
//! *leaves*; each leaf holds a fixed number of fixed-size *segments*; each
//! segment stores its records in a *sparse file* (a double-sided gap buffer)
//! or, on overflow, a *dense file* (a radix trie over an item array).
//! Background services keep the segments within their density bounds
//! (rebalancing), merge under-filled leaves and reclaim memory through
//! epoch-based garbage collection.
//!
//! # Example usage
//!
//! ```
//! use teseo::Config;
//!
//! let db = Config::new().open()?;
//!
//! // transactions see the snapshot taken when they start
//! let tx = db.begin();
//! tx.insert_vertex(1)?;
//! tx.insert_vertex(2)?;
//! tx.insert_edge(1, 2, 0.5)?;
//! tx.commit()?;
//!
//! let tx = db.begin_read_only();
//! assert!(tx.has_vertex(1)?);
//! assert_eq!(0.5, tx.get_weight(1, 2)?);
//! assert_eq!(1, tx.degree(1)?);
//!
//! // scan the edges of a vertex in destination order
//! tx.scan(1, |source, destination, weight| {
//!     println!("{source} -> {destination} ({weight})");
//!     true
//! })?;
//! # Ok::<(), teseo::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

mod bp;
mod config;
mod error;
mod gc;
mod key;
mod latch;
mod memstore;
mod rebalance;
mod time;
mod transaction;

pub use {
    config::Config,
    error::{Error, Result},
    key::VertexId,
    time::Timestamp,
};

use crate::bp::BufferPool;
use crate::gc::{GarbageCollector, GcService};
use crate::key::Key;
use crate::memstore::Memstore;
use crate::rebalance::{async_service::AsyncRebalancer, merger::MergerService};
use crate::transaction::{TransactionImpl, TransactionManager};
use std::sync::{Arc, Mutex};

struct DbInner {
    memstore: Arc<Memstore>,
    txm: Arc<TransactionManager>,
    gc: Arc<GarbageCollector>,

    // background services, stopped (in order) at shutdown
    rebalancer: Mutex<Option<AsyncRebalancer>>,
    merger: Mutex<Option<MergerService>>,
    gc_service: Mutex<Option<GcService>>,
}

/// The database handle.
///
/// Built through [`Config::open`]; dropping it stops the background
/// services and releases the storage.
pub struct Teseo {
    inner: Arc<DbInner>,
}

impl Teseo {
    pub(crate) fn open(config: Config) -> Result<Self> {
        assert!(
            config.segment_size >= 32 && config.segment_size <= 8_192,
            "the segment size must be within [32, 8192] qwords"
        );
        assert!(
            config.num_segments_per_leaf >= 1,
            "a leaf needs at least one segment"
        );

        let pool = BufferPool::new(
            config.segment_size * 8,
            config.bp_min_num_pages,
            config.bp_max_logical_memory,
            config.huge_pages,
        )?;
        let gc = Arc::new(GarbageCollector::new(config.gc_queue_capacity));
        let txm = Arc::new(TransactionManager::new());

        let memstore = Arc::new(Memstore::new(
            pool,
            gc.clone(),
            txm.clone(),
            config.directed,
            config.num_segments_per_leaf,
            config.max_num_segments_per_leaf,
            config.calibrator_tree_height,
        )?);

        let rebalancer =
            AsyncRebalancer::start(memstore.clone(), config.async_num_threads, config.async_delay);
        let merger = MergerService::start(memstore.clone(), config.merger_interval);
        let gc_service = GcService::start(gc.clone(), config.gc_interval);

        log::info!(
            "teseo open: directed: {}, segment size: {} qwords, segments per leaf: {}",
            config.directed,
            config.segment_size,
            config.num_segments_per_leaf
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                memstore,
                txm,
                gc,
                rebalancer: Mutex::new(Some(rebalancer)),
                merger: Mutex::new(Some(merger)),
                gc_service: Mutex::new(Some(gc_service)),
            }),
        })
    }

    /// Starts a read-write transaction.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction {
            inner: TransactionImpl::start(self.inner.txm.clone(), false),
            db: self.inner.clone(),
        }
    }

    /// Starts a read-only transaction.
    #[must_use]
    pub fn begin_read_only(&self) -> Transaction {
        Transaction {
            inner: TransactionImpl::start(self.inner.txm.clone(), true),
            db: self.inner.clone(),
        }
    }
}

impl Drop for Teseo {
    fn drop(&mut self) {
        log::debug!("shutting down");

        // stop the services before touching the storage
        {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut guard = self.inner.rebalancer.lock().expect("lock is poisoned");
            if let Some(mut rebalancer) = guard.take() {
                rebalancer.stop();
            }
        }
        {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut guard = self.inner.merger.lock().expect("lock is poisoned");
            if let Some(mut merger) = guard.take() {
                merger.stop();
            }
        }
        {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut guard = self.inner.gc_service.lock().expect("lock is poisoned");
            if let Some(mut gc_service) = guard.take() {
                gc_service.stop();
            }
        }

        self.inner.memstore.clear();
        self.inner.gc.drain_all();
    }
}

/// A snapshot-isolated transaction.
///
/// Reads observe the database as of the transaction's start; writes become
/// visible to later snapshots at [`commit`](Self::commit). Conflicting
/// writes against a concurrent transaction fail with
/// [`Error::TransactionConflict`] as soon as they are issued (first writer
/// wins). A transaction dropped without committing rolls back.
pub struct Transaction {
    inner: Arc<TransactionImpl>,
    db: Arc<DbInner>,
}

impl Transaction {
    fn check_writable(&self) -> Result<()> {
        if self.inner.is_read_only() {
            return Err(Error::LogicalError("the transaction is read-only"));
        }
        if self.inner.is_terminated() {
            return Err(Error::LogicalError("the transaction is already terminated"));
        }
        Ok(())
    }

    /// Inserts the vertex. Fails if it already exists.
    pub fn insert_vertex(&self, vertex: VertexId) -> Result<()> {
        self.check_writable()?;
        self.db
            .memstore
            .insert_vertex(&self.inner, vertex + 1)
            .map_err(|e| e.into_conflict().externalize())
    }

    /// Removes the vertex and all of its attached edges. Returns the number
    /// of outgoing edges removed.
    pub fn remove_vertex(&self, vertex: VertexId) -> Result<u64> {
        self.check_writable()?;
        self.db
            .memstore
            .remove_vertex(&self.inner, vertex + 1)
            .map_err(|e| e.into_conflict().externalize())
    }

    /// Whether the vertex exists in this snapshot.
    pub fn has_vertex(&self, vertex: VertexId) -> Result<bool> {
        self.db
            .memstore
            .has_item(&self.inner, Key::vertex(vertex + 1), false)
            .map_err(Error::externalize)
    }

    /// Inserts the edge; on undirected graphs the reverse edge is stored as
    /// well. Fails if an endpoint is missing or the edge already exists.
    pub fn insert_edge(&self, source: VertexId, destination: VertexId, weight: f64) -> Result<()> {
        self.check_writable()?;
        self.db
            .memstore
            .insert_edge(&self.inner, source + 1, destination + 1, weight)
            .map_err(|e| e.into_conflict().externalize())
    }

    /// Removes the edge (both directions on undirected graphs).
    pub fn remove_edge(&self, source: VertexId, destination: VertexId) -> Result<()> {
        self.check_writable()?;
        self.db
            .memstore
            .remove_edge(&self.inner, source + 1, destination + 1)
            .map_err(|e| e.into_conflict().externalize())
    }

    /// Whether the edge exists in this snapshot.
    pub fn has_edge(&self, source: VertexId, destination: VertexId) -> Result<bool> {
        self.db
            .memstore
            .has_item(&self.inner, Key::new(source + 1, destination + 1), false)
            .map_err(Error::externalize)
    }

    /// The weight of the edge.
    pub fn get_weight(&self, source: VertexId, destination: VertexId) -> Result<f64> {
        self.db
            .memstore
            .get_weight(&self.inner, source + 1, destination + 1)
            .map_err(Error::externalize)
    }

    /// The number of visible outgoing edges of the vertex.
    pub fn degree(&self, vertex: VertexId) -> Result<u64> {
        self.db
            .memstore
            .get_degree(&self.inner, vertex + 1)
            .map_err(Error::externalize)
    }

    /// Graph-wide vertex count, as of this snapshot (plus the
    /// transaction's own uncommitted changes).
    #[must_use]
    pub fn num_vertices(&self) -> u64 {
        let snapshot = self.db.txm.properties_at(self.inner.start_time());
        let delta = self.inner.local_delta();
        (snapshot.num_vertices + delta.num_vertices).max(0) as u64
    }

    /// Graph-wide edge count, as of this snapshot (plus the transaction's
    /// own uncommitted changes).
    #[must_use]
    pub fn num_edges(&self) -> u64 {
        let snapshot = self.db.txm.properties_at(self.inner.start_time());
        let delta = self.inner.local_delta();
        (snapshot.num_edges + delta.num_edges).max(0) as u64
    }

    /// Invokes the callback for every visible edge of the vertex, in
    /// destination order. A `false` return stops the scan.
    pub fn scan(
        &self,
        vertex: VertexId,
        mut callback: impl FnMut(VertexId, VertexId, f64) -> bool,
    ) -> Result<()> {
        if !self.has_vertex(vertex)? {
            return Err(Error::VertexDoesNotExist(vertex));
        }

        let source = vertex + 1;
        self.db
            .memstore
            .scan(&self.inner, Key::vertex(source), &mut |s, d, w| {
                if s != source {
                    return false; // past the vertex's edges
                }
                if d == 0 {
                    return true; // the vertex record itself
                }
                callback(s - 1, d - 1, w)
            });
        Ok(())
    }

    /// Commits the transaction, making its changes visible to transactions
    /// that start afterwards.
    pub fn commit(self) -> Result<()> {
        self.inner.commit()
    }

    /// Rolls the transaction back, reverting all of its changes.
    pub fn rollback(self) -> Result<()> {
        self.inner.rollback(&self.db.memstore)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.inner.is_terminated() {
            let _ = self.inner.rollback(&self.db.memstore);
        }
    }
}

impl std::fmt::Debug for Teseo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Teseo {{ index entries: {} }}", self.inner.memstore.index.len())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
