// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Result, Teseo};
use std::time::Duration;

/// Engine configuration builder
///
/// # Examples
///
/// ```
/// use teseo::Config;
///
/// let db = Config::new().directed(false).open()?;
///
/// let tx = db.begin();
/// tx.insert_vertex(0)?;
/// tx.commit()?;
/// # Ok::<(), teseo::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Whether edges are directed; undirected graphs store both directions.
    pub(crate) directed: bool,

    /// Capacity of a segment file, in qwords (64-bit words).
    pub(crate) segment_size: usize,

    /// Segments per leaf.
    pub(crate) num_segments_per_leaf: usize,

    /// Largest leaf (in segments) a split may mint.
    pub(crate) max_num_segments_per_leaf: usize,

    /// Height of the calibrator tree; 0 derives it from the leaf size.
    pub(crate) calibrator_tree_height: usize,

    /// Worker threads of the asynchronous rebalancer; 0 disables it.
    pub(crate) async_num_threads: usize,

    /// Delay before an asynchronous rebalance request fires, so bursts
    /// against the same segment coalesce.
    pub(crate) async_delay: Duration,

    /// Period of the merger pass.
    pub(crate) merger_interval: Duration,

    /// Period of the garbage collector pass.
    pub(crate) gc_interval: Duration,

    /// Initial capacity of the garbage collector queues.
    pub(crate) gc_queue_capacity: usize,

    /// Buffer pool growth/shrink granularity, in pages.
    pub(crate) bp_min_num_pages: usize,

    /// Upper bound on the buffer pool's backing memory, in bytes.
    pub(crate) bp_max_logical_memory: usize,

    /// Whether the page frames are backed by huge pages.
    pub(crate) huge_pages: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directed: false,
            segment_size: 512,
            num_segments_per_leaf: 64,
            max_num_segments_per_leaf: 128,
            calibrator_tree_height: 0,
            async_num_threads: 2,
            async_delay: Duration::from_millis(200),
            merger_interval: Duration::from_secs(1),
            gc_interval: Duration::from_millis(100),
            gc_queue_capacity: 128,
            bp_min_num_pages: 64,
            bp_max_logical_memory: /* 2 GiB */ 2 * 1_024 * 1_024 * 1_024,
            huge_pages: false,
        }
    }
}

impl Config {
    /// Initializes a new config with the default tunables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether edges are directed.
    ///
    /// Default: `false` (each inserted edge also stores its reverse)
    #[must_use]
    pub fn directed(mut self, directed: bool) -> Self {
        self.directed = directed;
        self
    }

    /// Sets the capacity of a segment file, in qwords.
    ///
    /// Default: 512
    #[must_use]
    pub fn segment_size(mut self, qwords: usize) -> Self {
        self.segment_size = qwords;
        self
    }

    /// Sets the number of segments per leaf.
    ///
    /// Default: 64
    #[must_use]
    pub fn num_segments_per_leaf(mut self, count: usize) -> Self {
        self.num_segments_per_leaf = count;
        self
    }

    /// Sets the largest leaf (in segments) a split may mint.
    ///
    /// Default: 128
    #[must_use]
    pub fn max_num_segments_per_leaf(mut self, count: usize) -> Self {
        self.max_num_segments_per_leaf = count;
        self
    }

    /// Sets the calibrator tree height; 0 derives it from the leaf size.
    ///
    /// Default: 0
    #[must_use]
    pub fn calibrator_tree_height(mut self, height: usize) -> Self {
        self.calibrator_tree_height = height;
        self
    }

    /// Sets the number of asynchronous rebalancer threads; 0 disables the
    /// service.
    ///
    /// Default: 2
    #[must_use]
    pub fn async_num_threads(mut self, count: usize) -> Self {
        self.async_num_threads = count;
        self
    }

    /// Sets the delay before an asynchronous rebalance request fires.
    ///
    /// Default: 200 ms
    #[must_use]
    pub fn async_delay(mut self, delay: Duration) -> Self {
        self.async_delay = delay;
        self
    }

    /// Sets the period of the merger pass.
    ///
    /// Default: 1 s
    #[must_use]
    pub fn merger_interval(mut self, interval: Duration) -> Self {
        self.merger_interval = interval;
        self
    }

    /// Sets the period of the garbage collector pass.
    ///
    /// Default: 100 ms
    #[must_use]
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Sets the initial capacity of the garbage collector queues.
    ///
    /// Default: 128
    #[must_use]
    pub fn gc_queue_capacity(mut self, capacity: usize) -> Self {
        self.gc_queue_capacity = capacity;
        self
    }

    /// Sets the buffer pool growth granularity, in pages.
    ///
    /// Default: 64
    #[must_use]
    pub fn bp_min_num_pages(mut self, pages: usize) -> Self {
        self.bp_min_num_pages = pages;
        self
    }

    /// Sets the upper bound on the buffer pool's backing memory, in bytes.
    ///
    /// Default: 2 GiB
    #[must_use]
    pub fn bp_max_logical_memory(mut self, bytes: usize) -> Self {
        self.bp_max_logical_memory = bytes;
        self
    }

    /// Requests huge-page-backed page frames.
    ///
    /// Default: `false`
    #[must_use]
    pub fn huge_pages(mut self, enabled: bool) -> Self {
        self.huge_pages = enabled;
        self
    }

    /// Opens the engine: allocates the initial leaf and starts the
    /// background services.
    pub fn open(self) -> Result<Teseo> {
        Teseo::open(self)
    }
}
