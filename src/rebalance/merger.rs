// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The merger: a periodic background pass over the leaves in fence-key
//! order. Each visited segment is pruned (under a phantom lock, leaving
//! optimistic readers undisturbed); adjacent leaves whose combined content
//! fits comfortably into one are merged through the spread operator.

use crate::gc::ScopedEpoch;
use crate::key::{KEY_MAX, KEY_MIN};
use crate::memstore::leaf::Leaf;
use crate::memstore::Memstore;
use crate::rebalance::crawler::Crawler;
use crate::rebalance::plan::Plan;
use crate::rebalance::spread::SpreadOperator;
use crate::rebalance::RebalanceNotNecessary;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct MergerService {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MergerService {
    pub fn start(memstore: Arc<Memstore>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("teseo-merger".into())
            .spawn(move || {
                log::debug!("merger started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => Self::pass(&memstore),
                        _ => break,
                    }
                }
                log::debug!("merger stopped");
            })
            .unwrap_or_else(|e| panic!("cannot spawn the merger: {e}"));

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// One pass over every leaf: prune all segments, merge when the
    /// combined fill of two neighbours drops below the threshold.
    pub fn pass(memstore: &Arc<Memstore>) {
        let _epoch = ScopedEpoch::new(&memstore.gc);

        let leaf_capacity = memstore.segment_qwords * memstore.num_segments_per_leaf as u64;
        let merge_threshold = leaf_capacity * 3 / 4;

        let mut key = KEY_MIN;
        let mut previous: Option<Arc<Leaf>> = None;

        loop {
            let entry = memstore.index.find(key);
            let leaf = entry.leaf;

            if leaf.segment(0).latch().is_invalid() {
                // deleted underneath us; retry once the index caught up
                previous = None;
                std::thread::yield_now();
                continue;
            }

            Self::prune_leaf(memstore, &leaf);

            // graph properties nobody can read anymore go too
            memstore.txm.prune_properties();

            if let Some(prev) = previous.take() {
                if prev.used_space() + leaf.used_space() <= merge_threshold {
                    match Self::merge(memstore, &prev, &leaf) {
                        Ok(()) => {
                            // rescan from the merged leaf: it may merge again
                            key = prev.lfkey();
                            continue;
                        }
                        Err(RebalanceNotNecessary) => {
                            log::trace!("merge aborted, leaves busy");
                        }
                    }
                }
            }

            let next = leaf.hfkey();
            if next == KEY_MAX {
                return;
            }
            key = next;
            previous = Some(leaf);
        }
    }

    /// Prunes every segment of the leaf. The phantom lock keeps the latch
    /// version untouched: pruning does not alter the visible content, so
    /// optimistic readers may proceed undisturbed.
    fn prune_leaf(memstore: &Memstore, leaf: &Arc<Leaf>) {
        use crate::memstore::segment::SegmentFile;

        for segment_id in 0..leaf.num_segments() {
            let segment = leaf.segment(segment_id);

            loop {
                match segment.enter_write() {
                    Ok(()) => break,
                    Err(waiter) => {
                        let _ = waiter.recv();
                    }
                }
            }

            if segment.latch().phantom_lock().is_ok() {
                {
                    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                    let mut file = segment.file().write().expect("lock is poisoned");
                    file.prune(memstore.txm.high_water_mark());
                }
                segment.latch().phantom_unlock();
            }

            segment.exit();
        }
    }

    fn merge(
        memstore: &Arc<Memstore>,
        leaf1: &Arc<Leaf>,
        leaf2: &Arc<Leaf>,
    ) -> Result<(), RebalanceNotNecessary> {
        log::debug!("merging {leaf1:?} and {leaf2:?}");

        // take every segment of both leaves, in fence order
        let mut crawler1 = Crawler::new(memstore, leaf1.clone(), false);
        crawler1.lock2merge()?;
        let mut crawler2 = Crawler::new(memstore, leaf2.clone(), false);
        if let Err(e) = crawler2.lock2merge() {
            crawler1.release();
            return Err(e);
        }

        let cardinality = crawler1.cardinality() + crawler2.cardinality();
        let plan = Plan::create_merge(cardinality, leaf1.clone(), leaf2.clone());

        let operator = SpreadOperator::new(memstore, plan);
        if let Err(e) = operator.execute(crawler1, Some(crawler2)) {
            log::error!("merge failed: {e}");
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MergerService {
    fn drop(&mut self) {
        self.stop();
    }
}
