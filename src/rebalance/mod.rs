// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Rebalancing: keeping the segments of every leaf within the density
//! bounds of the calibrator tree.
//!
//! A crawler widens a locked window over contiguous segments and produces a
//! [`Plan`]; the [`SpreadOperator`] executes it, spreading, splitting or
//! merging. Requests arrive asynchronously from writers through the
//! [`AsyncRebalancer`], while the [`MergerService`] periodically prunes
//! versions and merges under-filled leaves.
//!
//! [`Plan`]: plan::Plan
//! [`SpreadOperator`]: spread::SpreadOperator
//! [`AsyncRebalancer`]: async_service::AsyncRebalancer
//! [`MergerService`]: merger::MergerService

pub(crate) mod async_service;
pub(crate) mod crawler;
pub(crate) mod merger;
pub(crate) mod plan;
pub(crate) mod scratchpad;
pub(crate) mod spread;

use crate::key::Key;
use crate::memstore::Memstore;
use crawler::Crawler;
use spread::SpreadOperator;

/// Internal signal: the requested rebalance is obsolete (the segment moved,
/// another crawler took over, or the density recovered in the meantime).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct RebalanceNotNecessary;

/// Entry point of the asynchronous workers: verifies the request is still
/// current, then crawls and spreads.
pub(crate) fn rebalance_segment(
    memstore: &Memstore,
    key: Key,
) -> Result<(), RebalanceNotNecessary> {
    let entry = memstore.index.find(key);
    let leaf = entry.leaf;
    let segment_id = leaf.locate_segment(key);
    let segment = leaf.segment(segment_id);

    // the segment may have been rebalanced or merged away since the request
    if segment.latch().is_invalid() || segment.fence_key() != key {
        return Err(RebalanceNotNecessary);
    }
    if !memstore.needs_rebalance(segment) {
        return Err(RebalanceNotNecessary);
    }

    let mut crawler = Crawler::new(memstore, leaf, true);
    let plan = crawler.make_plan(segment_id)?;

    let operator = SpreadOperator::new(memstore, plan);
    if let Err(e) = operator.execute(crawler, None) {
        log::error!("rebalance failed: {e}");
    }
    Ok(())
}
