// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The spread operator: executes a rebalance [`Plan`], physically
//! redistributing the content of the window into the target segments.
//!
//! Spreads rewrite the window in place. Splits mint as many fresh leaves as
//! the content needs and retire the overflowing leaf through the GC; merges
//! pour two adjacent leaves into the first and retire the second.

use crate::key::{Key, KEY_MAX};
use crate::memstore::index::IndexEntry;
use crate::memstore::leaf::Leaf;
use crate::memstore::segment::{File, Segment, SegmentFile};
use crate::memstore::sparse_file::SparseFile;
use crate::memstore::Memstore;
use crate::rebalance::crawler::Crawler;
use crate::rebalance::plan::Plan;
use crate::rebalance::scratchpad::ScratchPad;
use crate::Result;
use std::sync::Arc;

pub(crate) struct SpreadOperator<'a> {
    memstore: &'a Memstore,
    plan: Plan,
    scratchpad: ScratchPad,
}

impl<'a> SpreadOperator<'a> {
    pub fn new(memstore: &'a Memstore, plan: Plan) -> Self {
        Self {
            memstore,
            plan,
            scratchpad: ScratchPad::new(),
        }
    }

    /// Runs the plan. The crawlers own the input segments in REBAL mode;
    /// they release (and, for retired leaves, invalidate) them on drop.
    pub fn execute(
        mut self,
        mut crawler1: Crawler<'_>,
        mut crawler2: Option<Crawler<'_>>,
    ) -> Result<()> {
        log::debug!("rebalance: {:?}", self.plan);

        let leaf1 = self.plan.first_leaf().clone();
        let inputs = self.input_segments();

        // block the optimistic readers for the whole physical phase; the
        // version bump at unlock forces the in-flight ones to retry
        for (leaf, segment_id) in &inputs {
            let _ = leaf.segment(*segment_id).latch().lock();
        }

        // the key range the window is responsible for
        let window_low_fence = leaf1.segment(self.plan.window_start()).fence_key();
        let old_fences = inputs
            .iter()
            .map(|(leaf, segment_id)| leaf.segment(*segment_id).fence_key())
            .collect::<Vec<_>>();

        // 1. load everything into the scratchpad
        for (leaf, segment_id) in &inputs {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let file = leaf.segment(*segment_id).file().read().expect("lock is poisoned");
            file.load(&mut self.scratchpad);
        }

        // 2. prune obsolete versions and elements
        self.scratchpad.prune(self.memstore.txm.high_water_mark());

        // 3. retune the plan against the pruned cardinality
        self.tune_plan();

        // 4. save into the output segments
        let outputs = self.make_outputs(&leaf1)?;
        self.save(&outputs, window_low_fence);
        let new_leaves = self.chain_leaves(&leaf1, outputs);

        // 5. publish the new fence keys in the index
        self.update_index(&old_fences, &new_leaves);

        // release the optimistic latches of the surviving segments; retired
        // leaves keep theirs locked and get invalidated on release
        let leaf1_retired = self.plan.is_split();
        for (leaf, segment_id) in &inputs {
            if Arc::ptr_eq(leaf, &leaf1) && !leaf1_retired {
                leaf.segment(*segment_id).latch().unlock();
            }
        }
        for leaf in &new_leaves {
            if !Arc::ptr_eq(leaf, &leaf1) {
                for segment_id in 0..leaf.num_segments() {
                    leaf.segment(segment_id).latch().unlock();
                }
            }
        }

        if leaf1_retired {
            crawler1.invalidate_on_release();
            let gc_leaf = leaf1.clone();
            self.memstore.gc.mark(Box::new(move || drop(gc_leaf)));
        }
        crawler1.release();

        if let Some(crawler) = crawler2.as_mut() {
            crawler.invalidate_on_release();
            crawler.release();

            // the merged-away leaf goes through the GC as well
            if let Some(leaf2) = self.plan.second_leaf().cloned() {
                self.memstore.gc.mark(Box::new(move || drop(leaf2)));
            }
        }

        Ok(())
    }

    /// The input segments of the plan, in key order.
    fn input_segments(&self) -> Vec<(Arc<Leaf>, usize)> {
        let leaf1 = self.plan.first_leaf().clone();
        let mut inputs = Vec::new();

        let window_end_in_leaf1 = self.plan.window_end().min(leaf1.num_segments());
        for segment_id in self.plan.window_start()..window_end_in_leaf1 {
            inputs.push((leaf1.clone(), segment_id));
        }

        if let Some(leaf2) = self.plan.second_leaf() {
            for segment_id in 0..leaf2.num_segments() {
                inputs.push((leaf2.clone(), segment_id));
            }
        }

        inputs
    }

    /// Recomputes the number of output segments after pruning.
    fn tune_plan(&mut self) {
        if !self.plan.is_split() {
            return;
        }

        let used_space = self.scratchpad.used_space();
        let per_segment = (self.memstore.segment_qwords as f64 * 0.75) as u64;
        let ideal = used_space.div_ceil(per_segment.max(1)).max(1) as usize;

        // pruning may have shrunk the content back below a split
        self.plan
            .set_num_output_segments(ideal.max(self.plan.first_leaf().num_segments()));

        log::trace!(
            "tuned plan: {} output segments for {used_space} qwords",
            self.plan.num_output_segments()
        );
    }

    /// The ordered list of output segments. A split allocates fresh leaves
    /// (each up to the configured maximum size); otherwise the outputs are
    /// the window itself.
    fn make_outputs(&self, leaf1: &Arc<Leaf>) -> Result<Vec<(Arc<Leaf>, usize)>> {
        let num_outputs = self.plan.num_output_segments();
        let mut outputs = Vec::with_capacity(num_outputs);

        if self.plan.is_split() {
            let leaf_size = self.memstore.max_num_segments_per_leaf;
            let mut remaining = num_outputs;
            while remaining > 0 {
                let size = remaining.min(leaf_size).max(self.memstore.num_segments_per_leaf.min(leaf_size));
                let leaf = Leaf::create(&self.memstore.pool, size)?;
                for segment_id in 0..leaf.num_segments() {
                    let _ = leaf.segment(segment_id).latch().lock();
                    outputs.push((leaf.clone(), segment_id));
                }
                remaining = remaining.saturating_sub(size);
            }
        } else {
            for output in 0..num_outputs {
                outputs.push((leaf1.clone(), self.plan.window_start() + output));
            }
        }

        Ok(outputs)
    }

    /// Fills the output segments left to right, each to roughly its even
    /// share of the content.
    fn save(&mut self, outputs: &[(Arc<Leaf>, usize)], window_low_fence: Key) {
        let mut remaining = self.scratchpad.used_space();
        let mut pos = 0;

        for (output, (leaf, segment_id)) in outputs.iter().enumerate() {
            let segment = leaf.segment(*segment_id);

            let outputs_left = (outputs.len() - output) as u64;
            // keep a floor so rounding can never stall the copy
            let budget = remaining.div_ceil(outputs_left).max(8);

            let entry_key =
                (pos < self.scratchpad.len()).then(|| self.scratchpad.get(pos).element.key());

            let achieved = {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut file = segment.file().write().expect("lock is poisoned");
                Self::reset_to_sparse(self.memstore, segment, &mut file);
                let File::Sparse(sparse) = &mut *file else {
                    unreachable!("just reset to sparse");
                };
                let mut achieved = sparse.save(&self.scratchpad, &mut pos, budget);
                if output + 1 == outputs.len() && pos < self.scratchpad.len() {
                    // the estimate fell short: the last segment takes the rest
                    achieved += sparse.save(
                        &self.scratchpad,
                        &mut pos,
                        u64::from(sparse.max_num_qwords()),
                    );
                }
                achieved
            };
            remaining = remaining.saturating_sub(achieved);

            // the first output keeps the window's low fence, later ones are
            // fenced at their first element
            let fence = if output == 0 {
                window_low_fence
            } else if achieved > 0 {
                #[expect(clippy::expect_used, reason = "achieved > 0 implies an entry was written")]
                entry_key.expect("no entry for a non-empty segment")
            } else {
                KEY_MAX
            };
            segment.set_fence_key(fence);
        }

        if pos < self.scratchpad.len() {
            log::error!(
                "rebalance could not place {} elements",
                self.scratchpad.len() - pos
            );
        }
        debug_assert!(pos == self.scratchpad.len(), "rebalance dropped elements");

        // input segments of the first leaf past the outputs become unused
        if self.plan.is_merge() {
            let leaf1 = self.plan.first_leaf();
            for segment_id in self.plan.num_output_segments()..leaf1.num_segments() {
                leaf1.segment(segment_id).set_fence_key(KEY_MAX);
            }
        }
    }

    /// Wires the leaf fence keys after a save and returns the leaves now
    /// owning the window, in key order.
    fn chain_leaves(&self, leaf1: &Arc<Leaf>, outputs: Vec<(Arc<Leaf>, usize)>) -> Vec<Arc<Leaf>> {
        let mut leaves: Vec<Arc<Leaf>> = Vec::new();
        for (leaf, _) in outputs {
            if !leaves.last().is_some_and(|last| Arc::ptr_eq(last, &leaf)) {
                leaves.push(leaf);
            }
        }

        if self.plan.is_split() {
            let low = leaf1.lfkey();
            let high = leaf1.hfkey();

            // drop trailing leaves that received nothing
            while leaves
                .last()
                .is_some_and(|leaf| leaf.segment(0).fence_key() == KEY_MAX)
            {
                #[expect(clippy::expect_used, reason = "the loop guard peeked the entry")]
                let empty = leaves.pop().expect("leaves is empty");
                for segment_id in 0..empty.num_segments() {
                    empty.segment(segment_id).latch().unlock();
                    empty.segment(segment_id).latch().invalidate();
                }
            }

            for (position, leaf) in leaves.iter().enumerate() {
                let lf = if position == 0 {
                    low
                } else {
                    leaf.segment(0).fence_key()
                };
                let hf = leaves
                    .get(position + 1)
                    .map_or(high, |next| next.segment(0).fence_key());
                leaf.set_lfkey(lf);
                leaf.set_hfkey(hf);
            }
        } else if let Some(leaf2) = self.plan.second_leaf() {
            // merge: the first leaf swallows the second leaf's range
            leaf1.set_hfkey(leaf2.hfkey());
        }

        leaves
    }

    /// Makes sure the output segment holds an empty sparse file, converting
    /// dense segments back and resetting the payload bit.
    fn reset_to_sparse(memstore: &Memstore, segment: &Segment, file: &mut File) {
        match file {
            File::Sparse(sparse) => sparse.reset(),
            File::Dense(_) => {
                // the dense variant has no page; take a fresh one
                match memstore.pool.allocate_page() {
                    Ok(page) => {
                        *file = File::Sparse(SparseFile::new(page));
                        let _ = segment.latch().set_payload(0);
                    }
                    Err(e) => {
                        // keep the dense file; the segment stays oversized
                        // until memory is available again
                        log::error!("cannot allocate a page during rebalance: {e}");
                    }
                }
            }
        }
    }

    /// Publishes the new fence keys: stale entries out, current entries in.
    fn update_index(&self, old_fences: &[Key], new_leaves: &[Arc<Leaf>]) {
        for &fence in old_fences {
            if fence != KEY_MAX {
                self.memstore.index.remove(fence);
            }
        }

        for leaf in new_leaves {
            for segment_id in 0..leaf.num_segments() {
                let fence = leaf.segment(segment_id).fence_key();
                if fence != KEY_MAX {
                    self.memstore.index.insert(
                        fence,
                        IndexEntry {
                            leaf: leaf.clone(),
                            segment_id,
                        },
                    );
                }
            }
        }
    }
}
