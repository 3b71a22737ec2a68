// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The crawler: grows a rebalance window over contiguous segments of a leaf
//! until the calibrator-tree density rule is satisfied, cooperating with
//! concurrent crawlers by absorbing the ones that have not entered their
//! physical phase yet.

use crate::memstore::leaf::Leaf;
use crate::memstore::segment::{SegmentFile, State, WaitEntry};
use crate::memstore::Memstore;
use crate::rebalance::plan::Plan;
use crate::rebalance::RebalanceNotNecessary;
use crossbeam_channel::Receiver;
use std::sync::{Arc, Mutex};

/// Density thresholds of the calibrator tree. The constraint
/// `0 < rho_0 < rho_h <= tau_h < tau_0 <= 1` must hold.
const DENSITY_RHO_0: f64 = 0.5; // lower bound, leaf
const DENSITY_RHO_H: f64 = 0.75; // lower bound, root
const DENSITY_TAU_H: f64 = 0.75; // upper bound, root
const DENSITY_TAU_0: f64 = 1.0; // upper bound, leaf

/// State a crawler shares with the segments it acquired, so a competing
/// crawler can stop it and inherit its window.
pub(crate) struct CrawlerShared {
    pub inner: Mutex<CrawlerState>,
}

pub(crate) struct CrawlerState {
    /// Cleared when another crawler absorbed this one.
    pub can_continue: bool,

    /// Cleared once the physical phase begins; an unstoppable crawler must
    /// be waited for instead of absorbed.
    pub can_be_stopped: bool,

    pub window_start: usize,
    pub window_end: usize,
    pub used_space: u64,

    /// Promises of the displaced readers and writers still inside the
    /// window's segments.
    pub waiters: Vec<Receiver<()>>,
}

pub(crate) struct Crawler<'a> {
    memstore: &'a Memstore,
    leaf: Arc<Leaf>,
    shared: Arc<CrawlerShared>,
    invalidate_on_release: bool,
    released: bool,
}

impl<'a> Crawler<'a> {
    pub fn new(memstore: &'a Memstore, leaf: Arc<Leaf>, can_be_stopped: bool) -> Self {
        Self {
            memstore,
            leaf,
            shared: Arc::new(CrawlerShared {
                inner: Mutex::new(CrawlerState {
                    can_continue: true,
                    can_be_stopped,
                    window_start: 0,
                    window_end: 0,
                    used_space: 0,
                    waiters: Vec::new(),
                }),
            }),
            invalidate_on_release: false,
            released: false,
        }
    }

    pub fn leaf(&self) -> &Arc<Leaf> {
        &self.leaf
    }

    pub fn window(&self) -> (usize, usize) {
        let state = self.state();
        (state.window_start, state.window_end)
    }

    pub fn used_space(&self) -> u64 {
        self.state().used_space
    }

    /// Segments of deleted leaves are invalidated on release, so stale
    /// readers re-route through the index.
    pub fn invalidate_on_release(&mut self) {
        self.invalidate_on_release = true;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CrawlerState> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.shared.inner.lock().expect("lock is poisoned")
    }

    /// Total number of elements in the acquired window.
    pub fn cardinality(&self) -> u64 {
        let (start, end) = self.window();
        (start..end)
            .map(|segment_id| {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let file = self
                    .leaf
                    .segment(segment_id)
                    .file()
                    .read()
                    .expect("lock is poisoned");
                file.cardinality()
            })
            .sum()
    }

    /*************************************************************************
     * leaf latch                                                            *
     *************************************************************************/

    fn leaf_xlock(&self) -> Result<(), RebalanceNotNecessary> {
        self.leaf.lock_exclusive();

        // another crawler may have stopped us while we were waiting
        if !self.state().can_continue {
            self.leaf.unlock_exclusive();
            return Err(RebalanceNotNecessary);
        }
        Ok(())
    }

    fn leaf_xunlock(&self) {
        self.leaf.unlock_exclusive();
    }

    /*************************************************************************
     * window growth                                                         *
     *************************************************************************/

    /// Acquires one segment into the window, possibly absorbing another
    /// crawler (in which case `segment_id` jumps past its window).
    fn acquire_segment(
        &self,
        segment_id: &mut i64,
        is_right_direction: bool,
    ) -> Result<(), RebalanceNotNecessary> {
        let leaf = &self.leaf;
        debug_assert!((*segment_id as usize) < leaf.num_segments());

        loop {
            let segment = leaf.segment(*segment_id as usize);
            let mut queue = segment.queue();

            match queue.state {
                State::Free | State::Read | State::Write => {
                    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                    let mut state = self.shared.inner.lock().expect("lock is poisoned");

                    let mut space = {
                        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                        let file = segment.file().read().expect("lock is poisoned");
                        file.used_space()
                    };

                    if queue.state == State::Write {
                        // pessimistic assumption: the writer adds one element
                        // with its dummy and version
                        space += 5;
                    }

                    if queue.state != State::Free {
                        // displace the holder: its departure fulfils the
                        // promise queued at the front
                        let (waker, waiter) = crossbeam_channel::bounded(1);
                        queue.queue.push_front(WaitEntry {
                            purpose: State::Rebal,
                            waker,
                        });
                        state.waiters.push(waiter);
                    }

                    queue.state = State::Rebal;
                    queue.rebalancer = Some(self.shared.clone());
                    state.used_space += space;
                    return Ok(());
                }
                State::Rebal => {
                    #[expect(clippy::expect_used, reason = "a REBAL segment has a crawler")]
                    let other = queue.rebalancer.clone().expect("crawler token missing");

                    if Arc::ptr_eq(&other, &self.shared) {
                        // already ours (absorbed along with another crawler)
                        return Ok(());
                    }

                    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                    let mut other_state = other.inner.lock().expect("lock is poisoned");

                    if !other_state.can_be_stopped {
                        // the other crawler is already rebalancing: wait for
                        // it to finish, releasing the leaf latch meanwhile
                        drop(other_state);
                        let (waker, waiter) = crossbeam_channel::bounded(1);
                        queue.queue.push_front(WaitEntry {
                            purpose: State::Rebal,
                            waker,
                        });
                        drop(queue);

                        self.leaf_xunlock();
                        let _ = waiter.recv();
                        self.leaf_xlock()?;
                        continue;
                    }

                    // stop the other crawler and inherit its window
                    other_state.can_continue = false;

                    #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                    let mut state = self.shared.inner.lock().expect("lock is poisoned");
                    state.used_space += other_state.used_space;
                    state.waiters.append(&mut other_state.waiters);

                    let (absorbed_start, absorbed_end) =
                        (other_state.window_start, other_state.window_end);
                    // windows are contiguous and disjoint, so the absorbed
                    // one extends ours on exactly one flank
                    state.window_start = state.window_start.min(absorbed_start);
                    state.window_end = state.window_end.max(absorbed_end);
                    *segment_id = if is_right_direction {
                        absorbed_end as i64 - 1
                    } else {
                        absorbed_start as i64
                    };

                    drop(state);
                    drop(other_state);
                    drop(queue);

                    for other_id in absorbed_start..absorbed_end {
                        leaf.segment(other_id).queue().rebalancer = Some(self.shared.clone());
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Waits until every displaced reader and writer left the window.
    fn wait_for_holders(&self) {
        let waiters = {
            let mut state = self.state();
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.recv();
        }
    }

    /// Grows the window around the triggering segment until the density
    /// thresholds admit a rebalance, or plans a split when the whole leaf is
    /// overflowing.
    pub fn make_plan(&mut self, trigger: usize) -> Result<Plan, RebalanceNotNecessary> {
        let num_segments = self.leaf.num_segments() as i64;
        let trigger = trigger as i64;

        self.leaf_xlock()?;

        // the triggering segment seeds the window
        {
            let mut state = self.state();
            state.window_start = trigger as usize;
            state.window_end = trigger as usize + 1;
        }
        {
            let mut seed = trigger;
            self.acquire_segment(&mut seed, true)?;
        }

        // absorbing a competitor may already have widened the seed window
        let (seed_start, seed_end) = self.window();
        let mut do_rebalance = false;
        let mut window_start = seed_start as i64;
        let mut window_length = (seed_end - seed_start) as i64 * 2;
        let mut index_left = seed_start as i64 - 1;
        let mut index_right = seed_end as i64;

        while !do_rebalance && window_length <= num_segments {
            let height = (window_length as f64).log2() + 1.0;

            // re-center the window on the triggering segment; a window
            // inherited from an absorbed crawler may already reach further
            let mut window_start_new =
                (trigger / 2f64.powf(height - 1.0) as i64) * window_length;
            if window_start_new + window_length >= num_segments {
                window_start_new = num_segments - window_length;
            }
            window_start = window_start_new.min(window_start);
            let mut window_end = window_start + window_length;

            while index_right < window_end {
                self.acquire_segment(&mut index_right, true)?;
                self.state().window_end = index_right as usize + 1;
                index_right += 1;
            }
            // absorbing another crawler may have widened the window
            window_end = index_right;

            while index_left >= window_start {
                self.acquire_segment(&mut index_left, false)?;
                self.state().window_start = index_left as usize;
                index_left -= 1;
            }
            window_start = index_left + 1;
            window_length = window_end - window_start;

            let height_in_tree = (window_length as f64).log2().floor() as i64 + 1;
            let (_min_space, max_space) = self.get_thresholds(height_in_tree);
            if self.state().used_space <= max_space {
                do_rebalance = true;
            } else {
                if window_length == num_segments {
                    break;
                }
                window_length = (window_length * 2).min(num_segments);
            }
        }

        if !do_rebalance {
            // a split covers the whole leaf
            while index_right < num_segments {
                self.acquire_segment(&mut index_right, true)?;
                self.state().window_end = index_right as usize + 1;
                index_right += 1;
            }
            while index_left >= 0 {
                self.acquire_segment(&mut index_left, false)?;
                self.state().window_start = index_left as usize;
                index_left -= 1;
            }
        }

        // entering the physical phase: no other crawler may stop us anymore
        self.state().can_be_stopped = false;
        self.leaf_xunlock();
        self.wait_for_holders();

        let (start, end) = self.window();
        if do_rebalance {
            Ok(Plan::create_spread(
                self.cardinality(),
                self.leaf.clone(),
                start,
                end,
            ))
        } else {
            // the leaf overflows: split
            debug_assert!(start == 0 && end == num_segments as usize);
            let used_space = self.state().used_space;
            let ideal = (used_space as f64 / (0.75 * self.memstore.segment_qwords as f64)) as usize;
            let num_outputs = ideal.max(num_segments as usize);

            if num_outputs == num_segments as usize {
                Ok(Plan::create_spread(
                    self.cardinality(),
                    self.leaf.clone(),
                    start,
                    end,
                ))
            } else {
                Ok(Plan::create_split(
                    self.cardinality(),
                    self.leaf.clone(),
                    num_outputs,
                ))
            }
        }
    }

    /// Takes every segment of the leaf in REBAL mode, for a merge.
    pub fn lock2merge(&mut self) -> Result<(), RebalanceNotNecessary> {
        self.leaf_xlock()?;

        let num_segments = self.leaf.num_segments();
        for segment_id in 0..num_segments {
            let mut id = segment_id as i64;
            self.acquire_segment(&mut id, true)?;
            self.state().window_end = id as usize + 1;
        }
        {
            let mut state = self.state();
            state.window_start = 0;
            state.window_end = num_segments;
        }

        self.leaf_xunlock();
        self.wait_for_holders();
        Ok(())
    }

    /*************************************************************************
     * calibrator tree                                                       *
     *************************************************************************/

    fn calibrator_tree_height(&self) -> i64 {
        let configured = self.memstore.calibrator_tree_height;
        if configured > 0 {
            configured as i64
        } else {
            (self.memstore.num_segments_per_leaf as f64).log2().floor() as i64 + 1
        }
    }

    /// The `[min, max]` amount of used space admissible for a window at the
    /// given height, linearly interpolated between the leaf and the root
    /// thresholds.
    fn get_thresholds(&self, height: i64) -> (u64, u64) {
        let mut rho = DENSITY_RHO_0;
        let mut tau = DENSITY_TAU_0;
        let tree_height = self.calibrator_tree_height();

        if tree_height > 1 {
            let scale = (tree_height - height) as f64 / (tree_height - 1) as f64;
            rho = DENSITY_RHO_H - (DENSITY_RHO_H - DENSITY_RHO_0) * scale;
            tau = DENSITY_TAU_H + (DENSITY_TAU_0 - DENSITY_TAU_H) * scale;
        }

        let num_segments = (self.memstore.num_segments_per_leaf as i64)
            .min(2f64.powf(height as f64 - 1.0) as i64) as f64;
        let space_per_segment = self.memstore.segment_qwords as f64;

        let min_space = (num_segments * space_per_segment * rho) as u64;
        // always leave a few qwords of slack in each segment
        let max_space = (num_segments * (space_per_segment - 5.0) * tau) as u64;

        (min_space.min(max_space.saturating_sub(1)), max_space)
    }

    /*************************************************************************
     * release                                                               *
     *************************************************************************/

    /// Releases every segment of the window: fence keys may have changed,
    /// so all waiters wake and re-route through the index.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if !self.state().can_continue {
            // absorbed: the other crawler owns the window now
            return;
        }

        let (start, end) = self.window();
        for segment_id in start..end {
            let segment = self.leaf.segment(segment_id);
            let mut queue = segment.queue();
            debug_assert!(queue.state == State::Rebal);
            debug_assert!(queue.num_active_threads == 0);

            queue.state = State::Free;
            queue.rebalancer = None;
            segment.mark_rebalanced();
            queue.wake_all();
            drop(queue);

            if self.invalidate_on_release {
                segment.latch().invalidate();
            }
        }
    }
}

impl Drop for Crawler<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
