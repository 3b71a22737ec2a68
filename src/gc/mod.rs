// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Epoch-based deferred reclamation.
//!
//! Threads wrap every access to shared memstore structures in a
//! [`ScopedEpoch`]. Objects unlinked from those structures are [`mark`]ed
//! with a deleter; the collector frees a marked object only once every
//! thread's epoch has advanced past the object's marking timestamp, so no
//! thread can still be holding a reference obtained inside an older epoch.
//!
//! [`mark`]: GarbageCollector::mark

mod queue;

use crate::time::{Timestamp, TimestampCounter};
use queue::SimpleQueue;
use std::cell::RefCell;
use std::sync::{
    atomic::{
        AtomicU32, AtomicU64, AtomicUsize,
        Ordering::{Acquire, Relaxed, Release},
    },
    Arc, Mutex,
};
use std::time::Duration;

/// Sentinel epoch for a thread currently outside any [`ScopedEpoch`].
const EPOCH_NONE: u64 = u64::MAX;

/// A queued reclamation request.
struct Item {
    timestamp: Timestamp,
    deleter: Box<dyn FnOnce() + Send>,
}

impl Item {
    fn process(self) {
        (self.deleter)();
    }
}

/// Per-registered-thread garbage collection state.
struct ThreadState {
    /// Epoch the thread is currently in, `EPOCH_NONE` when outside.
    epoch: AtomicU64,

    /// Nesting depth of scoped epochs; only the outermost scope publishes.
    depth: AtomicU32,

    /// Items marked by the owning thread, not yet visible to the collector.
    local: Mutex<SimpleQueue<Item>>,

    /// Items the collector is allowed to drain.
    shared: Mutex<SimpleQueue<Item>>,
}

static NEXT_GC_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Thread states of this thread, one per live collector instance.
    static THREAD_STATES: RefCell<Vec<(usize, Arc<ThreadState>)>> = const { RefCell::new(Vec::new()) };
}

/// The garbage collector attached to an engine instance.
pub(crate) struct GarbageCollector {
    id: usize,
    clock: TimestampCounter,
    threads: Mutex<Vec<Arc<ThreadState>>>,
    queue_capacity: usize,
}

impl GarbageCollector {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            id: NEXT_GC_ID.fetch_add(1, Relaxed),
            clock: TimestampCounter::default(),
            threads: Mutex::new(Vec::new()),
            queue_capacity,
        }
    }

    /// Retrieves (or lazily registers) the calling thread's state.
    fn thread_state(&self) -> Arc<ThreadState> {
        THREAD_STATES.with(|states| {
            let mut states = states.borrow_mut();
            if let Some((_, state)) = states.iter().find(|(id, _)| *id == self.id) {
                return state.clone();
            }

            let state = Arc::new(ThreadState {
                epoch: AtomicU64::new(EPOCH_NONE),
                depth: AtomicU32::new(0),
                local: Mutex::new(SimpleQueue::with_capacity(self.queue_capacity)),
                shared: Mutex::new(SimpleQueue::with_capacity(self.queue_capacity)),
            });

            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            self.threads
                .lock()
                .expect("lock is poisoned")
                .push(state.clone());

            states.push((self.id, state.clone()));
            state
        })
    }

    /// Defers the given deleter until every thread currently inside an epoch
    /// has left it.
    pub fn mark(&self, deleter: Box<dyn FnOnce() + Send>) {
        let item = Item {
            timestamp: self.clock.next(),
            deleter,
        };

        let state = self.thread_state();

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut local = state.local.lock().expect("lock is poisoned");
        if local.is_full() {
            local.resize();
        }
        let pushed = local.push(item);
        debug_assert!(pushed, "item rejected after resize");
    }

    /// Publishes the calling thread's local items to its shared queue.
    fn flush_local(&self, state: &ThreadState) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut local = state.local.lock().expect("lock is poisoned");
        if local.is_empty() {
            return;
        }

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut shared = state.shared.lock().expect("lock is poisoned");
        while let Some(item) = local.pop() {
            if shared.is_full() {
                shared.resize();
            }
            let pushed = shared.push(item);
            debug_assert!(pushed, "item rejected after resize");
        }
    }

    /// The minimum epoch across all registered threads; items marked before
    /// it cannot be referenced by anyone anymore.
    pub fn min_epoch(&self) -> Timestamp {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let threads = self.threads.lock().expect("lock is poisoned");

        threads
            .iter()
            .map(|state| state.epoch.load(Acquire))
            .filter(|&epoch| epoch != EPOCH_NONE)
            .min()
            .unwrap_or_else(|| self.clock.get())
    }

    fn gc_pass(min_epoch: Timestamp, queue: &mut SimpleQueue<Item>) -> usize {
        let mut removed = 0;
        while queue
            .front()
            .is_some_and(|item| item.timestamp < min_epoch)
        {
            if let Some(item) = queue.pop() {
                item.process();
                removed += 1;
            }
        }
        removed
    }

    /// A single collection pass over every shared queue.
    pub fn execute(&self) -> usize {
        let min_epoch = self.min_epoch();
        log::trace!("GC pass, min epoch: {min_epoch}");

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let threads = self.threads.lock().expect("lock is poisoned");

        let mut removed = 0;
        for state in threads.iter() {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut shared = state.shared.lock().expect("lock is poisoned");
            removed += Self::gc_pass(min_epoch, &mut shared);
        }

        if removed > 0 {
            log::trace!("GC freed {removed} objects");
        }
        removed
    }

    /// Frees everything still queued, regardless of epochs. Only sound at
    /// engine shutdown, when no thread can be inside an epoch anymore.
    pub fn drain_all(&self) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let threads = self.threads.lock().expect("lock is poisoned");

        for state in threads.iter() {
            for queue in [&state.local, &state.shared] {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut queue = queue.lock().expect("lock is poisoned");
                while let Some(item) = queue.pop() {
                    item.process();
                }
            }
        }
    }
}

/// Scoped epoch acquisition: sets the calling thread's epoch to "now" on
/// entry and clears it on exit. Scopes nest; only the outermost publishes.
pub(crate) struct ScopedEpoch<'a> {
    gc: &'a GarbageCollector,
    state: Arc<ThreadState>,
}

impl<'a> ScopedEpoch<'a> {
    pub fn new(gc: &'a GarbageCollector) -> Self {
        let state = gc.thread_state();

        if state.depth.load(Relaxed) == 0 {
            state.epoch.store(gc.clock.next(), Release);
        }
        state.depth.fetch_add(1, Relaxed);

        Self { gc, state }
    }
}

impl Drop for ScopedEpoch<'_> {
    fn drop(&mut self) {
        let depth = self.state.depth.fetch_sub(1, Relaxed);
        debug_assert!(depth > 0, "unbalanced scoped epoch");

        if depth == 1 {
            self.state.epoch.store(EPOCH_NONE, Release);
            self.gc.flush_local(&self.state);
        }
    }
}

/// Handle of the background collector thread.
pub(crate) struct GcService {
    stop_tx: crossbeam_channel::Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl GcService {
    /// Spawns the collector loop, running a pass every `interval`.
    pub fn start(gc: Arc<GarbageCollector>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("teseo-gc".into())
            .spawn(move || {
                log::debug!("garbage collector started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            gc.execute();
                        }
                        _ => break,
                    }
                }
                log::debug!("garbage collector stopped");
            })
            .unwrap_or_else(|e| panic!("cannot spawn the garbage collector: {e}"));

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn gc_defers_while_epoch_active() {
        let gc = GarbageCollector::new(8);
        let freed = Arc::new(AtomicU32::new(0));

        let epoch = ScopedEpoch::new(&gc);

        let freed2 = freed.clone();
        gc.mark(Box::new(move || {
            freed2.fetch_add(1, Relaxed);
        }));

        // the marking thread itself is inside an epoch; nothing may be freed
        drop(epoch); // exits the epoch and flushes the local queue
        let epoch = ScopedEpoch::new(&gc);
        gc.execute();
        // the item was marked before this epoch started, so it frees now
        drop(epoch);

        assert_eq!(1, freed.load(Relaxed));
    }

    #[test]
    fn gc_respects_other_threads_epochs() {
        let gc = Arc::new(GarbageCollector::new(8));
        let freed = Arc::new(AtomicU32::new(0));

        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let gc2 = gc.clone();
        let holder = std::thread::spawn(move || {
            let _epoch = ScopedEpoch::new(&gc2);
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        entered_rx.recv().unwrap();

        let freed2 = freed.clone();
        gc.mark(Box::new(move || {
            freed2.fetch_add(1, Relaxed);
        }));
        gc.flush_local(&gc.thread_state());

        // the holder thread entered its epoch before the mark; the item must
        // survive this pass
        gc.execute();
        assert_eq!(0, freed.load(Relaxed));

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        gc.execute();
        assert_eq!(1, freed.load(Relaxed));
    }

    #[test]
    fn drain_all_ignores_epochs() {
        let gc = GarbageCollector::new(8);
        let freed = Arc::new(AtomicU32::new(0));

        let freed2 = freed.clone();
        gc.mark(Box::new(move || {
            freed2.fetch_add(1, Relaxed);
        }));

        gc.drain_all();
        assert_eq!(1, freed.load(Relaxed));
    }
}
