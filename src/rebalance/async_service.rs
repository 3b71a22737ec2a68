// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The asynchronous rebalancer: writers observing a nearly-full segment
//! enqueue its fence key; a master thread holds each request for a short
//! delay (so bursts against the same segment coalesce) and hands the expired
//! ones to a pool of worker threads that verify the request is still
//! current and run the crawler.

use crate::gc::ScopedEpoch;
use crate::key::Key;
use crate::memstore::Memstore;
use crate::rebalance::{rebalance_segment, RebalanceNotNecessary};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use rustc_hash::FxHashSet;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

enum WorkItem {
    Segment(Key),
    Terminate,
}

/// A delayed request, ordered by deadline (earliest first).
struct Pending {
    deadline: Instant,
    key: Key,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline) // min-heap
    }
}

pub(crate) struct AsyncRebalancer {
    request_tx: Option<Sender<Key>>,
    master: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    memstore: Arc<Memstore>,
}

impl AsyncRebalancer {
    pub fn start(memstore: Arc<Memstore>, num_threads: usize, delay: Duration) -> Self {
        if num_threads == 0 {
            log::debug!("asynchronous rebalancer disabled");
            return Self {
                request_tx: None,
                master: None,
                workers: Vec::new(),
                memstore,
            };
        }

        let (request_tx, request_rx) = unbounded::<Key>();
        let (work_tx, work_rx) = bounded::<WorkItem>(1024);

        memstore.attach_rebalancer(request_tx.clone());

        let master = std::thread::Builder::new()
            .name("teseo-rebal-master".into())
            .spawn(move || Self::master_loop(&request_rx, &work_tx, delay, num_threads))
            .unwrap_or_else(|e| panic!("cannot spawn the rebalancer master: {e}"));

        let mut workers = Vec::with_capacity(num_threads);
        for worker_id in 0..num_threads {
            let work_rx = work_rx.clone();
            let memstore = memstore.clone();
            let handle = std::thread::Builder::new()
                .name(format!("teseo-rebal-{worker_id}"))
                .spawn(move || Self::worker_loop(&memstore, &work_rx))
                .unwrap_or_else(|e| panic!("cannot spawn a rebalancer worker: {e}"));
            workers.push(handle);
        }

        Self {
            request_tx: Some(request_tx),
            master: Some(master),
            workers,
            memstore,
        }
    }

    /// The timer: delays each request, deduplicating bursts, and forwards
    /// the expired ones to the workers.
    fn master_loop(
        request_rx: &Receiver<Key>,
        work_tx: &Sender<WorkItem>,
        delay: Duration,
        num_workers: usize,
    ) {
        log::debug!("rebalancer master started");
        let mut heap = BinaryHeap::<Pending>::new();
        let mut queued = FxHashSet::<Key>::default();

        loop {
            let timeout = heap
                .peek()
                .map_or(Duration::from_secs(3600), |pending| {
                    pending.deadline.saturating_duration_since(Instant::now())
                });

            match request_rx.recv_timeout(timeout) {
                Ok(key) => {
                    if queued.insert(key) {
                        heap.push(Pending {
                            deadline: Instant::now() + delay,
                            key,
                        });
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            while heap
                .peek()
                .is_some_and(|pending| pending.deadline <= Instant::now())
            {
                #[expect(clippy::expect_used, reason = "the heap is non-empty")]
                let pending = heap.pop().expect("heap is empty");
                queued.remove(&pending.key);
                if work_tx.send(WorkItem::Segment(pending.key)).is_err() {
                    return;
                }
            }
        }

        // shutdown: one sentinel per worker terminates its loop
        for _ in 0..num_workers {
            let _ = work_tx.send(WorkItem::Terminate);
        }
        log::debug!("rebalancer master stopped");
    }

    fn worker_loop(memstore: &Arc<Memstore>, work_rx: &Receiver<WorkItem>) {
        log::debug!("rebalancer worker started");
        while let Ok(WorkItem::Segment(key)) = work_rx.recv() {
            let _epoch = ScopedEpoch::new(&memstore.gc);
            match rebalance_segment(memstore, key) {
                Ok(()) => {}
                Err(RebalanceNotNecessary) => {
                    log::trace!("rebalance of {key:?} not necessary anymore");
                }
            }
        }
        log::debug!("rebalancer worker stopped");
    }

    pub fn stop(&mut self) {
        self.memstore.detach_rebalancer();
        // dropping the last sender disconnects the master, which in turn
        // terminates the workers
        self.request_tx = None;

        if let Some(master) = self.master.take() {
            let _ = master.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for AsyncRebalancer {
    fn drop(&mut self) {
        self.stop();
    }
}
