// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bp::BufferPool;
use crate::key::{Key, KEY_MAX};
use crate::memstore::segment::{File, Segment};
use crate::memstore::sparse_file::SparseFile;
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct LeafLatch {
    /// Whether a rebalancer or merger currently coordinates this leaf.
    active: bool,
    waiters: VecDeque<crossbeam_channel::Sender<()>>,
}

/// A fixed array of segments plus the leaf-level latch used for
/// inter-segment coordination. Leaves partition the key space through their
/// fence keys: the high fence of one leaf equals the low fence of the next.
pub(crate) struct Leaf {
    segments: Box<[Segment]>,
    lfkey: Mutex<Key>,
    hfkey: Mutex<Key>,
    latch: Mutex<LeafLatch>,
}

impl Leaf {
    /// Allocates a leaf with `num_segments` empty sparse segments, each
    /// backed by a page from the buffer pool.
    pub fn create(pool: &Arc<BufferPool>, num_segments: usize) -> Result<Arc<Self>> {
        let mut segments = Vec::with_capacity(num_segments);
        for _ in 0..num_segments {
            let page = pool.allocate_page()?;
            segments.push(Segment::new(File::Sparse(SparseFile::new(page))));
        }

        Ok(Arc::new(Self {
            segments: segments.into_boxed_slice(),
            lfkey: Mutex::new(KEY_MAX),
            hfkey: Mutex::new(KEY_MAX),
            latch: Mutex::new(LeafLatch {
                active: false,
                waiters: VecDeque::new(),
            }),
        }))
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, segment_id: usize) -> &Segment {
        &self.segments[segment_id]
    }

    pub fn lfkey(&self) -> Key {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        *self.lfkey.lock().expect("lock is poisoned")
    }

    pub fn set_lfkey(&self, key: Key) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.lfkey.lock().expect("lock is poisoned");
        *guard = key;
    }

    pub fn hfkey(&self) -> Key {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        *self.hfkey.lock().expect("lock is poisoned")
    }

    pub fn set_hfkey(&self, key: Key) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.hfkey.lock().expect("lock is poisoned");
        *guard = key;
    }

    /// Finds the segment responsible for the given key: the last segment
    /// whose low fence is not past it. Unused trailing segments carry
    /// `KEY_MAX` fences and are never selected.
    pub fn locate_segment(&self, key: Key) -> usize {
        let mut candidate = 0;
        for (segment_id, segment) in self.segments.iter().enumerate() {
            let fence = segment.fence_key();
            if fence == KEY_MAX || fence > key {
                break;
            }
            candidate = segment_id;
        }
        candidate
    }

    /// The high fence of a segment: the next used segment's low fence, or
    /// the leaf's high fence for the last used segment.
    pub fn segment_high_fence(&self, segment_id: usize) -> Key {
        for segment in &self.segments[segment_id + 1..] {
            let fence = segment.fence_key();
            if fence != KEY_MAX {
                return fence;
            }
        }
        self.hfkey()
    }

    /// Acquires the leaf latch, waiting while another rebalancer or merger
    /// holds it.
    pub fn lock_exclusive(&self) {
        loop {
            let waiter = {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let mut latch = self.latch.lock().expect("lock is poisoned");
                if !latch.active {
                    latch.active = true;
                    return;
                }
                let (tx, rx) = crossbeam_channel::bounded(1);
                latch.waiters.push_back(tx);
                rx
            };
            let _ = waiter.recv();
        }
    }

    pub fn unlock_exclusive(&self) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut latch = self.latch.lock().expect("lock is poisoned");
        debug_assert!(latch.active, "the leaf latch is not held");
        latch.active = false;
        if let Some(waiter) = latch.waiters.pop_front() {
            let _ = waiter.send(());
        }
    }

    /// Sum of the used space of every segment, in qwords.
    pub fn used_space(&self) -> u64 {
        use crate::memstore::segment::SegmentFile;
        self.segments
            .iter()
            .map(|segment| {
                #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
                let file = segment.file().read().expect("lock is poisoned");
                file.used_space()
            })
            .sum()
    }
}

impl std::fmt::Debug for Leaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Leaf {{ segments: {}, fences: [{:?}, {:?}) }}",
            self.segments.len(),
            self.lfkey(),
            self.hfkey()
        )
    }
}
