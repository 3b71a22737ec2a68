// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The buffer pool, a mutex-guarded allocator of fixed-size page frames.
//!
//! Frames are anonymous memory maps, optionally backed by huge pages, leased
//! to the segment files one at a time. Physical backing grows on demand in
//! chunks of the minimum pool size; [`BufferPool::rebuild_free_list`]
//! coalesces trailing free frames and gives the memory back in the same
//! chunk granularity.

mod page;

pub(crate) use page::Page;

use crate::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct PoolState {
    /// Every frame ever created, indexed by page id; `None` while leased out.
    frames: Vec<Option<MmapMut>>,

    /// Available page ids. Recently reserved ids (below the threshold) are
    /// reused first, which keeps the tail of the pool free for shrinking.
    free_list: VecDeque<u64>,

    /// Ids below this value count as "recently reserved".
    threshold: u64,
}

pub(crate) struct BufferPool {
    state: Mutex<PoolState>,
    page_size: usize,
    min_num_pages: usize,
    max_num_pages: usize,
    huge_pages: bool,
}

impl BufferPool {
    pub fn new(
        page_size: usize,
        min_num_pages: usize,
        max_logical_memory: usize,
        huge_pages: bool,
    ) -> Result<Arc<Self>> {
        assert!(page_size % 8 == 0, "page size must be qword aligned");
        assert!(min_num_pages > 0);

        let pool = Arc::new(Self {
            state: Mutex::new(PoolState {
                frames: Vec::new(),
                free_list: VecDeque::new(),
                threshold: 0,
            }),
            page_size,
            min_num_pages,
            max_num_pages: (max_logical_memory / page_size).max(min_num_pages),
            huge_pages,
        });

        {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut state = pool.state.lock().expect("lock is poisoned");
            pool.extend(&mut state)?;
        }

        Ok(pool)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_frame(&self) -> Result<MmapMut> {
        let mut options = MmapOptions::new();
        options.len(self.page_size);
        if self.huge_pages {
            options.huge(None);
        }

        options.map_anon().map_err(|e| {
            log::error!("buffer pool cannot map a page frame: {e}");
            Error::LogicalError("buffer pool cannot map a page frame")
        })
    }

    /// Extends the physical backing by the minimum chunk size.
    fn extend(&self, state: &mut PoolState) -> Result<()> {
        if state.frames.len() >= self.max_num_pages {
            log::warn!(
                "buffer pool exhausted: {} pages of {} bytes",
                state.frames.len(),
                self.page_size
            );
            return Err(Error::LogicalError("buffer pool out of memory"));
        }

        let grow_by = self
            .min_num_pages
            .min(self.max_num_pages - state.frames.len());

        log::trace!("buffer pool extends by {grow_by} pages");

        for _ in 0..grow_by {
            let id = state.frames.len() as u64;
            state.frames.push(Some(self.map_frame()?));
            state.free_list.push_back(id);
        }

        Ok(())
    }

    /// Leases a page out of the pool, growing the backing when no frame is
    /// available.
    pub fn allocate_page(self: &Arc<Self>) -> Result<Page> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.state.lock().expect("lock is poisoned");

        if state.free_list.is_empty() {
            self.extend(&mut state)?;
        }

        #[expect(clippy::expect_used, reason = "extend() refilled the free list")]
        let id = state.free_list.pop_front().expect("free list is empty");

        #[expect(clippy::expect_used, reason = "free ids always hold a frame")]
        let map = state.frames[id as usize].take().expect("frame is leased out");

        Ok(Page {
            id,
            map: Some(map),
            pool: self.clone(),
        })
    }

    /// Returns a frame to the free list; invoked by [`Page::drop`].
    pub(super) fn release_frame(&self, id: u64, map: MmapMut) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.state.lock().expect("lock is poisoned");

        debug_assert!(state.frames[id as usize].is_none(), "page released twice");
        state.frames[id as usize] = Some(map);

        if id < state.threshold {
            state.free_list.push_front(id);
        } else {
            state.free_list.push_back(id);
        }
    }

    /// Coalesces trailing free frames and shrinks the backing, in multiples
    /// of the minimum pool size.
    pub fn rebuild_free_list(&self) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut state = self.state.lock().expect("lock is poisoned");

        state.free_list.make_contiguous().sort_unstable();

        let total_pages = state.frames.len();
        let mut num_removed = 0;
        let mut expected = total_pages as u64;
        for &id in state.free_list.iter().rev() {
            if id + 1 != expected || total_pages - num_removed <= self.min_num_pages {
                break;
            }
            expected = id;
            num_removed += 1;
        }

        // shrink only in whole chunks
        num_removed -= num_removed % self.min_num_pages;
        if num_removed == 0 {
            return;
        }

        let new_len = state.free_list.len() - num_removed;
        state.free_list.truncate(new_len);
        state.frames.truncate(total_pages - num_removed);
        state.threshold = (state.frames.len() - self.min_num_pages) as u64;

        log::debug!(
            "buffer pool shrunk by {num_removed} pages, {} remaining",
            state.frames.len()
        );
    }

    pub fn num_available_pages(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let state = self.state.lock().expect("lock is poisoned");
        state.free_list.len()
    }

    pub fn num_allocated_pages(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let state = self.state.lock().expect("lock is poisoned");
        state.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn pool() -> Arc<BufferPool> {
        BufferPool::new(4096, 4, 1 << 20, false).unwrap()
    }

    #[test]
    fn allocate_and_release() {
        let pool = pool();
        assert_eq!(4, pool.num_allocated_pages());
        assert_eq!(4, pool.num_available_pages());

        let page = pool.allocate_page().unwrap();
        assert_eq!(3, pool.num_available_pages());
        assert_eq!(512, page.num_qwords());

        drop(page);
        assert_eq!(4, pool.num_available_pages());
    }

    #[test]
    fn extends_on_demand() {
        let pool = pool();
        let pages = (0..6)
            .map(|_| pool.allocate_page().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(8, pool.num_allocated_pages());
        assert_eq!(2, pool.num_available_pages());
        drop(pages);
        assert_eq!(8, pool.num_available_pages());
    }

    #[test]
    fn respects_memory_cap() {
        let pool = BufferPool::new(4096, 2, 4 * 4096, false).unwrap();
        let _pages = (0..4)
            .map(|_| pool.allocate_page().unwrap())
            .collect::<Vec<_>>();

        assert!(pool.allocate_page().is_err());
    }

    #[test]
    fn rebuild_shrinks_trailing_frames() {
        let pool = pool();
        let pages = (0..8)
            .map(|_| pool.allocate_page().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(8, pool.num_allocated_pages());

        drop(pages);
        pool.rebuild_free_list();

        assert_eq!(4, pool.num_allocated_pages());
        assert_eq!(4, pool.num_available_pages());
    }

    #[test]
    fn page_qword_io() {
        let pool = pool();
        let mut page = pool.allocate_page().unwrap();

        page.write_qword(0, 42);
        page.write_qword(1, u64::MAX);
        assert_eq!(42, page.read_qword(0));
        assert_eq!(u64::MAX, page.read_qword(1));

        // gap-buffer style shift
        page.shift_qwords(0, 2, 2);
        assert_eq!(42, page.read_qword(2));
        assert_eq!(u64::MAX, page.read_qword(3));

        page.zero_qwords(2, 4);
        assert_eq!(0, page.read_qword(2));
    }
}
