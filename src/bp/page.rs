// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::BufferPool;
use byteorder::{ByteOrder, NativeEndian};
use memmap2::MmapMut;
use std::sync::Arc;

/// A fixed-size page frame leased from a [`BufferPool`].
///
/// The frame is returned to its owning pool when the page is dropped. The
/// content is addressed in qwords (64-bit words), the allocation unit of the
/// segment files.
pub(crate) struct Page {
    pub(super) id: u64,
    pub(super) map: Option<MmapMut>,
    pub(super) pool: Arc<BufferPool>,
}

impl Page {
    fn data(&self) -> &[u8] {
        #[expect(clippy::expect_used, reason = "the frame is present until drop")]
        self.map.as_ref().expect("page frame missing")
    }

    fn data_mut(&mut self) -> &mut [u8] {
        #[expect(clippy::expect_used, reason = "the frame is present until drop")]
        self.map.as_mut().expect("page frame missing")
    }

    /// Page capacity, in qwords.
    pub fn num_qwords(&self) -> usize {
        self.data().len() / 8
    }

    pub fn read_qword(&self, index: usize) -> u64 {
        NativeEndian::read_u64(&self.data()[index * 8..index * 8 + 8])
    }

    pub fn write_qword(&mut self, index: usize, value: u64) {
        NativeEndian::write_u64(&mut self.data_mut()[index * 8..index * 8 + 8], value);
    }

    /// Shifts the qwords in `[start, end)` by `shift` positions (positive =
    /// towards higher offsets), as a gap-buffer move.
    pub fn shift_qwords(&mut self, start: usize, end: usize, shift: isize) {
        if start == end || shift == 0 {
            return;
        }

        let dest = (start * 8).checked_add_signed(shift * 8);
        #[expect(clippy::expect_used, reason = "boundaries validated by the segment file")]
        let dest = dest.expect("shift out of bounds");

        self.data_mut().copy_within(start * 8..end * 8, dest);
    }

    pub fn zero_qwords(&mut self, start: usize, end: usize) {
        self.data_mut()[start * 8..end * 8].fill(0);
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(map) = self.map.take() {
            self.pool.release_frame(self.id, map);
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page #{} ({} qwords)", self.id, self.num_qwords())
    }
}
