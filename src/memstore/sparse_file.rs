// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The sparse file: the default storage of a segment.
//!
//! One buffer-pool page, organised as two gap buffers around a pivot:
//!
//! ```text
//! [ LHS content → | LHS versions → | ... free ... | ← RHS versions | ← RHS content ]
//! 0          versions1_start   empty1_start   empty2_start   versions2_start     max
//! ```
//!
//! Content cells (2 qwords each) hold `Vertex` headers followed by their
//! `Edge` entries, sorted by key; all LHS keys are smaller than all RHS keys.
//! Version cells (1 qword each) shadow content cells through a back pointer
//! (the ordinal of the element within its side) and reference the head of
//! the element's undo chain through a slot in a side arena, since chain
//! heads are reference-counted and cannot live in raw page memory.

use crate::error::Error;
use crate::key::Key;
use crate::memstore::update::Update;
use crate::memstore::WriteError;
use crate::rebalance::scratchpad::{LoadedElement, LoadedVersion, ScratchEntry, ScratchPad};
use crate::bp::Page;
use crate::time::Timestamp;
use crate::transaction::{TransactionImpl, Undo, Visibility};
use slab::Slab;
use std::sync::Arc;

/// Saturation point of the per-version chain length clamp.
pub(crate) const MAX_UNDO_LENGTH: u8 = 7;

/// Qwords per content cell (vertex or edge).
pub(crate) const OFFSET_ELEMENT: u16 = 2;

/// Qwords per version cell.
pub(crate) const OFFSET_VERSION: u16 = 1;

const FLAG_FIRST: u64 = 1 << 63;
const FLAG_LOCK: u64 = 1 << 62;
const COUNT_MASK: u64 = FLAG_LOCK - 1;

const SLOT_BITS: u32 = 48;
const SLOT_NONE: u64 = (1 << SLOT_BITS) - 1;
const BACKPTR_BITS: u32 = 12;

/// A vertex content cell. `first` marks the authoritative record for the
/// vertex ID; a clear flag denotes a dummy grouping further edges of a
/// vertex whose record lives in an earlier segment or side.
#[derive(Copy, Clone, Debug)]
struct VertexCell {
    id: u64,
    first: bool,
    lock: bool,
    count: u64,
}

#[derive(Copy, Clone, Debug)]
struct EdgeCell {
    destination: u64,
    weight: f64,
}

/// A version cell: the head of an undo chain attached to a content element.
#[derive(Copy, Clone, Debug)]
struct VersionCell {
    /// `true` when the storage image is a logical removal.
    is_remove: bool,

    /// Chain length clamp, saturating at [`MAX_UNDO_LENGTH`].
    length: u8,

    /// Ordinal of the shadowed element within its side.
    backptr: u16,

    /// Key into the undo arena, [`SLOT_NONE`] when the chain is empty.
    slot: u64,
}

impl VersionCell {
    fn encode(&self) -> u64 {
        let mut word = self.slot & SLOT_NONE;
        word |= u64::from(self.backptr) << SLOT_BITS;
        word |= u64::from(self.length) << (SLOT_BITS + BACKPTR_BITS);
        if self.is_remove {
            word |= 1 << 63;
        }
        word
    }

    fn decode(word: u64) -> Self {
        Self {
            is_remove: word & (1 << 63) != 0,
            length: ((word >> (SLOT_BITS + BACKPTR_BITS)) & 0x7) as u8,
            backptr: ((word >> SLOT_BITS) & ((1 << BACKPTR_BITS) - 1)) as u16,
            slot: word & SLOT_NONE,
        }
    }
}

/// Result of a vertex lookup within one side.
enum VertexSearch {
    Found {
        v_offset: u16,
        ordinal: u16,
        vertex: VertexCell,
    },
    Insert {
        offset: u16,
        ordinal: u16,
    },
}

/// Result of an edge lookup within one side.
enum EdgeSearch {
    Found {
        v_offset: u16,
        vertex: VertexCell,
        e_offset: u16,
        ordinal: u16,
        edge: EdgeCell,
    },
    /// The source group exists, the edge does not; insert at `offset`.
    InsertInGroup {
        v_offset: u16,
        vertex: VertexCell,
        offset: u16,
        ordinal: u16,
    },
    /// No cell for the source in this side; a dummy would go at `offset`.
    NoGroup {
        offset: u16,
        ordinal: u16,
    },
}

/// What the local cells reveal about the reachability of an edge's source.
enum SourceEvidence {
    Visible,
    Removed,
    /// A remover holds the vertex; inserting would be a phantom write.
    Locked,
    Unknown,
}

pub(crate) struct SparseFile {
    page: Page,
    versions1_start: u16,
    empty1_start: u16,
    empty2_start: u16,
    versions2_start: u16,

    /// Arena of undo chain heads referenced by the version cells.
    undo_arena: Slab<Arc<Undo>>,
}

impl SparseFile {
    pub fn new(page: Page) -> Self {
        let max = (page.num_qwords()) as u16;
        Self {
            page,
            versions1_start: 0,
            empty1_start: 0,
            empty2_start: max,
            versions2_start: max,
            undo_arena: Slab::new(),
        }
    }

    pub fn max_num_qwords(&self) -> u16 {
        self.page.num_qwords() as u16
    }

    pub fn free_space(&self) -> u64 {
        u64::from(self.empty2_start - self.empty1_start)
    }

    pub fn used_space(&self) -> u64 {
        u64::from(self.max_num_qwords()) - self.free_space()
    }

    pub fn is_empty(&self) -> bool {
        self.used_space() == 0
    }

    pub fn is_lhs_empty(&self) -> bool {
        self.empty1_start == 0
    }

    pub fn is_rhs_empty(&self) -> bool {
        self.empty2_start == self.max_num_qwords()
    }

    /// Whether the side carries any version record.
    fn is_dirty(&self, is_lhs: bool) -> bool {
        if is_lhs {
            self.versions1_start < self.empty1_start
        } else {
            self.empty2_start < self.versions2_start
        }
    }

    /// Clears the file, releasing every version.
    pub fn reset(&mut self) {
        self.versions1_start = 0;
        self.empty1_start = 0;
        self.empty2_start = self.max_num_qwords();
        self.versions2_start = self.max_num_qwords();
        self.undo_arena.clear();
    }

    /// Total number of elements, dummy vertices included.
    pub fn cardinality(&self) -> u64 {
        let lhs = u64::from(self.versions1_start) / u64::from(OFFSET_ELEMENT);
        let rhs = u64::from(self.max_num_qwords() - self.versions2_start) / u64::from(OFFSET_ELEMENT);
        lhs + rhs
    }

    /*************************************************************************
     * cell codecs                                                           *
     *************************************************************************/

    fn content_range(&self, is_lhs: bool) -> (u16, u16) {
        if is_lhs {
            (0, self.versions1_start)
        } else {
            (self.versions2_start, self.max_num_qwords())
        }
    }

    fn versions_range(&self, is_lhs: bool) -> (u16, u16) {
        if is_lhs {
            (self.versions1_start, self.empty1_start)
        } else {
            (self.empty2_start, self.versions2_start)
        }
    }

    fn read_vertex(&self, offset: u16) -> VertexCell {
        let id = self.page.read_qword(offset as usize);
        let word = self.page.read_qword(offset as usize + 1);
        VertexCell {
            id,
            first: word & FLAG_FIRST != 0,
            lock: word & FLAG_LOCK != 0,
            count: word & COUNT_MASK,
        }
    }

    fn write_vertex(&mut self, offset: u16, vertex: VertexCell) {
        let mut word = vertex.count & COUNT_MASK;
        if vertex.first {
            word |= FLAG_FIRST;
        }
        if vertex.lock {
            word |= FLAG_LOCK;
        }
        self.page.write_qword(offset as usize, vertex.id);
        self.page.write_qword(offset as usize + 1, word);
    }

    fn read_edge(&self, offset: u16) -> EdgeCell {
        EdgeCell {
            destination: self.page.read_qword(offset as usize),
            weight: f64::from_bits(self.page.read_qword(offset as usize + 1)),
        }
    }

    fn write_edge(&mut self, offset: u16, edge: EdgeCell) {
        self.page.write_qword(offset as usize, edge.destination);
        self.page
            .write_qword(offset as usize + 1, edge.weight.to_bits());
    }

    fn read_version_at(&self, offset: u16) -> VersionCell {
        VersionCell::decode(self.page.read_qword(offset as usize))
    }

    fn write_version_at(&mut self, offset: u16, cell: VersionCell) {
        self.page.write_qword(offset as usize, cell.encode());
    }

    fn slot_undo(&self, slot: u64) -> Option<&Arc<Undo>> {
        if slot == SLOT_NONE {
            None
        } else {
            self.undo_arena.get(slot as usize)
        }
    }

    fn put_slot(&mut self, undo: Arc<Undo>) -> u64 {
        let slot = self.undo_arena.insert(undo) as u64;
        assert!(slot < SLOT_NONE, "undo arena overflow");
        slot
    }

    fn take_slot(&mut self, slot: u64) -> Option<Arc<Undo>> {
        if slot == SLOT_NONE {
            None
        } else {
            self.undo_arena.try_remove(slot as usize)
        }
    }

    /*************************************************************************
     * searches                                                              *
     *************************************************************************/

    /// The minimum key of one side.
    fn side_min_key(&self, is_lhs: bool) -> Option<Key> {
        let (c_start, c_end) = self.content_range(is_lhs);
        if c_start == c_end {
            return None;
        }

        let vertex = self.read_vertex(c_start);
        if vertex.first {
            Some(Key::vertex(vertex.id))
        } else {
            debug_assert!(vertex.count > 0, "empty dummy vertex");
            let edge = self.read_edge(c_start + OFFSET_ELEMENT);
            Some(Key::new(vertex.id, edge.destination))
        }
    }

    /// The minimum key of the whole file.
    pub fn get_minimum(&self) -> Option<Key> {
        self.side_min_key(true).or_else(|| self.side_min_key(false))
    }

    /// The pivot: the minimum of the RHS.
    fn get_pivot(&self) -> Option<Key> {
        self.side_min_key(false)
    }

    /// Which side is responsible for the given key.
    fn side_for(&self, key: Key) -> bool {
        match self.get_pivot() {
            None => true,
            Some(pivot) => key < pivot,
        }
    }

    fn find_vertex(&self, is_lhs: bool, vertex_id: u64) -> VertexSearch {
        let (c_start, c_end) = self.content_range(is_lhs);
        let mut pos = c_start;
        let mut ordinal: u16 = 0;

        while pos < c_end {
            let vertex = self.read_vertex(pos);
            if vertex.id == vertex_id {
                return VertexSearch::Found {
                    v_offset: pos,
                    ordinal,
                    vertex,
                };
            }
            if vertex.id > vertex_id {
                return VertexSearch::Insert {
                    offset: pos,
                    ordinal,
                };
            }
            let cells = 1 + vertex.count as u16;
            pos += cells * OFFSET_ELEMENT;
            ordinal += cells;
        }

        VertexSearch::Insert {
            offset: c_end,
            ordinal,
        }
    }

    fn find_edge(&self, is_lhs: bool, key: Key) -> EdgeSearch {
        let (c_start, c_end) = self.content_range(is_lhs);
        let mut pos = c_start;
        let mut ordinal: u16 = 0;

        while pos < c_end {
            let vertex = self.read_vertex(pos);
            if vertex.id > key.source() {
                return EdgeSearch::NoGroup {
                    offset: pos,
                    ordinal,
                };
            }

            if vertex.id == key.source() {
                let v_offset = pos;
                let mut e_pos = pos + OFFSET_ELEMENT;
                let mut e_ordinal = ordinal + 1;
                for _ in 0..vertex.count {
                    let edge = self.read_edge(e_pos);
                    if edge.destination == key.destination() {
                        return EdgeSearch::Found {
                            v_offset,
                            vertex,
                            e_offset: e_pos,
                            ordinal: e_ordinal,
                            edge,
                        };
                    }
                    if edge.destination > key.destination() {
                        return EdgeSearch::InsertInGroup {
                            v_offset,
                            vertex,
                            offset: e_pos,
                            ordinal: e_ordinal,
                        };
                    }
                    e_pos += OFFSET_ELEMENT;
                    e_ordinal += 1;
                }
                return EdgeSearch::InsertInGroup {
                    v_offset,
                    vertex,
                    offset: e_pos,
                    ordinal: e_ordinal,
                };
            }

            let cells = 1 + vertex.count as u16;
            pos += cells * OFFSET_ELEMENT;
            ordinal += cells;
        }

        EdgeSearch::NoGroup {
            offset: c_end,
            ordinal,
        }
    }

    /// Locates the version cell shadowing the given ordinal, if any.
    fn find_version(&self, is_lhs: bool, ordinal: u16) -> Option<(u16, VersionCell)> {
        let (v_start, v_end) = self.versions_range(is_lhs);
        let mut pos = v_start;
        while pos < v_end {
            let cell = self.read_version_at(pos);
            if cell.backptr == ordinal {
                return Some((pos, cell));
            }
            if cell.backptr > ordinal {
                return None;
            }
            pos += OFFSET_VERSION;
        }
        None
    }

    /*************************************************************************
     * gap-buffer moves                                                      *
     *************************************************************************/

    /// Opens a content gap of `qwords` at `offset`; returns the gap offset.
    fn insert_content_gap(&mut self, is_lhs: bool, offset: u16, qwords: u16) -> u16 {
        debug_assert!(self.free_space() >= u64::from(qwords));
        if is_lhs {
            self.page
                .shift_qwords(offset as usize, self.empty1_start as usize, qwords as isize);
            self.versions1_start += qwords;
            self.empty1_start += qwords;
            offset
        } else {
            self.page.shift_qwords(
                self.empty2_start as usize,
                offset as usize,
                -(qwords as isize),
            );
            self.empty2_start -= qwords;
            self.versions2_start -= qwords;
            offset - qwords
        }
    }

    /// Removes the content cells in `[offset, offset + qwords)`.
    fn remove_content_gap(&mut self, is_lhs: bool, offset: u16, qwords: u16) {
        if is_lhs {
            self.page.shift_qwords(
                (offset + qwords) as usize,
                self.empty1_start as usize,
                -(qwords as isize),
            );
            self.versions1_start -= qwords;
            self.empty1_start -= qwords;
        } else {
            self.page
                .shift_qwords(self.empty2_start as usize, offset as usize, qwords as isize);
            self.empty2_start += qwords;
            self.versions2_start += qwords;
        }
    }

    /// Inserts a version cell in back-pointer order.
    fn insert_version_cell(&mut self, is_lhs: bool, cell: VersionCell) {
        debug_assert!(self.free_space() >= u64::from(OFFSET_VERSION));
        let (v_start, v_end) = self.versions_range(is_lhs);

        let mut pos = v_start;
        while pos < v_end && self.read_version_at(pos).backptr < cell.backptr {
            pos += OFFSET_VERSION;
        }

        if is_lhs {
            self.page
                .shift_qwords(pos as usize, self.empty1_start as usize, OFFSET_VERSION as isize);
            self.empty1_start += OFFSET_VERSION;
            self.write_version_at(pos, cell);
        } else {
            self.page.shift_qwords(
                self.empty2_start as usize,
                pos as usize,
                -(OFFSET_VERSION as isize),
            );
            self.empty2_start -= OFFSET_VERSION;
            self.write_version_at(pos - OFFSET_VERSION, cell);
        }
    }

    /// Removes the version cell at `v_offset`, freeing its undo slot.
    fn remove_version_cell(&mut self, is_lhs: bool, v_offset: u16) {
        let cell = self.read_version_at(v_offset);
        drop(self.take_slot(cell.slot));

        if is_lhs {
            self.page.shift_qwords(
                (v_offset + OFFSET_VERSION) as usize,
                self.empty1_start as usize,
                -(OFFSET_VERSION as isize),
            );
            self.empty1_start -= OFFSET_VERSION;
        } else {
            self.page.shift_qwords(
                self.empty2_start as usize,
                v_offset as usize,
                OFFSET_VERSION as isize,
            );
            self.empty2_start += OFFSET_VERSION;
        }
    }

    /// Adjusts the back pointers of every version at ordinal >= `from`.
    fn shift_backptrs(&mut self, is_lhs: bool, from: u16, delta: i32) {
        let (v_start, v_end) = self.versions_range(is_lhs);
        let mut pos = v_start;
        while pos < v_end {
            let mut cell = self.read_version_at(pos);
            if cell.backptr >= from {
                cell.backptr = (i32::from(cell.backptr) + delta) as u16;
                self.write_version_at(pos, cell);
            }
            pos += OFFSET_VERSION;
        }
    }

    /*************************************************************************
     * visibility                                                            *
     *************************************************************************/

    /// Resolves the image of an element as seen by the transaction, merging
    /// the storage cell with its version. `None` means invisible.
    fn resolve(
        &self,
        tx: &TransactionImpl,
        version: Option<VersionCell>,
        mut storage: Update,
    ) -> Option<Update> {
        let image = match version {
            None => storage,
            Some(cell) => {
                if cell.is_remove {
                    storage.flip();
                }
                match self.slot_undo(cell.slot) {
                    None => storage,
                    Some(head) => match tx.can_read(head) {
                        Visibility::Storage => storage,
                        Visibility::Payload(payload) => payload,
                    },
                }
            }
        };
        image.is_insert().then_some(image)
    }

    fn vertex_image(&self, tx: &TransactionImpl, is_lhs: bool, ordinal: u16, vertex: &VertexCell) -> Option<Update> {
        let version = self.find_version(is_lhs, ordinal).map(|(_, cell)| cell);
        self.resolve(tx, version, Update::vertex(true, vertex.id))
    }

    fn edge_image(
        &self,
        tx: &TransactionImpl,
        is_lhs: bool,
        ordinal: u16,
        source: u64,
        edge: &EdgeCell,
    ) -> Option<Update> {
        let version = self.find_version(is_lhs, ordinal).map(|(_, cell)| cell);
        self.resolve(
            tx,
            version,
            Update::edge(true, Key::new(source, edge.destination), edge.weight),
        )
    }

    /// What the cells of this file reveal about the source vertex of an
    /// edge insertion, when the caller has not verified it yet.
    fn source_evidence(&self, tx: &TransactionImpl, source: u64) -> SourceEvidence {
        for is_lhs in [true, false] {
            if let VertexSearch::Found {
                ordinal, vertex, ..
            } = self.find_vertex(is_lhs, source)
            {
                if vertex.lock {
                    return SourceEvidence::Locked;
                }

                if vertex.first {
                    return match self.vertex_image(tx, is_lhs, ordinal, &vertex) {
                        Some(_) => SourceEvidence::Visible,
                        None => SourceEvidence::Removed,
                    };
                }

                // a dummy: any visible edge proves the source is reachable
                let (_, c_end) = self.content_range(is_lhs);
                let mut e_pos = self.offset_of(is_lhs, ordinal) + OFFSET_ELEMENT;
                let mut e_ordinal = ordinal + 1;
                for _ in 0..vertex.count {
                    debug_assert!(e_pos < c_end);
                    let edge = self.read_edge(e_pos);
                    if self.edge_image(tx, is_lhs, e_ordinal, source, &edge).is_some() {
                        return SourceEvidence::Visible;
                    }
                    e_pos += OFFSET_ELEMENT;
                    e_ordinal += 1;
                }
                return SourceEvidence::Unknown;
            }
        }
        SourceEvidence::Unknown
    }

    fn offset_of(&self, is_lhs: bool, ordinal: u16) -> u16 {
        let (c_start, _) = self.content_range(is_lhs);
        c_start + ordinal * OFFSET_ELEMENT
    }

    /*************************************************************************
     * update                                                                *
     *************************************************************************/

    /// Attempts to apply the update. `Ok(false)` means the file has not
    /// enough free space and the caller must upgrade to a dense file or
    /// trigger a rebalance.
    pub fn update(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        has_source_vertex: bool,
    ) -> Result<bool, WriteError> {
        let is_lhs = self.side_for(update.key());
        if update.is_vertex() {
            self.update_vertex(tx, update, is_lhs).map_err(WriteError::User)
        } else {
            self.update_edge(tx, update, is_lhs, has_source_vertex)
        }
    }

    fn update_vertex(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        is_lhs: bool,
    ) -> Result<bool, Error> {
        let vertex_id = update.source();

        match self.find_vertex(is_lhs, vertex_id) {
            VertexSearch::Found {
                v_offset: _,
                ordinal,
                vertex,
            } => {
                debug_assert!(vertex.first, "the fence keys route vertex updates to the authoritative record");

                let existing = self.find_version(is_lhs, ordinal);
                if let Some((_, cell)) = existing {
                    if let Some(head) = self.slot_undo(cell.slot) {
                        if !tx.can_write(head) {
                            return Err(Error::VertexLocked(vertex_id));
                        }
                    }
                }
                if vertex.lock {
                    return Err(Error::VertexLocked(vertex_id));
                }

                let currently_present = existing.is_none_or(|(_, cell)| !cell.is_remove);
                if update.is_insert() && currently_present {
                    return Err(Error::VertexAlreadyExists(vertex_id));
                }
                if update.is_remove() && !currently_present {
                    return Err(Error::VertexDoesNotExist(vertex_id));
                }

                if existing.is_none() && self.free_space() < u64::from(OFFSET_VERSION) {
                    return Ok(false);
                }

                let undo = tx.add_undo(update.flipped());
                match existing {
                    Some((v_pos, mut cell)) => {
                        undo.set_next(self.take_slot(cell.slot));
                        cell.slot = self.put_slot(undo);
                        cell.is_remove = update.is_remove();
                        cell.length = (cell.length + 1).min(MAX_UNDO_LENGTH);
                        self.write_version_at(v_pos, cell);
                        self.prune_version_on_write(tx, v_pos);
                    }
                    None => {
                        let slot = self.put_slot(undo);
                        self.insert_version_cell(
                            is_lhs,
                            VersionCell {
                                is_remove: update.is_remove(),
                                length: 1,
                                backptr: ordinal,
                                slot,
                            },
                        );
                    }
                }
                Ok(true)
            }
            VertexSearch::Insert { offset, ordinal } => {
                if update.is_remove() {
                    return Err(Error::VertexDoesNotExist(vertex_id));
                }
                if self.free_space() < u64::from(OFFSET_ELEMENT + OFFSET_VERSION) {
                    return Ok(false);
                }

                let gap = self.insert_content_gap(is_lhs, offset, OFFSET_ELEMENT);
                self.write_vertex(
                    gap,
                    VertexCell {
                        id: vertex_id,
                        first: true,
                        lock: false,
                        count: 0,
                    },
                );
                self.shift_backptrs(is_lhs, ordinal, 1);

                let undo = tx.add_undo(update.flipped());
                let slot = self.put_slot(undo);
                self.insert_version_cell(
                    is_lhs,
                    VersionCell {
                        is_remove: false,
                        length: 1,
                        backptr: ordinal,
                        slot,
                    },
                );
                Ok(true)
            }
        }
    }

    fn update_edge(
        &mut self,
        tx: &Arc<TransactionImpl>,
        update: &Update,
        is_lhs: bool,
        has_source_vertex: bool,
    ) -> Result<bool, WriteError> {
        let key = update.key();
        let source = key.source();

        match self.find_edge(is_lhs, key) {
            EdgeSearch::Found {
                vertex,
                e_offset,
                ordinal,
                ..
            } => {
                if vertex.lock && update.is_insert() {
                    return Err(Error::VertexPhantomWrite(source).into());
                }

                let existing = self.find_version(is_lhs, ordinal);
                if let Some((_, cell)) = existing {
                    if let Some(head) = self.slot_undo(cell.slot) {
                        if !tx.can_write(head) {
                            return Err(Error::EdgeLocked(source, key.destination()).into());
                        }
                    }
                }

                let currently_present = existing.is_none_or(|(_, cell)| !cell.is_remove);
                if update.is_insert() && currently_present {
                    return Err(Error::EdgeAlreadyExists(source, key.destination()).into());
                }
                if update.is_remove() && !currently_present {
                    return Err(Error::EdgeDoesNotExist(source, key.destination()).into());
                }

                if existing.is_none() && self.free_space() < u64::from(OFFSET_VERSION) {
                    return Ok(false);
                }

                // prior image: re-insertion restores the stored weight
                let prior = if update.is_insert() {
                    Update::edge(false, key, 0.0)
                } else {
                    let stored = self.read_edge(e_offset);
                    Update::edge(true, key, stored.weight)
                };

                let undo = tx.add_undo(prior);
                match existing {
                    Some((v_pos, mut cell)) => {
                        undo.set_next(self.take_slot(cell.slot));
                        cell.slot = self.put_slot(undo);
                        cell.is_remove = update.is_remove();
                        cell.length = (cell.length + 1).min(MAX_UNDO_LENGTH);
                        self.write_version_at(v_pos, cell);
                        self.prune_version_on_write(tx, v_pos);
                    }
                    None => {
                        let slot = self.put_slot(undo);
                        self.insert_version_cell(
                            is_lhs,
                            VersionCell {
                                is_remove: update.is_remove(),
                                length: 1,
                                backptr: ordinal,
                                slot,
                            },
                        );
                    }
                }

                if update.is_insert() {
                    self.write_edge(
                        e_offset,
                        EdgeCell {
                            destination: key.destination(),
                            weight: update.weight(),
                        },
                    );
                }
                Ok(true)
            }
            EdgeSearch::InsertInGroup {
                v_offset,
                vertex,
                offset,
                ordinal,
            } => {
                if update.is_remove() {
                    return Err(Error::EdgeDoesNotExist(source, key.destination()).into());
                }
                if vertex.lock {
                    return Err(Error::VertexPhantomWrite(source).into());
                }
                if !has_source_vertex {
                    match self.source_evidence(tx, source) {
                        SourceEvidence::Visible => {}
                        SourceEvidence::Removed => {
                            return Err(Error::VertexDoesNotExist(source).into());
                        }
                        SourceEvidence::Locked => {
                            return Err(Error::VertexPhantomWrite(source).into());
                        }
                        SourceEvidence::Unknown => {
                            return Err(WriteError::NotSureIfItHasSourceVertex);
                        }
                    }
                }
                if self.free_space() < u64::from(OFFSET_ELEMENT + OFFSET_VERSION) {
                    return Ok(false);
                }

                let mut vertex = vertex;
                vertex.count += 1;
                self.write_vertex(v_offset, vertex);

                let gap = self.insert_content_gap(is_lhs, offset, OFFSET_ELEMENT);
                self.write_edge(
                    gap,
                    EdgeCell {
                        destination: key.destination(),
                        weight: update.weight(),
                    },
                );
                self.shift_backptrs(is_lhs, ordinal, 1);

                let undo = tx.add_undo(Update::edge(false, key, 0.0));
                let slot = self.put_slot(undo);
                self.insert_version_cell(
                    is_lhs,
                    VersionCell {
                        is_remove: false,
                        length: 1,
                        backptr: ordinal,
                        slot,
                    },
                );
                Ok(true)
            }
            EdgeSearch::NoGroup { offset, ordinal } => {
                if update.is_remove() {
                    return Err(Error::EdgeDoesNotExist(source, key.destination()).into());
                }
                if !has_source_vertex {
                    let (c_start, _) = self.content_range(is_lhs);
                    let at_file_min = offset == c_start && (is_lhs || self.is_lhs_empty());

                    match self.source_evidence(tx, source) {
                        SourceEvidence::Visible => {}
                        SourceEvidence::Removed => {
                            return Err(Error::VertexDoesNotExist(source).into());
                        }
                        SourceEvidence::Locked => {
                            return Err(Error::VertexPhantomWrite(source).into());
                        }
                        SourceEvidence::Unknown if at_file_min => {
                            // the source may live in a preceding segment
                            return Err(WriteError::NotSureIfItHasSourceVertex);
                        }
                        SourceEvidence::Unknown => {
                            // the vertex record would sort locally, yet no
                            // cell exists: the vertex does not exist
                            return Err(Error::VertexDoesNotExist(source).into());
                        }
                    }
                }
                if self.free_space() < u64::from(2 * OFFSET_ELEMENT + OFFSET_VERSION) {
                    return Ok(false);
                }

                // a dummy vertex groups the edge, the authoritative record
                // lives elsewhere
                let gap = self.insert_content_gap(is_lhs, offset, 2 * OFFSET_ELEMENT);
                self.write_vertex(
                    gap,
                    VertexCell {
                        id: source,
                        first: false,
                        lock: false,
                        count: 1,
                    },
                );
                self.write_edge(
                    gap + OFFSET_ELEMENT,
                    EdgeCell {
                        destination: key.destination(),
                        weight: update.weight(),
                    },
                );
                self.shift_backptrs(is_lhs, ordinal, 2);

                let undo = tx.add_undo(Update::edge(false, key, 0.0));
                let slot = self.put_slot(undo);
                self.insert_version_cell(
                    is_lhs,
                    VersionCell {
                        is_remove: false,
                        length: 1,
                        backptr: ordinal + 1,
                        slot,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Prunes the chain behind the version at `v_pos` when the length clamp
    /// saturated.
    fn prune_version_on_write(&mut self, tx: &TransactionImpl, v_pos: u16) {
        let mut cell = self.read_version_at(v_pos);
        if cell.length < MAX_UNDO_LENGTH {
            return;
        }

        let Some(head) = self.slot_undo(cell.slot).cloned() else {
            return;
        };

        if let Some((_, length)) = Undo::prune(&head, tx.high_water_mark()) {
            cell.length = length.min(MAX_UNDO_LENGTH);
            self.write_version_at(v_pos, cell);
        }
    }

    /*************************************************************************
     * rollback                                                              *
     *************************************************************************/

    /// Restores the prior image carried by a rolled-back undo record.
    pub fn rollback(&mut self, update: &Update, next: Option<Arc<Undo>>) {
        let is_lhs = self.side_for(update.key());

        if update.is_vertex() {
            let VertexSearch::Found {
                v_offset,
                ordinal,
                vertex,
            } = self.find_vertex(is_lhs, update.source())
            else {
                debug_assert!(false, "rolling back a vertex that is not stored");
                return;
            };

            match next {
                Some(next_head) => {
                    self.replace_version_head(is_lhs, ordinal, update, next_head);
                }
                None => {
                    let Some((v_pos, _)) = self.find_version(is_lhs, ordinal) else {
                        debug_assert!(false, "rollback without a version record");
                        return;
                    };
                    self.remove_version_cell(is_lhs, v_pos);

                    if update.is_remove() {
                        // the insertion is being rolled back: the cell goes
                        debug_assert!(vertex.count == 0, "edges must be rolled back first");
                        self.remove_content_gap(is_lhs, v_offset, OFFSET_ELEMENT);
                        self.shift_backptrs(is_lhs, ordinal + 1, -1);
                    }
                }
            }
        } else {
            let EdgeSearch::Found {
                v_offset,
                vertex,
                e_offset,
                ordinal,
                ..
            } = self.find_edge(is_lhs, update.key())
            else {
                debug_assert!(false, "rolling back an edge that is not stored");
                return;
            };

            match next {
                Some(next_head) => {
                    self.replace_version_head(is_lhs, ordinal, update, next_head);
                    if update.is_insert() {
                        // restore the previous weight
                        self.write_edge(
                            e_offset,
                            EdgeCell {
                                destination: update.destination(),
                                weight: update.weight(),
                            },
                        );
                    }
                }
                None => {
                    let Some((v_pos, _)) = self.find_version(is_lhs, ordinal) else {
                        debug_assert!(false, "rollback without a version record");
                        return;
                    };
                    self.remove_version_cell(is_lhs, v_pos);

                    if update.is_remove() {
                        // the insertion is being rolled back
                        self.remove_content_gap(is_lhs, e_offset, OFFSET_ELEMENT);
                        self.shift_backptrs(is_lhs, ordinal + 1, -1);

                        // on the RHS the removal shifted the group header
                        let v_offset = if is_lhs { v_offset } else { v_offset + OFFSET_ELEMENT };

                        let mut vertex = vertex;
                        vertex.count -= 1;
                        if !vertex.first && vertex.count == 0 {
                            // the dummy grouped only this edge
                            self.remove_content_gap(is_lhs, v_offset, OFFSET_ELEMENT);
                            self.shift_backptrs(is_lhs, ordinal - 1, -1);
                        } else {
                            self.write_vertex(v_offset, vertex);
                        }
                    } else {
                        // the removal is being rolled back: restore the weight
                        self.write_edge(
                            e_offset,
                            EdgeCell {
                                destination: update.destination(),
                                weight: update.weight(),
                            },
                        );
                    }
                }
            }
        }
    }

    fn replace_version_head(
        &mut self,
        is_lhs: bool,
        ordinal: u16,
        restored: &Update,
        next_head: Arc<Undo>,
    ) {
        let Some((v_pos, mut cell)) = self.find_version(is_lhs, ordinal) else {
            debug_assert!(false, "rollback without a version record");
            return;
        };

        drop(self.take_slot(cell.slot));
        cell.slot = self.put_slot(next_head);
        cell.is_remove = restored.is_remove();
        if cell.length < MAX_UNDO_LENGTH {
            cell.length = cell.length.saturating_sub(1).max(1);
        }
        self.write_version_at(v_pos, cell);
    }

    /*************************************************************************
     * point lookups                                                         *
     *************************************************************************/

    /// Whether the given key exists and is visible. With `is_unlocked`, the
    /// key must be a vertex not currently held by a remover.
    pub fn has_item(&self, tx: &TransactionImpl, key: Key, is_unlocked: bool) -> Result<bool, Error> {
        let is_lhs = self.side_for(key);

        if key.is_vertex() {
            let VertexSearch::Found {
                ordinal, vertex, ..
            } = self.find_vertex(is_lhs, key.source())
            else {
                return Ok(false);
            };
            debug_assert!(vertex.first);

            if is_unlocked && vertex.lock {
                return Err(Error::VertexPhantomWrite(key.source()));
            }

            Ok(self.vertex_image(tx, is_lhs, ordinal, &vertex).is_some())
        } else {
            let EdgeSearch::Found { ordinal, edge, .. } = self.find_edge(is_lhs, key) else {
                return Ok(false);
            };
            Ok(self
                .edge_image(tx, is_lhs, ordinal, key.source(), &edge)
                .is_some())
        }
    }

    /// The weight of the given edge, when visible.
    pub fn get_weight(&self, tx: &TransactionImpl, key: Key) -> Result<f64, Error> {
        let is_lhs = self.side_for(key);
        let EdgeSearch::Found { ordinal, edge, .. } = self.find_edge(is_lhs, key) else {
            return Err(Error::EdgeDoesNotExist(key.source(), key.destination()));
        };

        self.edge_image(tx, is_lhs, ordinal, key.source(), &edge)
            .map(|image| image.weight())
            .ok_or(Error::EdgeDoesNotExist(key.source(), key.destination()))
    }

    /// The number of visible outgoing edges of the vertex in this file.
    pub fn get_degree(&self, tx: &TransactionImpl, vertex_id: u64) -> u64 {
        let mut degree = 0;

        for is_lhs in [true, false] {
            let VertexSearch::Found {
                v_offset,
                ordinal,
                vertex,
            } = self.find_vertex(is_lhs, vertex_id)
            else {
                continue;
            };

            if !self.is_dirty(is_lhs) {
                // no versions in this side: every stored edge is visible
                degree += vertex.count;
                continue;
            }

            let mut e_pos = v_offset + OFFSET_ELEMENT;
            let mut e_ordinal = ordinal + 1;
            for _ in 0..vertex.count {
                let edge = self.read_edge(e_pos);
                if self
                    .edge_image(tx, is_lhs, e_ordinal, vertex_id, &edge)
                    .is_some()
                {
                    degree += 1;
                }
                e_pos += OFFSET_ELEMENT;
                e_ordinal += 1;
            }
        }

        degree
    }

    /*************************************************************************
     * scan                                                                  *
     *************************************************************************/

    /// Invokes the callback for every visible element with key >= `from`, in
    /// key order. Vertices are reported as `(id, 0, 0.0)`. Returns `false`
    /// when the callback requested a stop, `true` when the file is exhausted
    /// and the caller should advance to the next segment.
    pub fn scan(
        &self,
        tx: &TransactionImpl,
        from: Key,
        callback: &mut dyn FnMut(u64, u64, f64) -> bool,
    ) -> bool {
        for is_lhs in [true, false] {
            let (c_start, c_end) = self.content_range(is_lhs);
            let mut pos = c_start;
            let mut ordinal: u16 = 0;

            while pos < c_end {
                let vertex = self.read_vertex(pos);

                if vertex.first
                    && Key::vertex(vertex.id) >= from
                    && self.vertex_image(tx, is_lhs, ordinal, &vertex).is_some()
                    && !callback(vertex.id, 0, 0.0)
                {
                    return false;
                }
                pos += OFFSET_ELEMENT;
                ordinal += 1;

                for _ in 0..vertex.count {
                    let edge = self.read_edge(pos);
                    if Key::new(vertex.id, edge.destination) >= from {
                        if let Some(image) =
                            self.edge_image(tx, is_lhs, ordinal, vertex.id, &edge)
                        {
                            if !callback(vertex.id, edge.destination, image.weight()) {
                                return false;
                            }
                        }
                    }
                    pos += OFFSET_ELEMENT;
                    ordinal += 1;
                }
            }
        }

        true
    }

    /*************************************************************************
     * remove vertex                                                         *
     *************************************************************************/

    /// Appends removal versions for the vertex and every attached visible
    /// edge, locking the group against phantom insertions. Returns
    /// `Ok(false)` when the file ran out of space.
    pub fn remove_vertex(
        &mut self,
        tx: &Arc<TransactionImpl>,
        instance: &mut crate::memstore::remove_vertex::RemoveVertex,
    ) -> Result<bool, Error> {
        for is_lhs in [true, false] {
            if !self.do_remove_vertex(tx, instance, is_lhs)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn do_remove_vertex(
        &mut self,
        tx: &Arc<TransactionImpl>,
        instance: &mut crate::memstore::remove_vertex::RemoveVertex,
        is_lhs: bool,
    ) -> Result<bool, Error> {
        let vertex_id = instance.vertex_id();

        let VertexSearch::Found {
            v_offset,
            ordinal,
            vertex,
        } = self.find_vertex(is_lhs, vertex_id)
        else {
            return Ok(true);
        };

        // conflict checks first, before any mutation
        if vertex.first {
            if vertex.lock {
                return Err(Error::VertexLocked(vertex_id));
            }
            let existing = self.find_version(is_lhs, ordinal);
            if let Some((_, cell)) = existing {
                if let Some(head) = self.slot_undo(cell.slot) {
                    if !tx.can_write(head) {
                        return Err(Error::VertexLocked(vertex_id));
                    }
                }
            }
            if self.vertex_image(tx, is_lhs, ordinal, &vertex).is_none() {
                return Err(Error::VertexDoesNotExist(vertex_id));
            }
        }

        struct EdgeRemoval {
            ordinal: u16,
            destination: u64,
            weight: f64,
            has_version: bool,
        }

        let mut removals = Vec::new();
        let mut space_needed: u64 = 0;

        let mut e_pos = v_offset + OFFSET_ELEMENT;
        let mut e_ordinal = ordinal + 1;
        for _ in 0..vertex.count {
            let edge = self.read_edge(e_pos);
            let existing = self.find_version(is_lhs, e_ordinal);

            if let Some((_, cell)) = existing {
                if let Some(head) = self.slot_undo(cell.slot) {
                    if !tx.can_write(head) {
                        return Err(Error::EdgeLocked(vertex_id, edge.destination));
                    }
                }
            }

            if self
                .edge_image(tx, is_lhs, e_ordinal, vertex_id, &edge)
                .is_some()
            {
                if existing.is_none() {
                    space_needed += u64::from(OFFSET_VERSION);
                }
                removals.push(EdgeRemoval {
                    ordinal: e_ordinal,
                    destination: edge.destination,
                    weight: edge.weight,
                    has_version: existing.is_some(),
                });
            }

            e_pos += OFFSET_ELEMENT;
            e_ordinal += 1;
        }

        if vertex.first && self.find_version(is_lhs, ordinal).is_none() {
            space_needed += u64::from(OFFSET_VERSION);
        }

        if self.free_space() < space_needed {
            return Ok(false);
        }

        // the removal version of the vertex record itself
        if vertex.first {
            let undo = tx.add_undo(Update::vertex(true, vertex_id));
            match self.find_version(is_lhs, ordinal) {
                Some((v_pos, mut cell)) => {
                    undo.set_next(self.take_slot(cell.slot));
                    cell.slot = self.put_slot(undo);
                    cell.is_remove = true;
                    cell.length = (cell.length + 1).min(MAX_UNDO_LENGTH);
                    self.write_version_at(v_pos, cell);
                }
                None => {
                    let slot = self.put_slot(undo);
                    self.insert_version_cell(
                        is_lhs,
                        VersionCell {
                            is_remove: true,
                            length: 1,
                            backptr: ordinal,
                            slot,
                        },
                    );
                }
            }
            instance.record_found();
        }

        for removal in removals {
            let key = Key::new(vertex_id, removal.destination);
            let undo = tx.add_undo(Update::edge(true, key, removal.weight));

            if removal.has_version {
                #[expect(clippy::expect_used, reason = "located before the mutation")]
                let (v_pos, mut cell) = self
                    .find_version(is_lhs, removal.ordinal)
                    .expect("version record vanished");
                undo.set_next(self.take_slot(cell.slot));
                cell.slot = self.put_slot(undo);
                cell.is_remove = true;
                cell.length = (cell.length + 1).min(MAX_UNDO_LENGTH);
                self.write_version_at(v_pos, cell);
            } else {
                let slot = self.put_slot(undo);
                self.insert_version_cell(
                    is_lhs,
                    VersionCell {
                        is_remove: true,
                        length: 1,
                        backptr: removal.ordinal,
                        slot,
                    },
                );
            }

            instance.record_outgoing(removal.destination);
        }

        // lock the group against phantom edge insertions until the whole
        // multi-segment operation completes
        let mut vertex = vertex;
        vertex.lock = true;
        self.write_vertex(v_offset, vertex);
        instance.record_locked();

        Ok(true)
    }

    /// Clears the remover's lock flag from the vertex record and dummies.
    pub fn unlock_vertex(&mut self, vertex_id: u64) {
        for is_lhs in [true, false] {
            if let VertexSearch::Found {
                v_offset,
                mut vertex,
                ..
            } = self.find_vertex(is_lhs, vertex_id)
            {
                if vertex.lock {
                    vertex.lock = false;
                    self.write_vertex(v_offset, vertex);
                }
            }
        }
    }

    /*************************************************************************
     * load / save / prune                                                   *
     *************************************************************************/

    /// Streams every element and its version into the scratchpad, in key
    /// order. Dummy vertices are dropped; edges carry their source.
    pub fn load(&self, scratchpad: &mut ScratchPad) {
        for is_lhs in [true, false] {
            let (c_start, c_end) = self.content_range(is_lhs);
            let mut pos = c_start;
            let mut ordinal: u16 = 0;

            while pos < c_end {
                let vertex = self.read_vertex(pos);

                if vertex.first {
                    scratchpad.push(ScratchEntry {
                        element: LoadedElement::Vertex {
                            id: vertex.id,
                            lock: vertex.lock,
                        },
                        version: self.loaded_version(is_lhs, ordinal),
                    });
                }
                pos += OFFSET_ELEMENT;
                ordinal += 1;

                for _ in 0..vertex.count {
                    let edge = self.read_edge(pos);
                    scratchpad.push(ScratchEntry {
                        element: LoadedElement::Edge {
                            source: vertex.id,
                            destination: edge.destination,
                            weight: edge.weight,
                        },
                        version: self.loaded_version(is_lhs, ordinal),
                    });
                    pos += OFFSET_ELEMENT;
                    ordinal += 1;
                }
            }
        }
    }

    fn loaded_version(&self, is_lhs: bool, ordinal: u16) -> Option<LoadedVersion> {
        self.find_version(is_lhs, ordinal).map(|(_, cell)| LoadedVersion {
            is_remove: cell.is_remove,
            length: cell.length,
            undo: self.slot_undo(cell.slot).cloned(),
        })
    }

    /// Copies entries from the scratchpad into this (empty) file, up to
    /// roughly `target_budget` qwords, splitting them between the two sides.
    /// Returns the achieved budget; `pos` advances to the next unsaved entry.
    pub fn save(&mut self, scratchpad: &ScratchPad, pos: &mut usize, target_budget: u64) -> u64 {
        debug_assert!(self.is_empty(), "save expects a reset file");

        let lhs_budget = target_budget / 2;
        let mut achieved = self.fill(true, scratchpad, pos, lhs_budget);
        achieved += self.fill(false, scratchpad, pos, target_budget - achieved);
        achieved
    }

    fn fill(&mut self, is_lhs: bool, scratchpad: &ScratchPad, pos: &mut usize, budget: u64) -> u64 {
        let budget = budget.min(self.free_space());

        // simulate to learn the layout
        let mut n_qwords: u64 = 0;
        let mut n_cells: u16 = 0;
        let mut n_versions: u16 = 0;
        let mut prev_source: Option<u64> = None;
        let mut end = *pos;

        while end < scratchpad.len() {
            let entry = scratchpad.get(end);
            let mut cost = u64::from(OFFSET_ELEMENT);
            let mut cells = 1u16;
            if entry.version.is_some() {
                cost += u64::from(OFFSET_VERSION);
            }
            if matches!(entry.element, LoadedElement::Edge { .. })
                && prev_source != Some(entry.element.source())
            {
                // a dummy vertex must head the group
                cost += u64::from(OFFSET_ELEMENT);
                cells += 1;
            }

            if n_qwords + cost > budget {
                break;
            }

            n_qwords += cost;
            n_cells += cells;
            n_versions += u16::from(entry.version.is_some());
            prev_source = Some(entry.element.source());
            end += 1;
        }

        if end == *pos {
            return 0;
        }

        // lay the side out: content adjacent to the outer edge, versions
        // between the content and the free space
        let c_len = n_cells * OFFSET_ELEMENT;
        let v_len = n_versions * OFFSET_VERSION;
        let (mut c_pos, mut v_pos) = if is_lhs {
            debug_assert!(self.is_lhs_empty());
            self.versions1_start = c_len;
            self.empty1_start = c_len + v_len;
            (0u16, c_len)
        } else {
            debug_assert!(self.is_rhs_empty());
            let max = self.max_num_qwords();
            self.versions2_start = max - c_len;
            self.empty2_start = max - c_len - v_len;
            (max - c_len, max - c_len - v_len)
        };

        // write pass
        let mut ordinal: u16 = 0;
        let mut group: Option<(u16, VertexCell)> = None;

        for index in *pos..end {
            let entry = scratchpad.get(index);
            match &entry.element {
                LoadedElement::Vertex { id, lock } => {
                    if let Some((v_offset, vertex)) = group.take() {
                        self.write_vertex(v_offset, vertex);
                    }
                    let vertex = VertexCell {
                        id: *id,
                        first: true,
                        lock: *lock,
                        count: 0,
                    };
                    group = Some((c_pos, vertex));
                    c_pos += OFFSET_ELEMENT;
                }
                LoadedElement::Edge {
                    source,
                    destination,
                    weight,
                } => {
                    let group_matches = group.as_ref().is_some_and(|(_, v)| v.id == *source);
                    if !group_matches {
                        if let Some((v_offset, vertex)) = group.take() {
                            self.write_vertex(v_offset, vertex);
                        }
                        // synthesize the dummy heading the group
                        let dummy = VertexCell {
                            id: *source,
                            first: false,
                            lock: false,
                            count: 0,
                        };
                        group = Some((c_pos, dummy));
                        c_pos += OFFSET_ELEMENT;
                        ordinal += 1;
                    }

                    self.write_edge(
                        c_pos,
                        EdgeCell {
                            destination: *destination,
                            weight: *weight,
                        },
                    );
                    c_pos += OFFSET_ELEMENT;

                    if let Some((_, vertex)) = group.as_mut() {
                        vertex.count += 1;
                    }
                }
            }

            if let Some(version) = &entry.version {
                let slot = match &version.undo {
                    Some(undo) => self.put_slot(undo.clone()),
                    None => SLOT_NONE,
                };
                self.write_version_at(
                    v_pos,
                    VersionCell {
                        is_remove: version.is_remove,
                        length: version.length,
                        backptr: ordinal,
                        slot,
                    },
                );
                v_pos += OFFSET_VERSION;
            }

            ordinal += 1;
        }

        if let Some((v_offset, vertex)) = group.take() {
            self.write_vertex(v_offset, vertex);
        }

        *pos = end;
        n_qwords
    }

    /// Removes version records dominated by the minimum active transaction
    /// and content cells whose final state is "removed", compacting both
    /// sides in place.
    pub fn prune(&mut self, high_water_mark: Timestamp) {
        for is_lhs in [true, false] {
            if self.is_dirty(is_lhs) {
                self.prune_side(is_lhs, high_water_mark);
            }
        }
    }

    fn prune_side(&mut self, is_lhs: bool, high_water_mark: Timestamp) {
        struct RebuiltCell {
            element: LoadedElement,
            version: Option<LoadedVersion>,
        }

        // decode
        let (c_start, c_end) = self.content_range(is_lhs);
        let mut cells = Vec::new();
        let mut pos = c_start;
        let mut ordinal: u16 = 0;
        while pos < c_end {
            let vertex = self.read_vertex(pos);
            if vertex.first {
                cells.push(RebuiltCell {
                    element: LoadedElement::Vertex {
                        id: vertex.id,
                        lock: vertex.lock,
                    },
                    version: self.loaded_version(is_lhs, ordinal),
                });
            }
            pos += OFFSET_ELEMENT;
            ordinal += 1;

            for _ in 0..vertex.count {
                let edge = self.read_edge(pos);
                cells.push(RebuiltCell {
                    element: LoadedElement::Edge {
                        source: vertex.id,
                        destination: edge.destination,
                        weight: edge.weight,
                    },
                    version: self.loaded_version(is_lhs, ordinal),
                });
                pos += OFFSET_ELEMENT;
                ordinal += 1;
            }
        }

        // prune
        cells.retain_mut(|cell| {
            let Some(version) = cell.version.as_mut() else {
                return true;
            };

            if let Some(head) = version.undo.clone() {
                match Undo::prune(&head, high_water_mark) {
                    Some((head, length)) => {
                        version.undo = Some(head);
                        version.length = length;
                        return true;
                    }
                    None => {
                        version.undo = None;
                        version.length = 0;
                    }
                }
            }

            if version.undo.is_none() {
                if version.is_remove {
                    return false;
                }
                cell.version = None;
            }
            true
        });

        // rewrite the side
        let n_versions: u16 = cells.iter().map(|c| u16::from(c.version.is_some())).sum();
        let mut n_cells: u16 = 0;
        let mut prev_source: Option<u64> = None;
        for cell in &cells {
            if matches!(cell.element, LoadedElement::Edge { .. })
                && prev_source != Some(cell.element.source())
            {
                n_cells += 1;
            }
            n_cells += 1;
            prev_source = Some(cell.element.source());
        }

        // release the arena slots referenced by this side before rewriting
        let (v_start, v_end) = self.versions_range(is_lhs);
        let mut v_pos = v_start;
        while v_pos < v_end {
            let cell = self.read_version_at(v_pos);
            drop(self.take_slot(cell.slot));
            v_pos += OFFSET_VERSION;
        }

        let c_len = n_cells * OFFSET_ELEMENT;
        let v_len = n_versions * OFFSET_VERSION;
        let (mut c_pos, mut v_pos) = if is_lhs {
            self.versions1_start = c_len;
            self.empty1_start = c_len + v_len;
            (0u16, c_len)
        } else {
            let max = self.max_num_qwords();
            self.versions2_start = max - c_len;
            self.empty2_start = max - c_len - v_len;
            (max - c_len, max - c_len - v_len)
        };

        let mut ordinal: u16 = 0;
        let mut group: Option<(u16, VertexCell)> = None;
        for cell in &cells {
            match &cell.element {
                LoadedElement::Vertex { id, lock } => {
                    if let Some((v_offset, vertex)) = group.take() {
                        self.write_vertex(v_offset, vertex);
                    }
                    group = Some((
                        c_pos,
                        VertexCell {
                            id: *id,
                            first: true,
                            lock: *lock,
                            count: 0,
                        },
                    ));
                    c_pos += OFFSET_ELEMENT;
                }
                LoadedElement::Edge {
                    source,
                    destination,
                    weight,
                } => {
                    let group_matches = group.as_ref().is_some_and(|(_, v)| v.id == *source);
                    if !group_matches {
                        if let Some((v_offset, vertex)) = group.take() {
                            self.write_vertex(v_offset, vertex);
                        }
                        group = Some((
                            c_pos,
                            VertexCell {
                                id: *source,
                                first: false,
                                lock: false,
                                count: 0,
                            },
                        ));
                        c_pos += OFFSET_ELEMENT;
                        ordinal += 1;
                    }
                    self.write_edge(
                        c_pos,
                        EdgeCell {
                            destination: *destination,
                            weight: *weight,
                        },
                    );
                    c_pos += OFFSET_ELEMENT;
                    if let Some((_, vertex)) = group.as_mut() {
                        vertex.count += 1;
                    }
                }
            }

            if let Some(version) = &cell.version {
                let slot = match &version.undo {
                    Some(undo) => self.put_slot(undo.clone()),
                    None => SLOT_NONE,
                };
                self.write_version_at(
                    v_pos,
                    VersionCell {
                        is_remove: version.is_remove,
                        length: version.length,
                        backptr: ordinal,
                        slot,
                    },
                );
                v_pos += OFFSET_VERSION;
            }
            ordinal += 1;
        }
        if let Some((v_offset, vertex)) = group.take() {
            self.write_vertex(v_offset, vertex);
        }
    }

    /// Detaches every version, leaving plain content. Used at shutdown to
    /// break the references into the pending transactions.
    pub fn clear_versions(&mut self) {
        for is_lhs in [true, false] {
            let (v_start, v_end) = self.versions_range(is_lhs);
            let mut pos = v_start;
            while pos < v_end {
                let cell = self.read_version_at(pos);
                drop(self.take_slot(cell.slot));
                pos += OFFSET_VERSION;
            }

            if is_lhs {
                self.empty1_start = self.versions1_start;
            } else {
                self.empty2_start = self.versions2_start;
            }
        }
    }
}

impl std::fmt::Debug for SparseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SparseFile {{ boundaries: [{}, {}, {}, {}], used: {} }}",
            self.versions1_start,
            self.empty1_start,
            self.empty2_start,
            self.versions2_start,
            self.used_space()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::BufferPool;
    use crate::transaction::TransactionManager;
    use test_log::test;

    fn file() -> SparseFile {
        let pool = BufferPool::new(/* 64 qwords */ 512, 2, 1 << 20, false).unwrap();
        SparseFile::new(pool.allocate_page().unwrap())
    }

    fn manager() -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new())
    }

    fn tx(manager: &Arc<TransactionManager>) -> Arc<TransactionImpl> {
        TransactionImpl::start(manager.clone(), false)
    }

    fn commit(tx: &Arc<TransactionImpl>) {
        tx.commit().unwrap();
    }

    fn insert_vertex(file: &mut SparseFile, tx: &Arc<TransactionImpl>, id: u64) {
        let done = file
            .update(tx, &Update::vertex(true, id), true)
            .map_err(|_| "unexpected error")
            .unwrap();
        assert!(done, "out of space");
    }

    fn insert_edge(file: &mut SparseFile, tx: &Arc<TransactionImpl>, key: Key, weight: f64) {
        let done = file
            .update(tx, &Update::edge(true, key, weight), true)
            .map_err(|_| "unexpected error")
            .unwrap();
        assert!(done, "out of space");
    }

    #[test]
    fn vertex_insert_visibility() {
        let manager = manager();
        let mut file = file();

        let older = tx(&manager);
        let writer = tx(&manager);
        insert_vertex(&mut file, &writer, 10);

        // the writer sees its own change, the older snapshot does not
        assert!(file.has_item(&writer, Key::vertex(10), false).unwrap());
        assert!(!file.has_item(&older, Key::vertex(10), false).unwrap());

        commit(&writer);

        // the commit happened after the older snapshot started
        assert!(!file.has_item(&older, Key::vertex(10), false).unwrap());

        let newer = tx(&manager);
        assert!(file.has_item(&newer, Key::vertex(10), false).unwrap());
    }

    #[test]
    fn vertex_consistency_errors() {
        let manager = manager();
        let mut file = file();

        let t1 = tx(&manager);
        assert_eq!(
            Err(Error::VertexDoesNotExist(10)),
            file.update(&t1, &Update::vertex(false, 10), true)
                .map_err(|e| match e {
                    WriteError::User(e) => e,
                    WriteError::NotSureIfItHasSourceVertex => unreachable!(),
                })
        );

        insert_vertex(&mut file, &t1, 10);
        commit(&t1);

        let t2 = tx(&manager);
        let result = file.update(&t2, &Update::vertex(true, 10), true);
        assert!(matches!(
            result,
            Err(WriteError::User(Error::VertexAlreadyExists(10)))
        ));
    }

    #[test]
    fn write_conflict_on_pending_vertex() {
        let manager = manager();
        let mut file = file();

        let t1 = tx(&manager);
        insert_vertex(&mut file, &t1, 10);

        // t2 collides with t1's uncommitted version
        let t2 = tx(&manager);
        let result = file.update(&t2, &Update::vertex(true, 10), true);
        assert!(matches!(
            result,
            Err(WriteError::User(Error::VertexLocked(10)))
        ));
    }

    #[test]
    fn edge_round_trip_with_dummy() {
        let manager = manager();
        let mut file = file();

        let t1 = tx(&manager);
        insert_vertex(&mut file, &t1, 10);
        insert_edge(&mut file, &t1, Key::new(10, 20), 0.5);
        insert_edge(&mut file, &t1, Key::new(10, 30), 1.5);
        commit(&t1);

        let t2 = tx(&manager);
        assert!(file.has_item(&t2, Key::new(10, 20), false).unwrap());
        assert_eq!(0.5, file.get_weight(&t2, Key::new(10, 20)).unwrap());
        assert_eq!(1.5, file.get_weight(&t2, Key::new(10, 30)).unwrap());
        assert_eq!(2, file.get_degree(&t2, 10));
        assert_eq!(
            Err(Error::EdgeDoesNotExist(10, 40)),
            file.get_weight(&t2, Key::new(10, 40))
        );
    }

    #[test]
    fn edge_without_local_source_is_not_sure() {
        let manager = manager();
        let mut file = file();

        // empty file: the source may live in a previous segment
        let t1 = tx(&manager);
        let result = file.update(&t1, &Update::edge(true, Key::new(10, 20), 1.0), false);
        assert!(matches!(
            result,
            Err(WriteError::NotSureIfItHasSourceVertex)
        ));

        // with a smaller vertex stored, the source would sort locally
        insert_vertex(&mut file, &t1, 5);
        let result = file.update(&t1, &Update::edge(true, Key::new(10, 20), 1.0), false);
        assert!(matches!(
            result,
            Err(WriteError::User(Error::VertexDoesNotExist(10)))
        ));

        // a visible local source suffices
        insert_vertex(&mut file, &t1, 10);
        let done = file
            .update(&t1, &Update::edge(true, Key::new(10, 20), 1.0), false)
            .map_err(|_| "unexpected error")
            .unwrap();
        assert!(done);
    }

    #[test]
    fn scan_in_key_order() {
        let manager = manager();
        let mut file = file();

        let t1 = tx(&manager);
        insert_vertex(&mut file, &t1, 10);
        insert_vertex(&mut file, &t1, 20);
        insert_edge(&mut file, &t1, Key::new(10, 30), 3.0);
        insert_edge(&mut file, &t1, Key::new(10, 20), 2.0);
        commit(&t1);

        let t2 = tx(&manager);
        let mut seen = Vec::new();
        let exhausted = file.scan(&t2, KEY_MIN_TEST, &mut |source, destination, weight| {
            seen.push((source, destination, weight));
            true
        });

        assert!(exhausted);
        assert_eq!(
            vec![(10, 0, 0.0), (10, 20, 2.0), (10, 30, 3.0), (20, 0, 0.0)],
            seen
        );
    }

    const KEY_MIN_TEST: Key = crate::key::KEY_MIN;

    #[test]
    fn rollback_restores_prior_state() {
        let manager = manager();
        let mut file = file();

        let t1 = tx(&manager);
        insert_vertex(&mut file, &t1, 10);
        commit(&t1);

        let before = file.used_space();

        // insert an edge, then roll it back by hand
        let t2 = tx(&manager);
        insert_edge(&mut file, &t2, Key::new(10, 20), 1.0);

        let reader = tx(&manager);
        assert!(!file.has_item(&reader, Key::new(10, 20), false).unwrap());

        file.rollback(&Update::edge(false, Key::new(10, 20), 0.0), None);
        assert_eq!(before, file.used_space());

        let t3 = tx(&manager);
        assert!(!file.has_item(&t3, Key::new(10, 20), false).unwrap());
        assert_eq!(0, file.get_degree(&t3, 10));
    }

    #[test]
    fn update_rejects_when_full() {
        let manager = manager();
        let mut file = file();

        let t1 = tx(&manager);
        let mut inserted = 0u64;
        loop {
            match file.update(&t1, &Update::vertex(true, 10 + inserted), true) {
                Ok(true) => inserted += 1,
                Ok(false) => break,
                Err(_) => unreachable!(),
            }
        }

        // 64 qwords, 3 qwords per vertex + version
        assert!(inserted >= 20);
        assert!(file.free_space() < 3);
    }

    #[test]
    fn load_save_preserves_content() {
        let manager = manager();
        let mut source = file();

        let t1 = tx(&manager);
        insert_vertex(&mut source, &t1, 10);
        insert_edge(&mut source, &t1, Key::new(10, 20), 2.0);
        insert_vertex(&mut source, &t1, 30);
        commit(&t1);

        let mut scratchpad = ScratchPad::new();
        source.load(&mut scratchpad);
        assert_eq!(3, scratchpad.len());

        let mut target = file();
        let mut pos = 0;
        target.save(&scratchpad, &mut pos, u64::from(target.max_num_qwords()));
        assert_eq!(scratchpad.len(), pos);

        let t2 = tx(&manager);
        assert!(target.has_item(&t2, Key::vertex(10), false).unwrap());
        assert!(target.has_item(&t2, Key::new(10, 20), false).unwrap());
        assert!(target.has_item(&t2, Key::vertex(30), false).unwrap());
        assert_eq!(2.0, target.get_weight(&t2, Key::new(10, 20)).unwrap());
    }

    #[test]
    fn prune_drops_dominated_removals() {
        let manager = manager();
        let mut file = file();

        let t1 = tx(&manager);
        insert_vertex(&mut file, &t1, 10);
        insert_vertex(&mut file, &t1, 20);
        commit(&t1);

        let t2 = tx(&manager);
        let done = file
            .update(&t2, &Update::vertex(false, 20), true)
            .map_err(|_| "unexpected error")
            .unwrap();
        assert!(done);
        commit(&t2);

        // no active transaction: everything is dominated
        file.prune(manager.high_water_mark());

        let t3 = tx(&manager);
        assert!(file.has_item(&t3, Key::vertex(10), false).unwrap());
        assert!(!file.has_item(&t3, Key::vertex(20), false).unwrap());

        // vertex 20 is physically gone and carries no version anymore
        assert_eq!(2, file.used_space());
    }
}
