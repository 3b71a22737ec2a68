// Copyright (c) 2024-present, teseo contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::memstore::leaf::Leaf;
use std::sync::Arc;

/// What a rebalance is going to do: spread a window in place, split a leaf
/// into two, or merge two adjacent leaves into one.
pub(crate) struct Plan {
    leaf1: Arc<Leaf>,
    leaf2: Option<Arc<Leaf>>,
    window_start: usize,
    window_end: usize,
    num_output_segments: usize,
    cardinality: u64,
}

impl Plan {
    pub fn create_spread(
        cardinality: u64,
        leaf: Arc<Leaf>,
        window_start: usize,
        window_end: usize,
    ) -> Self {
        debug_assert!(window_start < window_end);
        Self {
            leaf1: leaf,
            leaf2: None,
            window_start,
            window_end,
            num_output_segments: window_end - window_start,
            cardinality,
        }
    }

    pub fn create_split(cardinality: u64, leaf: Arc<Leaf>, num_output_segments: usize) -> Self {
        let num_segments = leaf.num_segments();
        debug_assert!(num_output_segments > num_segments);
        Self {
            leaf1: leaf,
            leaf2: None,
            window_start: 0,
            window_end: num_segments,
            num_output_segments,
            cardinality,
        }
    }

    pub fn create_merge(cardinality: u64, leaf1: Arc<Leaf>, leaf2: Arc<Leaf>) -> Self {
        let window_end = leaf1.num_segments() + leaf2.num_segments();
        let num_output_segments = leaf1.num_segments();
        Self {
            leaf1,
            leaf2: Some(leaf2),
            window_start: 0,
            window_end,
            num_output_segments,
            cardinality,
        }
    }

    pub fn is_spread(&self) -> bool {
        self.window_length() == self.num_output_segments
    }

    pub fn is_merge(&self) -> bool {
        self.window_length() > self.num_output_segments
    }

    pub fn is_split(&self) -> bool {
        self.window_length() < self.num_output_segments
    }

    pub fn window_start(&self) -> usize {
        self.window_start
    }

    pub fn window_end(&self) -> usize {
        self.window_end
    }

    pub fn window_length(&self) -> usize {
        self.window_end - self.window_start
    }

    pub fn num_output_segments(&self) -> usize {
        self.num_output_segments
    }

    pub fn set_num_output_segments(&mut self, value: usize) {
        self.num_output_segments = value;
    }

    pub fn cardinality(&self) -> u64 {
        self.cardinality
    }

    pub fn first_leaf(&self) -> &Arc<Leaf> {
        &self.leaf1
    }

    pub fn second_leaf(&self) -> Option<&Arc<Leaf>> {
        self.leaf2.as_ref()
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_spread() {
            "spread"
        } else if self.is_split() {
            "split"
        } else {
            "merge"
        };
        write!(
            f,
            "Plan {{ {kind}, window: [{}, {}), outputs: {}, cardinality: {} }}",
            self.window_start, self.window_end, self.num_output_segments, self.cardinality
        )
    }
}
