// BgpMcast: Multicast distribution-tree engine written in Rust
// Copyright 2023-2025 The bgp-mcast developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Label blocks: externally-owned allocators for the MPLS-style labels
//! carried by in-tree forwarders.
//!
//! A peer advertises one contiguous label range; every forwarder joined
//! through that peer allocates its label from the same shared block. Blocks
//! are shared behind an [`LabelBlockRef`] and are internally thread-safe, so
//! allocate and release may be called from any partition context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::Label;

/// Shared handle to a [`LabelBlock`].
///
/// Blocks compare by identity: two handles refer to the same block iff they
/// point to the same allocation ([`LabelBlock::same`]).
pub type LabelBlockRef = Arc<LabelBlock>;

const BITS: usize = u64::BITS as usize;

/// A contiguous block of labels `[first, last]` with lock-free allocation.
#[derive(Debug)]
pub struct LabelBlock {
    first: Label,
    last: Label,
    words: Vec<AtomicU64>,
}

impl LabelBlock {
    /// Create a new label block covering the inclusive range `[first, last]`.
    ///
    /// # Panics
    /// Panics if `first` is zero (0 is reserved for "no label") or if the
    /// range is empty.
    pub fn new(first: Label, last: Label) -> LabelBlockRef {
        assert!(first > 0, "label 0 is reserved");
        assert!(first <= last, "empty label block [{first}, {last}]");
        let size = (last - first + 1) as usize;
        let words = (0..size.div_ceil(BITS)).map(|_| AtomicU64::new(0)).collect();
        Arc::new(Self { first, last, words })
    }

    /// The number of labels in the block.
    pub fn size(&self) -> usize {
        (self.last - self.first + 1) as usize
    }

    /// Allocate the lowest free label, or `None` if the block is exhausted.
    pub fn allocate(&self) -> Option<Label> {
        for (w, word) in self.words.iter().enumerate() {
            let mut cur = word.load(Ordering::Relaxed);
            loop {
                let free = (!cur).trailing_zeros() as usize;
                let bit = w * BITS + free;
                if free == BITS || bit >= self.size() {
                    break;
                }
                match word.compare_exchange_weak(
                    cur,
                    cur | 1 << free,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(self.first + bit as Label),
                    Err(now) => cur = now,
                }
            }
        }
        None
    }

    /// Release a previously allocated label.
    ///
    /// # Panics
    /// Panics if the label is outside the block or not currently allocated;
    /// both indicate a label-accounting bug in the caller.
    pub fn release(&self, label: Label) {
        assert!(
            (self.first..=self.last).contains(&label),
            "label {label} released to foreign block {self}"
        );
        let bit = (label - self.first) as usize;
        let old = self.words[bit / BITS].fetch_and(!(1 << (bit % BITS)), Ordering::AcqRel);
        assert!(old & 1 << (bit % BITS) != 0, "label {label} released twice");
    }

    /// The number of labels currently allocated.
    pub fn in_use(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Compare two blocks by identity.
    pub fn same(a: &LabelBlockRef, b: &LabelBlockRef) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl std::fmt::Display for LabelBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}
