// SPDX-FileCopyrightText: 2025 ksync contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ksync_common::{KernelError, KernelResult};

/// Bitmap allocator of thread-local storage slot indices.
///
/// Only indices are managed here; the per-thread values live in each
/// thread's record.
#[derive(Debug, Clone)]
pub struct TlsAllocator {
    words: Vec<u64>,
    capacity: usize,
}

impl TlsAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    /// Claim the lowest free index.
    pub fn alloc(&mut self) -> KernelResult<usize> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let index = w * 64 + bit;
            if index >= self.capacity {
                break;
            }
            *word |= 1 << bit;
            return Ok(index);
        }
        Err(KernelError::Exhausted)
    }

    /// Release an index. Freeing a free or out-of-range index does nothing.
    /// Returns whether the index was allocated.
    pub fn free(&mut self, index: usize) -> bool {
        if !self.is_allocated(index) {
            return false;
        }
        self.words[index / 64] &= !(1 << (index % 64));
        true
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        index < self.capacity && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of indices in use.
    pub fn allocated(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}
