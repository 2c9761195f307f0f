/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */
use serde::{Deserialize, Serialize};

/// A fixed-size allocation bitmap for a single block, backed by `u64` words.
/// One bit per address offset within the block; a set bit means allocated
/// (either to a live endpoint, or permanently to a blackout).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, offset: usize) -> bool {
        assert!(offset < self.len, "bitmap offset out of range");
        (self.words[offset / 64] >> (offset % 64)) & 1 == 1
    }

    pub fn set(&mut self, offset: usize) {
        assert!(offset < self.len, "bitmap offset out of range");
        self.words[offset / 64] |= 1u64 << (offset % 64);
    }

    pub fn clear(&mut self, offset: usize) {
        assert!(offset < self.len, "bitmap offset out of range");
        self.words[offset / 64] &= !(1u64 << (offset % 64));
    }

    /// Index of the lowest-offset unset bit, if any.
    pub fn first_free(&self) -> Option<usize> {
        for (word_idx, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                let offset = word_idx * 64 + bit;
                if offset < self.len {
                    return Some(offset);
                }
            }
        }
        None
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_reusable(&self) -> bool {
        self.count_ones() == 0
    }

    /// Offsets of every set bit, in ascending order.
    pub fn allocated_offsets(&self) -> Vec<usize> {
        (0..self.len).filter(|o| self.get(*o)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_and_first_free() {
        let mut bm = Bitmap::new(4);
        assert_eq!(bm.first_free(), Some(0));
        bm.set(0);
        bm.set(1);
        assert_eq!(bm.first_free(), Some(2));
        bm.clear(0);
        assert_eq!(bm.first_free(), Some(0));
        assert_eq!(bm.count_ones(), 1);
    }

    #[test]
    fn exhausted_bitmap_has_no_free_bit() {
        let mut bm = Bitmap::new(3);
        bm.set(0);
        bm.set(1);
        bm.set(2);
        assert_eq!(bm.first_free(), None);
        assert!(!bm.is_reusable());
    }

    #[test]
    fn spans_multiple_words() {
        let mut bm = Bitmap::new(130);
        for o in 0..129 {
            bm.set(o);
        }
        assert_eq!(bm.first_free(), Some(129));
        bm.set(129);
        assert_eq!(bm.first_free(), None);
    }
}
