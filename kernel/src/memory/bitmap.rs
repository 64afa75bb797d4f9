//! Fixed-length bit set backing a zone's page ownership.

use crate::constants::memory::{BITMAP_ENTRY_SIZE, FULL_BITMAP_ENTRY};

use alloc::{boxed::Box, vec};

pub struct Bitmap {
    len: usize,
    set_count: usize,
    words: Box<[u64]>,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        let words = vec![0u64; len.div_ceil(BITMAP_ENTRY_SIZE)].into_boxed_slice();
        Self {
            len,
            set_count: 0,
            words,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bits currently set.
    pub fn count_set(&self) -> usize {
        self.set_count
    }

    /// set a particular bit (1). returns false if it was already set
    pub fn set(&mut self, index: usize) -> bool {
        assert!(index < self.len);

        let word_index = index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (index % BITMAP_ENTRY_SIZE);
        if self.words[word_index] & mask != 0 {
            return false;
        }
        self.words[word_index] |= mask;
        self.set_count += 1;
        true
    }

    /// clear a particular bit (0). returns false if it was already clear
    pub fn clear(&mut self, index: usize) -> bool {
        assert!(index < self.len);

        let word_index = index / BITMAP_ENTRY_SIZE;
        let mask = 1 << (index % BITMAP_ENTRY_SIZE);
        if self.words[word_index] & mask == 0 {
            return false;
        }
        self.words[word_index] &= !mask;
        self.set_count -= 1;
        true
    }

    /// check if bit is set at index. returns true if bit == 1, false otherwise
    pub fn is_set(&self, index: usize) -> bool {
        assert!(index < self.len);

        let mask = 1 << (index % BITMAP_ENTRY_SIZE);
        (self.words[index / BITMAP_ENTRY_SIZE] & mask) != 0
    }

    /// First clear bit at or after `from`, skipping full words.
    pub fn next_clear(&self, from: usize) -> Option<usize> {
        let mut index = from;
        while index < self.len {
            let word = self.words[index / BITMAP_ENTRY_SIZE];
            if index % BITMAP_ENTRY_SIZE == 0 && word == FULL_BITMAP_ENTRY {
                index += BITMAP_ENTRY_SIZE;
                continue;
            }
            if word & (1 << (index % BITMAP_ENTRY_SIZE)) == 0 {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Length of the run of clear bits starting at `start`, counting at most `cap`.
    pub fn clear_run_len(&self, start: usize, cap: usize) -> usize {
        (start..self.len)
            .take(cap)
            .take_while(|&i| !self.is_set(i))
            .count()
    }

    /// Iterates over `(start, len)` of every maximal run of clear bits.
    pub fn clear_runs(&self) -> ClearRuns<'_> {
        ClearRuns {
            bitmap: self,
            next: 0,
        }
    }
}

pub struct ClearRuns<'a> {
    bitmap: &'a Bitmap,
    next: usize,
}

impl Iterator for ClearRuns<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.bitmap.next_clear(self.next)?;
        let len = self.bitmap.clear_run_len(start, usize::MAX);
        self.next = start + len;
        Some((start, len))
    }
}
