//! Physical memory: zones, the page allocator and the compactor.

pub mod bitmap;
pub mod compaction;
pub mod page_allocator;
pub mod zone;

use core::fmt;

use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr,
};

use crate::constants::memory::PAGE_SIZE;

/// A run of `count` physical pages starting at page index `start`.
///
/// Page indices are global: page `i` covers physical addresses
/// `[i * PAGE_SIZE, (i + 1) * PAGE_SIZE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageRange {
    pub start: usize,
    pub count: usize,
}

impl PageRange {
    pub const fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }

    /// One past the last page of the range.
    pub const fn end(&self) -> usize {
        self.start + self.count
    }

    pub const fn contains(&self, page: usize) -> bool {
        page >= self.start && page < self.end()
    }

    pub const fn overlaps(&self, other: &PageRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    pub fn start_address(&self) -> PhysAddr {
        PhysAddr::new(self.start as u64 * PAGE_SIZE)
    }

    /// Address one byte past the range, i.e. the top of a stack living in it.
    pub fn end_address(&self) -> PhysAddr {
        PhysAddr::new(self.end() as u64 * PAGE_SIZE)
    }

    pub fn first_frame(&self) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(self.start_address())
    }

    pub fn pages(&self) -> core::ops::Range<usize> {
        self.start..self.end()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.start, self.end())
    }
}

/// Physical address of the page with the given global index.
pub fn page_address(page: usize) -> PhysAddr {
    PhysAddr::new(page as u64 * PAGE_SIZE)
}

/// Whether the compactor may relocate the pages of an allocation.
///
/// Only single-page movable allocations are ever relocated; the owner is told
/// through [`compaction::PageMoveListener`]. Multi-page ranges stay put because
/// moving one of their pages would break the contiguity their owner relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mobility {
    Movable,
    Pinned,
}
