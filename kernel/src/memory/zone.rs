//! Contiguous physical memory zones discovered from the boot memory map.

use crate::constants::memory::PAGE_SIZE;

use super::{bitmap::Bitmap, Mobility, PageRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
}

/// One entry of the boot memory map, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Usable,
        }
    }

    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: RegionKind::Reserved,
        }
    }

    /// Whole pages covered by the region: base rounded up, end rounded down.
    pub fn page_range(&self) -> PageRange {
        let first = self.base.div_ceil(PAGE_SIZE);
        let last = self.base.saturating_add(self.length) / PAGE_SIZE;
        PageRange::new(first as usize, last.saturating_sub(first) as usize)
    }
}

/// Read-only snapshot of a zone's accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    pub id: usize,
    pub pages: PageRange,
    pub total_pages: usize,
    pub free_pages: usize,
    pub used_pages: usize,
}

/// A physical range with its own ownership bitmap and counters.
///
/// `used` has a bit per page (1 = owned); `movable` marks the used pages the
/// compactor may relocate. `free_pages + used_pages == total_pages` holds
/// after every method returns.
pub struct Zone {
    id: usize,
    start_page: usize,
    total_pages: usize,
    free_pages: usize,
    used_pages: usize,
    used: Bitmap,
    movable: Bitmap,
}

impl Zone {
    pub fn new(id: usize, pages: PageRange) -> Self {
        Self {
            id,
            start_page: pages.start,
            total_pages: pages.count,
            free_pages: pages.count,
            used_pages: 0,
            used: Bitmap::new(pages.count),
            movable: Bitmap::new(pages.count),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn start_page(&self) -> usize {
        self.start_page
    }

    pub fn end_page(&self) -> usize {
        self.start_page + self.total_pages
    }

    pub fn pages(&self) -> PageRange {
        PageRange::new(self.start_page, self.total_pages)
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    /// Number of set bits in the ownership bitmap; equals `used_pages`.
    pub fn bitmap_population(&self) -> usize {
        self.used.count_set()
    }

    pub fn info(&self) -> ZoneInfo {
        ZoneInfo {
            id: self.id,
            pages: self.pages(),
            total_pages: self.total_pages,
            free_pages: self.free_pages,
            used_pages: self.used_pages,
        }
    }

    pub fn contains(&self, page: usize) -> bool {
        page >= self.start_page && page < self.end_page()
    }

    pub fn contains_range(&self, range: PageRange) -> bool {
        range.count > 0 && self.contains(range.start) && range.end() <= self.end_page()
    }

    fn local(&self, page: usize) -> usize {
        page - self.start_page
    }

    pub fn is_free(&self, page: usize) -> bool {
        !self.used.is_set(self.local(page))
    }

    pub fn is_movable(&self, page: usize) -> bool {
        self.movable.is_set(self.local(page))
    }

    /// Used and not relocatable.
    pub fn is_pinned(&self, page: usize) -> bool {
        !self.is_free(page) && !self.is_movable(page)
    }

    pub fn is_range_free(&self, range: PageRange) -> bool {
        range.pages().all(|page| self.is_free(page))
    }

    /// First-fit scan for `count` free pages whose first page index is a
    /// multiple of `align_pages`. Returns the global index of the first page.
    pub fn find_free_run(&self, count: usize, align_pages: usize) -> Option<usize> {
        if count == 0 || count > self.free_pages {
            return None;
        }
        let mut local = 0;
        while let Some(clear) = self.used.next_clear(local) {
            let aligned = (self.start_page + clear).next_multiple_of(align_pages);
            let candidate = aligned - self.start_page;
            if candidate + count > self.total_pages {
                return None;
            }
            let run = self.used.clear_run_len(candidate, count);
            if run == count {
                return Some(aligned);
            }
            // the page right after the short run is used (or out of range)
            local = candidate + run + 1;
        }
        None
    }

    /// Marks a free range as owned. The caller has checked that it is free.
    pub fn mark_used(&mut self, range: PageRange, mobility: Mobility) {
        debug_assert!(self.contains_range(range));
        let movable = mobility == Mobility::Movable && range.count == 1;
        for page in range.pages() {
            let local = self.local(page);
            let newly_used = self.used.set(local);
            debug_assert!(newly_used, "page {page:#x} allocated twice");
            if newly_used {
                self.used_pages += 1;
                self.free_pages -= 1;
            }
            if movable {
                self.movable.set(local);
            }
        }
    }

    /// Returns a range to the free pool. Returns the number of pages that were
    /// actually in use; already-free pages leave the counters untouched.
    pub fn mark_free(&mut self, range: PageRange) -> usize {
        debug_assert!(self.contains_range(range));
        let mut freed = 0;
        for page in range.pages() {
            let local = self.local(page);
            self.movable.clear(local);
            if self.used.clear(local) {
                self.used_pages -= 1;
                self.free_pages += 1;
                freed += 1;
            }
        }
        debug_assert_eq!(freed, range.count, "double free inside {range}");
        freed
    }

    /// Transfers ownership bits of `from` to `to`. Counters are unchanged.
    pub fn relocate(&mut self, from: usize, to: usize) {
        let (from, to) = (self.local(from), self.local(to));
        let movable = self.movable.clear(from);
        self.used.clear(from);
        self.used.set(to);
        if movable {
            self.movable.set(to);
        }
    }

    /// Global `(start, len)` of every maximal free run, lowest first.
    pub fn free_runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let base = self.start_page;
        self.used
            .clear_runs()
            .map(move |(start, len)| (base + start, len))
    }

    pub fn largest_free_run(&self) -> usize {
        self.free_runs().map(|(_, len)| len).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_pages_round_inward() {
        let region = MemoryRegion::usable(0x1800, 0x4000);
        // 0x1800 rounds up to page 2, 0x5800 rounds down to page 5
        assert_eq!(region.page_range(), PageRange::new(2, 3));
    }

    #[test]
    fn counters_follow_allocation() {
        let mut zone = Zone::new(0, PageRange::new(100, 100));
        zone.mark_used(PageRange::new(100, 10), Mobility::Pinned);
        assert_eq!(zone.free_pages(), 90);
        assert_eq!(zone.used_pages(), 10);
        assert_eq!(zone.mark_free(PageRange::new(100, 10)), 10);
        assert_eq!(zone.free_pages(), 100);
        assert_eq!(zone.used_pages(), 0);
    }

    #[test]
    fn first_fit_skips_short_runs() {
        let mut zone = Zone::new(0, PageRange::new(0, 32));
        zone.mark_used(PageRange::new(3, 1), Mobility::Pinned);
        zone.mark_used(PageRange::new(6, 1), Mobility::Pinned);
        assert_eq!(zone.find_free_run(3, 1), Some(0));
        assert_eq!(zone.find_free_run(4, 1), Some(7));
    }

    #[test]
    fn first_fit_honours_alignment() {
        let mut zone = Zone::new(0, PageRange::new(3, 64));
        zone.mark_used(PageRange::new(8, 1), Mobility::Pinned);
        // page 8 is used, next 8-aligned start is 16
        assert_eq!(zone.find_free_run(4, 8), Some(16));
        assert_eq!(zone.find_free_run(2, 1), Some(3));
    }

    #[test]
    fn find_fails_when_run_would_overflow_zone() {
        let zone = Zone::new(0, PageRange::new(0, 8));
        assert_eq!(zone.find_free_run(9, 1), None);
        assert_eq!(zone.find_free_run(8, 16), Some(0));
        let offset = Zone::new(0, PageRange::new(1, 8));
        assert_eq!(offset.find_free_run(4, 16), None);
    }

    #[test]
    fn only_single_page_movable_allocations_are_movable() {
        let mut zone = Zone::new(0, PageRange::new(0, 16));
        zone.mark_used(PageRange::new(0, 1), Mobility::Movable);
        zone.mark_used(PageRange::new(1, 2), Mobility::Movable);
        zone.mark_used(PageRange::new(3, 1), Mobility::Pinned);
        assert!(zone.is_movable(0));
        assert!(zone.is_pinned(1) && zone.is_pinned(2));
        assert!(zone.is_pinned(3));
    }

    #[test]
    fn relocate_moves_ownership_bits() {
        let mut zone = Zone::new(0, PageRange::new(0, 16));
        zone.mark_used(PageRange::new(9, 1), Mobility::Movable);
        zone.relocate(9, 2);
        assert!(zone.is_free(9));
        assert!(zone.is_movable(2));
        assert_eq!(zone.used_pages(), 1);
        assert_eq!(zone.bitmap_population(), 1);
    }

    #[test]
    fn largest_free_run() {
        let mut zone = Zone::new(0, PageRange::new(0, 20));
        zone.mark_used(PageRange::new(5, 1), Mobility::Pinned);
        zone.mark_used(PageRange::new(8, 1), Mobility::Pinned);
        assert_eq!(zone.largest_free_run(), 11);
    }
}
