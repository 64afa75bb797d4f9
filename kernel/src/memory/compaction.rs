//! Fragmentation analysis and page relocation.
//!
//! Compaction runs under the allocator lock: a [`Compactor`] borrows the
//! [`PageAllocator`] mutably for its whole lifetime, so every relocation is
//! atomic with respect to allocation and free.

use alloc::vec::Vec;
use log::{debug, info, warn};
use thiserror::Error;

use crate::{arch::Cpu, policy::Policy};

use super::{page_address, page_allocator::PageAllocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategy {
    /// Pack every movable page toward the bottom of the zone.
    Aggressive,
    /// Clear the cheapest window the size of the failed request.
    Lazy,
    /// Execute the policy's move list after validating each move.
    Smart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    pub start: usize,
    pub pages: usize,
}

/// Snapshot of one zone's free space.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentationInfo {
    pub zone: usize,
    pub zone_start: usize,
    pub total_pages: usize,
    pub free_pages: usize,
    pub total_fragments: usize,
    pub largest_free_block: usize,
    /// used / total
    pub fragmentation_ratio: f32,
    /// Maximal free runs, lowest address first.
    pub free_runs: Vec<FreeRun>,
}

impl FragmentationInfo {
    pub fn from_runs(
        zone: usize,
        zone_start: usize,
        total_pages: usize,
        free_runs: Vec<FreeRun>,
    ) -> Self {
        let free_pages = free_runs.iter().map(|run| run.pages).sum::<usize>();
        let largest_free_block = free_runs.iter().map(|run| run.pages).max().unwrap_or(0);
        let fragmentation_ratio = if total_pages == 0 {
            0.0
        } else {
            (total_pages - free_pages) as f32 / total_pages as f32
        };
        Self {
            zone,
            zone_start,
            total_pages,
            free_pages,
            total_fragments: free_runs.len(),
            largest_free_block,
            fragmentation_ratio,
            free_runs,
        }
    }

    pub fn used_pages(&self) -> usize {
        self.total_pages - self.free_pages
    }

    /// Share of free memory outside the largest free run; 0 when the free
    /// space is one block.
    pub fn external_fragmentation(&self) -> f32 {
        if self.free_pages == 0 {
            return 0.0;
        }
        1.0 - self.largest_free_block as f32 / self.free_pages as f32
    }

    pub fn is_free(&self, page: usize) -> bool {
        let index = self
            .free_runs
            .partition_point(|run| run.start + run.pages <= page);
        self.free_runs
            .get(index)
            .is_some_and(|run| run.start <= page)
    }
}

/// A relocation of the contents of page `from` into page `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMove {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MoveError {
    #[error("page outside the zone being compacted")]
    OutOfZone,
    #[error("source and destination are the same page")]
    SamePage,
    #[error("source page is free")]
    SourceNotUsed,
    #[error("source page is pinned")]
    SourcePinned,
    #[error("destination page is in use")]
    DestinationInUse,
}

/// Told about every relocation so virtual mappings can follow the page.
///
/// Called with the allocator lock held; implementations must not allocate or
/// free pages.
pub trait PageMoveListener: Send + Sync {
    fn on_page_moved(&self, from: usize, to: usize);
}

impl PageAllocator {
    pub fn analyze_fragmentation(&self, zone: usize) -> Option<FragmentationInfo> {
        let zone = self.zone(zone)?;
        let runs = zone
            .free_runs()
            .map(|(start, pages)| FreeRun { start, pages })
            .collect();
        Some(FragmentationInfo::from_runs(
            zone.id(),
            zone.start_page(),
            zone.total_pages(),
            runs,
        ))
    }
}

pub struct Compactor<'a, P: Policy + ?Sized, C: Cpu> {
    allocator: &'a mut PageAllocator,
    policy: &'a P,
    cpu: &'a C,
    listener: Option<&'a dyn PageMoveListener>,
}

impl<'a, P: Policy + ?Sized, C: Cpu> Compactor<'a, P, C> {
    pub fn new(
        allocator: &'a mut PageAllocator,
        policy: &'a P,
        cpu: &'a C,
        listener: Option<&'a dyn PageMoveListener>,
    ) -> Self {
        Self {
            allocator,
            policy,
            cpu,
            listener,
        }
    }

    /// One compaction pass in aid of a failed `count`-page request.
    ///
    /// Visits the zones that hold at least `count` free pages, preferred zone
    /// first, letting the policy pick a strategy per zone. Stops as soon as a
    /// zone can satisfy the request.
    pub fn compact_for(&mut self, count: usize, preferred_zone: usize, align_pages: usize) -> usize {
        self.allocator.stats_mut().compactions += 1;
        let mut moved = 0;

        for id in self.allocator.compaction_candidates(count, preferred_zone) {
            let Some(info) = self.allocator.analyze_fragmentation(id) else {
                continue;
            };
            let strategy = self.policy.get_compaction_strategy(&info);
            info!(
                "compacting zone {} ({:?}): {} fragments, largest free block {}",
                id, strategy, info.total_fragments, info.largest_free_block
            );
            moved += self.compact_zone(id, strategy, count, align_pages);

            let satisfied = self
                .allocator
                .zone(id)
                .is_some_and(|zone| zone.find_free_run(count, align_pages).is_some());
            if satisfied {
                break;
            }
        }

        info!("compaction complete, moved {} pages", moved);
        moved
    }

    /// Compacts every zone with `strategy`. The lazy strategy aims for a free
    /// block one page larger than the zone's current largest.
    pub fn compact(&mut self, strategy: CompactionStrategy) -> usize {
        self.allocator.stats_mut().compactions += 1;
        let mut moved = 0;
        for id in 0..self.allocator.zone_count() {
            let request = self.allocator.zone(id).map_or(0, |zone| {
                (zone.largest_free_run() + 1).min(zone.free_pages())
            });
            moved += self.compact_zone(id, strategy, request, 1);
        }
        moved
    }

    pub fn compact_zone(
        &mut self,
        zone: usize,
        strategy: CompactionStrategy,
        request: usize,
        align_pages: usize,
    ) -> usize {
        match strategy {
            CompactionStrategy::Aggressive => self.compact_aggressive(zone),
            CompactionStrategy::Lazy => self.compact_lazy(zone, request, align_pages),
            CompactionStrategy::Smart => self.compact_smart(zone),
        }
    }

    fn compact_aggressive(&mut self, id: usize) -> usize {
        let Some(zone) = self.allocator.zone(id) else {
            return 0;
        };
        let (mut low, mut high) = (zone.start_page(), zone.end_page());
        let mut moved = 0;

        loop {
            let Some(zone) = self.allocator.zone(id) else {
                break;
            };
            let Some(to) = (low..high).find(|&page| zone.is_free(page)) else {
                break;
            };
            let Some(from) = (to + 1..high).rev().find(|&page| zone.is_movable(page)) else {
                break;
            };
            if self.move_within(id, PageMove { from, to }).is_ok() {
                moved += 1;
            }
            low = to + 1;
            high = from;
        }
        moved
    }

    /// Picks the `request`-page window with no pinned page and the fewest
    /// movable pages, then evicts those pages to free pages outside it.
    fn compact_lazy(&mut self, id: usize, request: usize, align_pages: usize) -> usize {
        let Some(zone) = self.allocator.zone(id) else {
            return 0;
        };
        if request == 0 || request > zone.total_pages() || zone.free_pages() < request {
            return 0;
        }

        let start = zone.start_page();
        let total = zone.total_pages();
        // prefix counts of pinned and movable pages
        let mut pinned = Vec::with_capacity(total + 1);
        let mut movable = Vec::with_capacity(total + 1);
        pinned.push(0usize);
        movable.push(0usize);
        for page in start..start + total {
            pinned.push(pinned[page - start] + zone.is_pinned(page) as usize);
            movable.push(movable[page - start] + zone.is_movable(page) as usize);
        }

        let mut best: Option<(usize, usize)> = None;
        let mut window = start.next_multiple_of(align_pages.max(1));
        while window + request <= start + total {
            let (lo, hi) = (window - start, window - start + request);
            if pinned[hi] == pinned[lo] {
                let cost = movable[hi] - movable[lo];
                if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                    best = Some((window, cost));
                }
            }
            window += align_pages.max(1);
        }

        let Some((window, cost)) = best else {
            debug!("zone {}: every {}-page window holds a pinned page", id, request);
            return 0;
        };
        if cost == 0 {
            return 0;
        }

        let evict: Vec<usize> = (window..window + request)
            .filter(|&page| zone.is_movable(page))
            .collect();
        let targets: Vec<usize> = (start..start + total)
            .filter(|&page| !(window..window + request).contains(&page) && zone.is_free(page))
            .take(evict.len())
            .collect();

        let mut moved = 0;
        for (from, to) in evict.into_iter().zip(targets) {
            if self.move_within(id, PageMove { from, to }).is_ok() {
                moved += 1;
            }
        }
        moved
    }

    fn compact_smart(&mut self, id: usize) -> usize {
        let Some(info) = self.allocator.analyze_fragmentation(id) else {
            return 0;
        };
        let moves = self.policy.predict_moves(&info);
        let mut moved = 0;

        for page_move in moves {
            match self.move_within(id, page_move) {
                Ok(()) => moved += 1,
                Err(err) => warn!(
                    "skipping move {:#x} -> {:#x}: {}",
                    page_move.from, page_move.to, err
                ),
            }
        }
        moved
    }

    /// Checks a move against the current bitmap of zone `id`.
    pub fn validate_move(&self, id: usize, page_move: PageMove) -> Result<(), MoveError> {
        let zone = self.allocator.zone(id).ok_or(MoveError::OutOfZone)?;
        let PageMove { from, to } = page_move;

        if !zone.contains(from) || !zone.contains(to) {
            return Err(MoveError::OutOfZone);
        }
        if from == to {
            return Err(MoveError::SamePage);
        }
        if zone.is_free(from) {
            return Err(MoveError::SourceNotUsed);
        }
        if !zone.is_movable(from) {
            return Err(MoveError::SourcePinned);
        }
        if !zone.is_free(to) {
            return Err(MoveError::DestinationInUse);
        }
        Ok(())
    }

    /// Relocates one page, wherever it lives.
    pub fn move_page(&mut self, page_move: PageMove) -> Result<(), MoveError> {
        let id = self
            .allocator
            .zone_of(page_move.from)
            .ok_or(MoveError::OutOfZone)?;
        self.move_within(id, page_move)
    }

    fn move_within(&mut self, id: usize, page_move: PageMove) -> Result<(), MoveError> {
        self.validate_move(id, page_move)?;
        let PageMove { from, to } = page_move;

        self.cpu.copy_page(page_address(from), page_address(to));
        if let Some(zone) = self.allocator.zone_mut(id) {
            zone.relocate(from, to);
        }
        self.allocator.stats_mut().pages_moved += 1;

        if let Some(listener) = self.listener {
            listener.on_page_moved(from, to);
        }
        Ok(())
    }
}
