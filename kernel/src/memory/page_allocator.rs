//! Zoned bitmap page allocator.
//!
//! - Builds one [`Zone`] per usable boot memory region
//! - Serves contiguous first-fit allocations, preferred zone first
//! - Validates every [`AllocationHint`] before acting on it

use alloc::vec::Vec;
use log::{info, warn};

use crate::{
    constants::memory::{DEFAULT_ZONE, MAX_ALIGNMENT, MAX_MEMORY_ZONES, PAGE_SIZE},
    error::KernelError,
    policy::AllocationHint,
};

use super::{
    zone::{MemoryRegion, RegionKind, Zone, ZoneInfo},
    Mobility, PageRange,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocations: u64,
    pub frees: u64,
    pub compactions: u64,
    pub pages_moved: u64,
    pub oom_failures: u64,
}

pub struct PageAllocator {
    zones: Vec<Zone>,
    stats: MemoryStats,
}

impl PageAllocator {
    /// Registers a zone for every usable region of the memory map, in order.
    ///
    /// Regions that cover no whole page, overlap an earlier zone, or exceed
    /// `MAX_MEMORY_ZONES` are skipped.
    pub fn new(regions: &[MemoryRegion]) -> Result<Self, KernelError> {
        let mut zones: Vec<Zone> = Vec::new();

        for region in regions.iter().filter(|r| r.kind == RegionKind::Usable) {
            let pages = region.page_range();
            if pages.count == 0 {
                warn!("skipping region {:#x}+{:#x}: no whole page", region.base, region.length);
                continue;
            }
            if zones.iter().any(|zone| zone.pages().overlaps(&pages)) {
                warn!("skipping region {:#x}+{:#x}: overlaps a zone", region.base, region.length);
                continue;
            }
            if zones.len() == MAX_MEMORY_ZONES {
                warn!("zone limit of {} reached, ignoring remaining regions", MAX_MEMORY_ZONES);
                break;
            }

            info!(
                "zone {}: {:#x} - {:#x} ({} pages)",
                zones.len(),
                pages.start_address().as_u64(),
                pages.end_address().as_u64(),
                pages.count
            );
            zones.push(Zone::new(zones.len(), pages));
        }

        if zones.is_empty() {
            return Err(KernelError::NoUsableMemory);
        }

        Ok(Self {
            zones,
            stats: MemoryStats::default(),
        })
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, id: usize) -> Option<&Zone> {
        self.zones.get(id)
    }

    pub fn zone_info(&self, id: usize) -> Option<ZoneInfo> {
        self.zones.get(id).map(Zone::info)
    }

    pub(crate) fn zone_mut(&mut self, id: usize) -> Option<&mut Zone> {
        self.zones.get_mut(id)
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn total_pages(&self) -> usize {
        self.zones.iter().map(Zone::total_pages).sum()
    }

    pub fn free_pages(&self) -> usize {
        self.zones.iter().map(Zone::free_pages).sum()
    }

    pub fn used_pages(&self) -> usize {
        self.zones.iter().map(Zone::used_pages).sum()
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut MemoryStats {
        &mut self.stats
    }

    /// Zone holding `page`, if any.
    pub fn zone_of(&self, page: usize) -> Option<usize> {
        self.zones.iter().position(|zone| zone.contains(page))
    }

    /// Zone holding all of `range`, if a single one does.
    pub fn zone_of_range(&self, range: PageRange) -> Option<usize> {
        self.zones.iter().position(|zone| zone.contains_range(range))
    }

    /// Clamps policy output into something the allocator can honour.
    pub fn sanitize_hint(&self, hint: AllocationHint) -> AllocationHint {
        let mut hint = hint;

        if hint.preferred_zone >= self.zones.len() {
            warn!(
                "hint names zone {} but only {} exist, using zone {}",
                hint.preferred_zone,
                self.zones.len(),
                DEFAULT_ZONE
            );
            hint.preferred_zone = DEFAULT_ZONE;
        }

        if !hint.alignment.is_power_of_two() || hint.alignment > MAX_ALIGNMENT {
            warn!("hint alignment {:#x} is invalid, using page alignment", hint.alignment);
            hint.alignment = PAGE_SIZE;
        } else if hint.alignment < PAGE_SIZE {
            hint.alignment = PAGE_SIZE;
        }

        hint
    }

    /// Zone indices in search order: the preferred zone, then the rest in
    /// registration order.
    fn search_order(&self, preferred: usize) -> impl Iterator<Item = usize> {
        let count = self.zones.len();
        core::iter::once(preferred)
            .filter(move |&id| id < count)
            .chain((0..count).filter(move |&id| id != preferred))
    }

    /// One first-fit pass over every zone. `hint` must already be sanitized.
    pub fn try_alloc(
        &mut self,
        count: usize,
        hint: &AllocationHint,
        mobility: Mobility,
    ) -> Option<PageRange> {
        let align_pages = (hint.alignment / PAGE_SIZE).max(1) as usize;

        for id in self.search_order(hint.preferred_zone) {
            let zone = &mut self.zones[id];
            if zone.free_pages() < count {
                continue;
            }
            if let Some(start) = zone.find_free_run(count, align_pages) {
                let range = PageRange::new(start, count);
                zone.mark_used(range, mobility);
                self.stats.allocations += 1;
                return Some(range);
            }
        }
        None
    }

    /// True when some zone has enough free pages in total, so a failed
    /// allocation is down to fragmentation rather than exhaustion.
    pub fn has_fragmented_capacity(&self, count: usize) -> bool {
        self.zones.iter().any(|zone| zone.free_pages() >= count)
    }

    /// Zones worth compacting for a `count`-page request, in search order.
    pub fn compaction_candidates(&self, count: usize, preferred: usize) -> Vec<usize> {
        self.search_order(preferred)
            .filter(|&id| self.zones[id].free_pages() >= count)
            .collect()
    }

    /// Returns pages to their zone. The range must come from an allocation
    /// that has not been freed yet.
    pub fn free(&mut self, range: PageRange) -> Result<usize, KernelError> {
        if range.count == 0 {
            return Err(KernelError::InvalidPageCount(0));
        }
        let zone = self
            .zones
            .iter_mut()
            .find(|zone| zone.contains_range(range))
            .ok_or(KernelError::RangeOutsideZones {
                start: range.start,
                count: range.count,
            })?;

        let freed = zone.mark_free(range);
        self.stats.frees += 1;
        Ok(freed)
    }

    /// Marks boot-owned pages (kernel image, firmware tables) as used and pinned.
    pub fn reserve(&mut self, range: PageRange) -> Result<(), KernelError> {
        let zone = self
            .zones
            .iter_mut()
            .find(|zone| zone.contains_range(range))
            .ok_or(KernelError::RangeOutsideZones {
                start: range.start,
                count: range.count,
            })?;

        if !zone.is_range_free(range) {
            return Err(KernelError::RangeInUse {
                start: range.start,
                count: range.count,
            });
        }
        zone.mark_used(range, Mobility::Pinned);
        info!("reserved {} in zone {}", range, zone.id());
        Ok(())
    }
}
