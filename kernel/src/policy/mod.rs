//! Advisory decisions for the allocator and the scheduler.
//!
//! A [`Policy`] only ever advises. Every value it returns is treated as
//! untrusted input: zone indices and alignments are clamped by the allocator,
//! page moves are validated by the compactor, resource hints are clamped by
//! process creation and scheduling decisions are checked against the ready
//! queue. A policy returning garbage can waste work but cannot break the
//! accounting or lifecycle invariants.

mod round_robin;

pub use round_robin::{plan_moves, RoundRobinPolicy};

use alloc::vec::Vec;

use crate::{
    constants::{
        memory::{DEFAULT_ZONE, PAGE_SIZE},
        processes::{DEFAULT_HEAP_PAGES, DEFAULT_STACK_PAGES},
    },
    memory::{
        compaction::{CompactionStrategy, FragmentationInfo, PageMove},
        PageRange,
    },
    processes::process::Pid,
    scheduler::ready_queue::ReadyQueue,
};

/// Where and how an allocation should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHint {
    pub preferred_zone: usize,
    /// Byte alignment of the returned base address.
    pub alignment: u64,
    pub contiguous: bool,
    pub cache_line_aligned: bool,
}

impl Default for AllocationHint {
    fn default() -> Self {
        Self {
            preferred_zone: DEFAULT_ZONE,
            alignment: PAGE_SIZE,
            contiguous: true,
            cache_line_aligned: false,
        }
    }
}

/// Pages a new process should get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHint {
    pub stack_pages: usize,
    pub heap_pages: usize,
}

impl Default for ResourceHint {
    fn default() -> Self {
        Self {
            stack_pages: DEFAULT_STACK_PAGES,
            heap_pages: DEFAULT_HEAP_PAGES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingDecision {
    /// Keep the current process. `quantum` optionally replaces its remaining
    /// time slice.
    Continue { quantum: Option<u32> },
    SwitchTo(Pid),
    Idle,
    /// Reserved for multi-core placement. Single-core builds ignore it.
    Migrate { pid: Pid, target_core: u32 },
}

pub trait Policy: Send + Sync {
    fn predict_allocation(&self, pages: usize) -> AllocationHint;

    fn get_compaction_strategy(&self, fragmentation: &FragmentationInfo) -> CompactionStrategy;

    fn predict_moves(&self, fragmentation: &FragmentationInfo) -> Vec<PageMove>;

    fn predict_resources(&self, process_name: &str) -> ResourceHint;

    /// Called with a snapshot of the ready queue; must not block.
    fn make_decision(&self, ready_queue: &ReadyQueue, current: Option<Pid>) -> SchedulingDecision;

    fn record_allocation(&self, _range: PageRange) {}

    fn record_free(&self, _range: PageRange) {}

    fn record_creation(&self, _pid: Pid, _name: &str) {}

    fn record_exit(&self, _pid: Pid, _exit_code: i32) {}
}
