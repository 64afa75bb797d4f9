use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    memory::{
        compaction::{CompactionStrategy, FragmentationInfo, PageMove},
        PageRange,
    },
    processes::process::Pid,
    scheduler::ready_queue::ReadyQueue,
};

use super::{AllocationHint, Policy, ResourceHint, SchedulingDecision};

/// Deterministic reference policy.
///
/// First-fit placement in the default zone, a fixed compaction strategy,
/// fixed resource hints and FIFO round-robin scheduling: the head of the ready
/// queue always gets the CPU next, and the preempted process goes to the back.
pub struct RoundRobinPolicy {
    strategy: CompactionStrategy,
    resources: ResourceHint,
    allocations: AtomicU64,
    exits: AtomicU64,
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            strategy: CompactionStrategy::Smart,
            resources: ResourceHint::default(),
            allocations: AtomicU64::new(0),
            exits: AtomicU64::new(0),
        }
    }

    pub fn with_strategy(mut self, strategy: CompactionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_resources(mut self, resources: ResourceHint) -> Self {
        self.resources = resources;
        self
    }

    pub fn allocations_seen(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn exits_seen(&self) -> u64 {
        self.exits.load(Ordering::Relaxed)
    }
}

/// Pairs the lowest free pages with the highest used pages until they cross,
/// packing used pages toward the bottom of the zone.
///
/// The plan does not know which pages are pinned; the compactor drops the
/// moves it cannot perform.
pub fn plan_moves(info: &FragmentationInfo) -> Vec<PageMove> {
    let zone_end = info.zone_start + info.total_pages;
    let free = info
        .free_runs
        .iter()
        .flat_map(|run| run.start..run.start + run.pages);
    let used = (info.zone_start..zone_end)
        .rev()
        .filter(|&page| !info.is_free(page));

    free.zip(used)
        .take_while(|(to, from)| to < from)
        .map(|(to, from)| PageMove { from, to })
        .collect()
}

impl Policy for RoundRobinPolicy {
    fn predict_allocation(&self, _pages: usize) -> AllocationHint {
        AllocationHint::default()
    }

    fn get_compaction_strategy(&self, _fragmentation: &FragmentationInfo) -> CompactionStrategy {
        self.strategy
    }

    fn predict_moves(&self, fragmentation: &FragmentationInfo) -> Vec<PageMove> {
        plan_moves(fragmentation)
    }

    fn predict_resources(&self, _process_name: &str) -> ResourceHint {
        self.resources
    }

    fn make_decision(&self, ready_queue: &ReadyQueue, current: Option<Pid>) -> SchedulingDecision {
        match ready_queue.front() {
            Some(next) => SchedulingDecision::SwitchTo(next.pid),
            None if current.is_some() => SchedulingDecision::Continue { quantum: None },
            None => SchedulingDecision::Idle,
        }
    }

    fn record_allocation(&self, _range: PageRange) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_exit(&self, _pid: Pid, _exit_code: i32) {
        self.exits.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::compaction::FreeRun;
    use alloc::vec;

    fn info(free_runs: Vec<FreeRun>) -> FragmentationInfo {
        FragmentationInfo::from_runs(0, 100, 10, free_runs)
    }

    #[test]
    fn round_robin_picks_queue_head() {
        let policy = RoundRobinPolicy::new();
        let mut queue = ReadyQueue::new();
        queue.push_back(Pid(2), 0);
        queue.push_back(Pid(3), 0);
        assert_eq!(
            policy.make_decision(&queue, Some(Pid(1))),
            SchedulingDecision::SwitchTo(Pid(2))
        );
    }

    #[test]
    fn empty_queue_continues_or_idles() {
        let policy = RoundRobinPolicy::new();
        let queue = ReadyQueue::new();
        assert_eq!(
            policy.make_decision(&queue, Some(Pid(1))),
            SchedulingDecision::Continue { quantum: None }
        );
        assert_eq!(policy.make_decision(&queue, None), SchedulingDecision::Idle);
    }

    #[test]
    fn plan_fills_low_holes_from_the_top() {
        // zone 100..110, free pages 101, 103 and 108..110
        let runs = vec![
            FreeRun { start: 101, pages: 1 },
            FreeRun { start: 103, pages: 1 },
            FreeRun { start: 108, pages: 2 },
        ];
        let moves = plan_moves(&info(runs));
        assert_eq!(
            moves,
            [PageMove { from: 107, to: 101 }, PageMove { from: 106, to: 103 }]
        );
    }

    #[test]
    fn plan_is_empty_for_packed_zone() {
        let runs = vec![FreeRun { start: 104, pages: 6 }];
        assert!(plan_moves(&info(runs)).is_empty());
    }

    #[test]
    fn bookkeeping_counters() {
        let policy = RoundRobinPolicy::new();
        policy.record_allocation(PageRange::new(0, 1));
        policy.record_exit(Pid(4), 0);
        assert_eq!(policy.allocations_seen(), 1);
        assert_eq!(policy.exits_seen(), 1);
    }
}
