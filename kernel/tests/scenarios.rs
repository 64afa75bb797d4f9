use std::sync::{Arc, Mutex};

use kcore::{
    arch::sim::SimulatedCpu,
    invariants::check_all_invariants,
    logging,
    memory::{page_address, PageRange},
    policy::plan_moves,
    AllocationHint, CompactionStrategy, FragmentationInfo, KernelConfig, KernelError,
    KernelState, MemoryRegion, PageMove, PageMoveListener, Pid, Policy, ProcessState,
    ReadyQueue, ResourceHint, RoundRobinPolicy, SchedulingDecision, WaitStatus,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use x86_64::VirtAddr;

const PAGE: u64 = 4096;

type Kernel<P = RoundRobinPolicy> = KernelState<P, SimulatedCpu>;

fn stderr_sink(line: &str) {
    eprintln!("{}", line);
}

/// Zone 0 is a single page that the idle stack takes; zone 1 holds 100
/// pages starting at page 16.
fn two_zone_map() -> [MemoryRegion; 3] {
    [
        MemoryRegion::usable(0, PAGE),
        MemoryRegion::reserved(PAGE, 15 * PAGE),
        MemoryRegion::usable(16 * PAGE, 100 * PAGE),
    ]
}

fn boot<P: Policy>(regions: &[MemoryRegion], config: KernelConfig, policy: P) -> Kernel<P> {
    let _ = logging::init(0, stderr_sink);
    KernelState::new(config, regions, policy, SimulatedCpu::new()).unwrap()
}

fn zone_hint(zone: usize) -> AllocationHint {
    AllocationHint {
        preferred_zone: zone,
        ..AllocationHint::default()
    }
}

fn assert_consistent<P: Policy>(kernel: &Kernel<P>) {
    let violations = check_all_invariants(kernel);
    assert!(violations.is_empty(), "{:#?}", violations);
}

#[derive(Default)]
struct MoveLog(Mutex<Vec<(usize, usize)>>);

impl PageMoveListener for MoveLog {
    fn on_page_moved(&self, from: usize, to: usize) {
        self.0.lock().unwrap().push((from, to));
    }
}

impl MoveLog {
    fn take(&self) -> Vec<(usize, usize)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Follows relocations so the holder of a movable page keeps the right index.
fn follow_moves(owned: &mut [PageRange], moves: &[(usize, usize)]) {
    for &(from, to) in moves {
        if let Some(range) = owned.iter_mut().find(|r| r.count == 1 && r.start == from) {
            range.start = to;
        }
    }
}

#[test]
fn scenario_a_simple_allocation() {
    let kernel = boot(&two_zone_map(), KernelConfig::default(), RoundRobinPolicy::new());
    let zone = kernel.zone_info(1).unwrap();
    assert_eq!((zone.free_pages, zone.used_pages), (100, 0));

    let range = kernel.alloc_pages(10, zone_hint(1)).unwrap();
    assert_eq!(range.count, 10);

    let zone = kernel.zone_info(1).unwrap();
    assert_eq!((zone.free_pages, zone.used_pages), (90, 10));
    assert_consistent(&kernel);
}

#[test]
fn scenario_b_exhaustion_skips_compaction() {
    let kernel = boot(&two_zone_map(), KernelConfig::default(), RoundRobinPolicy::new());
    assert_eq!(
        kernel.alloc_pages(101, zone_hint(1)),
        Err(KernelError::OutOfMemory { requested: 101 })
    );
    let stats = kernel.stats().memory;
    assert_eq!(stats.compactions, 0);
    assert_eq!(stats.oom_failures, 1);
    assert_eq!(kernel.zone_info(1).unwrap().free_pages, 100);
}

#[test]
fn scenario_c_fragmentation_is_compacted_away() {
    let moves = Arc::new(MoveLog::default());
    let kernel = boot(&two_zone_map(), KernelConfig::default(), RoundRobinPolicy::new())
        .with_page_move_listener(moves.clone());

    let mut owned: Vec<PageRange> = (0..100)
        .map(|_| kernel.alloc_pages(1, zone_hint(1)).unwrap())
        .collect();
    let (kept, freed): (Vec<PageRange>, Vec<PageRange>) =
        owned.drain(..).partition(|range| range.start % 2 == 1);
    for range in freed {
        kernel.free_pages(range);
    }
    owned = kept;

    let info = kernel.fragmentation(1).unwrap();
    assert_eq!(info.free_pages, 50);
    assert_eq!(info.largest_free_block, 1);

    kernel.cpu().write_page_tag(page_address(115), 0xc0ffee);
    let range = kernel.alloc_pages(8, zone_hint(1)).unwrap();
    assert_eq!(range.count, 8);

    let stats = kernel.stats().memory;
    assert_eq!(stats.compactions, 1);
    assert_eq!(stats.pages_moved, 25);
    assert_eq!(kernel.cpu().page_tag(page_address(16)), Some(0xc0ffee));

    let relocations = moves.take();
    assert_eq!(relocations.len(), 25);
    follow_moves(&mut owned, &relocations);
    assert!(owned.iter().all(|page| !page.overlaps(&range)));
    assert_consistent(&kernel);

    // every holder still owns exactly one used page
    for page in owned {
        assert_eq!(kernel.free_pages(page), 1);
    }
    kernel.free_pages(range);
    assert_eq!(kernel.zone_info(1).unwrap().free_pages, 100);
}

#[test]
fn pinned_fragmentation_still_runs_out() {
    let kernel = boot(&two_zone_map(), KernelConfig::default(), RoundRobinPolicy::new());
    let pages: Vec<PageRange> = (0..100)
        .map(|_| kernel.alloc_pinned_pages(1, zone_hint(1)).unwrap())
        .collect();
    for range in pages.iter().step_by(2) {
        kernel.free_pages(*range);
    }

    assert_eq!(
        kernel.alloc_pages(2, zone_hint(1)),
        Err(KernelError::OutOfMemory { requested: 2 })
    );
    let stats = kernel.stats().memory;
    assert_eq!(stats.compactions, 1);
    assert_eq!(stats.pages_moved, 0);
}

#[test]
fn alloc_then_free_restores_counters() {
    let kernel = boot(&two_zone_map(), KernelConfig::default(), RoundRobinPolicy::new());
    kernel.alloc_pages(7, zone_hint(1)).unwrap();
    for count in [1, 3, 16, 50] {
        let before = kernel.zone_info(1).unwrap();
        let range = kernel.alloc_pages(count, zone_hint(1)).unwrap();
        kernel.free_pages(range);
        assert_eq!(kernel.zone_info(1).unwrap(), before);
    }
}

#[test]
fn aligned_allocation_honours_the_hint() {
    let kernel = boot(&two_zone_map(), KernelConfig::default(), RoundRobinPolicy::new());
    kernel.alloc_pages(1, zone_hint(1)).unwrap();
    let hint = AllocationHint {
        preferred_zone: 1,
        alignment: 32 * PAGE,
        ..AllocationHint::default()
    };
    let range = kernel.alloc_pages(4, hint).unwrap();
    assert_eq!(range.start_address().as_u64() % (32 * PAGE), 0);
}

#[test]
fn scenario_d_round_robin_under_timer_ticks() {
    let kernel = boot(
        &[MemoryRegion::usable(0, 256 * PAGE)],
        KernelConfig::default().with_default_quantum(2),
        RoundRobinPolicy::new(),
    );
    let entries = [0x40_1000u64, 0x40_2000, 0x40_3000];
    let pids: Vec<Pid> = entries
        .iter()
        .zip(["p1", "p2", "p3"])
        .map(|(&entry, name)| kernel.process_create(name, VirtAddr::new(entry), 5).unwrap())
        .collect();

    let mut order: Vec<Pid> = Vec::new();
    for _ in 0..13 {
        kernel.timer_tick();
        let current = kernel.current().unwrap();
        if order.last() != Some(&current) {
            order.push(current);
        }
        assert_consistent(&kernel);
    }
    assert_eq!(
        order[..6],
        [pids[0], pids[1], pids[2], pids[0], pids[1], pids[2]]
    );

    // each process resumes exactly where its saved context says
    let resumed: Vec<u64> = kernel
        .cpu()
        .switch_log()
        .iter()
        .map(|record| record.to_rip)
        .collect();
    assert_eq!(resumed[..4], [entries[0], entries[1], entries[2], entries[0]]);

    let p1 = kernel.process_info(pids[0]).unwrap();
    assert!(p1.stats.cpu_time >= 4);
    assert_eq!(p1.stats.context_switches, 3);
}

#[test]
fn scenario_e_exit_returns_stack_and_heap() {
    let policy = RoundRobinPolicy::new().with_resources(ResourceHint {
        stack_pages: 4,
        heap_pages: 8,
    });
    let kernel = boot(&[MemoryRegion::usable(0, 128 * PAGE)], KernelConfig::default(), policy);
    let pid = kernel
        .process_create("worker", VirtAddr::new(0x40_0000), 0)
        .unwrap();
    kernel.yield_now();
    assert_eq!(kernel.current(), Some(pid));

    let info = kernel.process_info(pid).unwrap();
    assert_eq!(info.stack.map(|r| r.count), Some(4));
    assert_eq!(info.heap.map(|r| r.count), Some(8));

    let before = kernel.zone_info(0).unwrap().free_pages;
    kernel.process_exit(0).unwrap();
    let after = kernel.zone_info(0).unwrap().free_pages;
    assert_eq!(after - before, 12);
    assert_eq!(kernel.policy().exits_seen(), 1);

    // off the CPU and without a parent, the zombie goes at the next schedule
    assert_eq!(kernel.current(), None);
    assert_eq!(kernel.process_info(pid).unwrap().state, ProcessState::Zombie);
    kernel.yield_now();
    assert!(kernel.process_info(pid).is_none());
    assert_consistent(&kernel);
}

#[test]
fn parent_collects_child_exit_code() {
    let kernel = boot(&[MemoryRegion::usable(0, 128 * PAGE)], KernelConfig::default(), RoundRobinPolicy::new());
    let parent = kernel.process_create("parent", VirtAddr::new(0x1000), 0).unwrap();
    kernel.yield_now();
    let child = kernel.process_create("child", VirtAddr::new(0x2000), 0).unwrap();

    assert_eq!(kernel.process_wait(child), Ok(WaitStatus::Pending));
    assert_eq!(kernel.current(), Some(child));
    assert_eq!(kernel.process_info(parent).unwrap().state, ProcessState::Blocked);

    kernel.process_exit(42).unwrap();
    assert_eq!(kernel.current(), Some(parent));
    assert_eq!(kernel.process_wait(child), Ok(WaitStatus::Exited(42)));
    assert!(kernel.process_info(child).is_none());
    assert_eq!(kernel.process_wait(child), Err(KernelError::NoSuchProcess(child)));
    assert_consistent(&kernel);
}

#[test]
#[should_panic(expected = "corrupted context")]
fn corrupted_context_is_fatal() {
    let kernel = boot(&[MemoryRegion::usable(0, 64 * PAGE)], KernelConfig::default(), RoundRobinPolicy::new());
    let pid = kernel.process_create("victim", VirtAddr::new(0x1000), 0).unwrap();
    kernel.with_saved_context(pid, |ctx| ctx.rsp = 0xdead_0000).unwrap();
    kernel.yield_now();
}

/// Returns nonsense for every question it is asked.
struct HostilePolicy;

impl Policy for HostilePolicy {
    fn predict_allocation(&self, _pages: usize) -> AllocationHint {
        AllocationHint {
            preferred_zone: 99,
            alignment: 3,
            contiguous: false,
            cache_line_aligned: true,
        }
    }

    fn get_compaction_strategy(&self, _fragmentation: &FragmentationInfo) -> CompactionStrategy {
        CompactionStrategy::Smart
    }

    fn predict_moves(&self, fragmentation: &FragmentationInfo) -> Vec<PageMove> {
        let start = fragmentation.zone_start;
        let mut moves = vec![
            PageMove { from: start, to: start },
            PageMove { from: 10_000, to: start },
            PageMove { from: start + 1, to: start + 3 },
        ];
        moves.extend(plan_moves(fragmentation));
        moves
    }

    fn predict_resources(&self, _process_name: &str) -> ResourceHint {
        ResourceHint {
            stack_pages: 0,
            heap_pages: usize::MAX,
        }
    }

    fn make_decision(&self, _ready_queue: &ReadyQueue, _current: Option<Pid>) -> SchedulingDecision {
        SchedulingDecision::SwitchTo(Pid(999))
    }
}

#[test]
fn hostile_policy_cannot_break_invariants() {
    let kernel = boot(
        &[MemoryRegion::usable(0, 64 * PAGE)],
        KernelConfig::default().with_max_heap_pages(4),
        HostilePolicy,
    );

    let page = kernel.pmm_alloc_pages(1).unwrap();
    assert_eq!(page.count, 1);

    let pid = kernel.process_create("victim", VirtAddr::new(0x1000), 0).unwrap();
    let info = kernel.process_info(pid).unwrap();
    assert_eq!(info.stack.map(|r| r.count), Some(1));
    assert_eq!(info.heap.map(|r| r.count), Some(4));

    // SwitchTo(999) falls back to the head of the queue
    kernel.yield_now();
    assert_eq!(kernel.current(), Some(pid));
    assert_consistent(&kernel);

    // fragment the rest and let the bogus move list drive compaction
    let singles: Vec<PageRange> = std::iter::from_fn(|| kernel.pmm_alloc_pages(1)).collect();
    for range in singles.iter().step_by(2) {
        kernel.pmm_free_pages(*range);
    }
    let moved = kernel.compact(CompactionStrategy::Smart);
    assert!(moved > 0);
    assert_consistent(&kernel);
}

#[test]
fn explicit_compaction_strategies_keep_accounting() {
    for strategy in [
        CompactionStrategy::Aggressive,
        CompactionStrategy::Lazy,
        CompactionStrategy::Smart,
    ] {
        let kernel = boot(&two_zone_map(), KernelConfig::default(), RoundRobinPolicy::new());
        let pages: Vec<PageRange> = (0..40)
            .map(|_| kernel.alloc_pages(1, zone_hint(1)).unwrap())
            .collect();
        for range in pages.iter().step_by(3) {
            kernel.free_pages(*range);
        }
        let before = kernel.fragmentation(1).unwrap();
        let moved = kernel.compact(strategy);
        let after = kernel.fragmentation(1).unwrap();

        assert!(moved > 0, "{:?} moved nothing", strategy);
        assert_eq!(after.free_pages, before.free_pages);
        assert!(after.largest_free_block > before.largest_free_block);
        assert_consistent(&kernel);
    }
}

#[test]
fn randomized_operations_preserve_invariants() {
    let moves = Arc::new(MoveLog::default());
    let kernel = boot(
        &[
            MemoryRegion::usable(0, 96 * PAGE),
            MemoryRegion::reserved(96 * PAGE, 32 * PAGE),
            MemoryRegion::usable(128 * PAGE, 160 * PAGE),
        ],
        KernelConfig::default()
            .with_max_processes(12)
            .with_default_quantum(3),
        RoundRobinPolicy::new().with_resources(ResourceHint {
            stack_pages: 2,
            heap_pages: 3,
        }),
    )
    .with_page_move_listener(moves.clone());

    let mut rng = SmallRng::seed_from_u64(0x6b63_6f72_65);
    let mut owned: Vec<PageRange> = Vec::new();
    let mut entry = 0x40_0000u64;
    let mut created: Vec<Pid> = Vec::new();

    for step in 0..3000 {
        match rng.gen_range(0..10) {
            0..=2 => {
                let count = if rng.gen_bool(0.6) { 1 } else { rng.gen_range(2..12) };
                let hint = zone_hint(rng.gen_range(0..3));
                if let Ok(range) = kernel.alloc_pages(count, hint) {
                    owned.push(range);
                }
            }
            3 | 4 if !owned.is_empty() => {
                let range = owned.swap_remove(rng.gen_range(0..owned.len()));
                assert_eq!(kernel.free_pages(range), range.count, "step {}", step);
            }
            5 => {
                entry += 0x1000;
                if let Ok(pid) = kernel.process_create("worker", VirtAddr::new(entry), 0) {
                    created.push(pid);
                }
            }
            6 => {
                if kernel.current().is_some() {
                    kernel.process_exit(step).unwrap();
                }
            }
            7 => {
                if kernel.current().is_some() && rng.gen_bool(0.3) {
                    kernel.block_current().unwrap();
                }
                let blocked = created.iter().copied().find(|&pid| {
                    kernel
                        .process_info(pid)
                        .is_some_and(|info| info.state == ProcessState::Blocked)
                });
                if let Some(pid) = blocked {
                    // a full queue just delays the wake-up to a later step
                    let _ = kernel.wake_from_interrupt(pid);
                }
            }
            8 => {
                let strategy = match rng.gen_range(0..3) {
                    0 => CompactionStrategy::Aggressive,
                    1 => CompactionStrategy::Lazy,
                    _ => CompactionStrategy::Smart,
                };
                kernel.compact(strategy);
            }
            _ => kernel.timer_tick(),
        }

        follow_moves(&mut owned, &moves.take());
        assert_consistent(&kernel);
        for (index, range) in owned.iter().enumerate() {
            for other in &owned[index + 1..] {
                assert!(!range.overlaps(other), "step {}: {} overlaps {}", step, range, other);
            }
        }
    }

    for range in owned {
        kernel.free_pages(range);
    }
    assert_consistent(&kernel);
}
