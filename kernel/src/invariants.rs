//! Runtime-checkable invariants of the kernel core.
//!
//! Used by tests after every step of a scenario, and available to debug
//! builds that want to assert consistency at a known quiescent point.
//!
//! # Invariants
//!
//! 1. **Zone accounting**: `free + used == total` for every zone, and the
//!    zone totals add up to the system total
//! 2. **Bitmap population**: a zone's used counter matches its bitmap
//! 3. **Ready queue membership**: a process is queued exactly once iff it is
//!    `Ready`
//! 4. **Single runner**: at most one process is `Running`, and it is the
//!    current one
//! 5. **Process pages**: every page range a PCB owns is used, pinned, inside
//!    one zone and disjoint from every other owned range

use alloc::{format, string::String, vec::Vec};

use crate::{
    arch::Cpu,
    kernel::KernelState,
    memory::{page_allocator::PageAllocator, PageRange},
    policy::Policy,
    processes::process::{Pid, ProcessState},
    scheduler::Scheduler,
};

#[derive(Clone, Debug)]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub description: String,
}

/// Returns every violation found, empty when the state is consistent.
///
/// Meant to be called between kernel operations: in the middle of an exit or
/// a block the running process is briefly neither `Running` nor queued.
pub fn check_all_invariants<P: Policy, C: Cpu>(state: &KernelState<P, C>) -> Vec<InvariantViolation> {
    let idle_stack = state.idle_stack();
    state.inspect(|allocator, scheduler| {
        let mut violations = Vec::new();
        violations.extend(check_zone_accounting(allocator));
        violations.extend(check_bitmap_population(allocator));
        violations.extend(check_ready_queue_membership(scheduler));
        violations.extend(check_single_runner(scheduler));
        violations.extend(check_process_pages(allocator, scheduler, idle_stack));
        violations
    })
}

fn violation(invariant: &'static str, description: String) -> InvariantViolation {
    InvariantViolation {
        invariant,
        description,
    }
}

/// Invariant 1
fn check_zone_accounting(allocator: &PageAllocator) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for zone in allocator.zones() {
        if zone.free_pages() + zone.used_pages() != zone.total_pages() {
            violations.push(violation(
                "zone_accounting",
                format!(
                    "zone {}: {} free + {} used != {} total",
                    zone.id(),
                    zone.free_pages(),
                    zone.used_pages(),
                    zone.total_pages()
                ),
            ));
        }
    }

    let sum = allocator.free_pages() + allocator.used_pages();
    if sum != allocator.total_pages() {
        violations.push(violation(
            "zone_accounting",
            format!("system: {} accounted pages of {}", sum, allocator.total_pages()),
        ));
    }

    violations
}

/// Invariant 2
fn check_bitmap_population(allocator: &PageAllocator) -> Vec<InvariantViolation> {
    allocator
        .zones()
        .iter()
        .filter(|zone| zone.bitmap_population() != zone.used_pages())
        .map(|zone| {
            violation(
                "bitmap_population",
                format!(
                    "zone {}: bitmap has {} pages set, counter says {}",
                    zone.id(),
                    zone.bitmap_population(),
                    zone.used_pages()
                ),
            )
        })
        .collect()
}

/// Invariant 3
fn check_ready_queue_membership(scheduler: &Scheduler) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let queued: Vec<Pid> = scheduler.ready().iter().map(|entry| entry.pid).collect();

    for (index, pid) in queued.iter().enumerate() {
        if queued[..index].contains(pid) {
            violations.push(violation(
                "ready_queue_membership",
                format!("process {} is queued twice", pid),
            ));
        }
        match scheduler.table().get(*pid) {
            Some(pcb) if pcb.state() == ProcessState::Ready => {}
            Some(pcb) => violations.push(violation(
                "ready_queue_membership",
                format!("process {} is queued while {:?}", pid, pcb.state()),
            )),
            None => violations.push(violation(
                "ready_queue_membership",
                format!("queued process {} does not exist", pid),
            )),
        }
    }

    for pcb in scheduler.table().iter() {
        if pcb.state() == ProcessState::Ready && !queued.contains(&pcb.pid()) {
            violations.push(violation(
                "ready_queue_membership",
                format!("process {} is ready but not queued", pcb.pid()),
            ));
        }
    }

    violations
}

/// Invariant 4
fn check_single_runner(scheduler: &Scheduler) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let running: Vec<Pid> = scheduler
        .table()
        .iter()
        .filter(|pcb| pcb.state() == ProcessState::Running)
        .map(|pcb| pcb.pid())
        .collect();

    if running.len() > 1 {
        violations.push(violation(
            "single_runner",
            format!("{} processes are running: {:?}", running.len(), running),
        ));
    }
    if running.first().copied() != scheduler.current() {
        violations.push(violation(
            "single_runner",
            format!(
                "current is {:?} but running processes are {:?}",
                scheduler.current(),
                running
            ),
        ));
    }

    violations
}

/// Invariant 5
fn check_process_pages(
    allocator: &PageAllocator,
    scheduler: &Scheduler,
    idle_stack: PageRange,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut owned: Vec<(Pid, PageRange)> = Vec::from([(Pid::IDLE, idle_stack)]);

    for pcb in scheduler.table().iter() {
        for range in pcb.owned_ranges() {
            let zone = allocator
                .zone_of_range(range)
                .and_then(|id| allocator.zone(id));
            match zone {
                Some(zone) if range.pages().all(|page| zone.is_pinned(page)) => {}
                Some(_) => violations.push(violation(
                    "process_pages",
                    format!("process {} owns {} but not all of it is pinned", pcb.pid(), range),
                )),
                None => violations.push(violation(
                    "process_pages",
                    format!("process {} owns {} outside every zone", pcb.pid(), range),
                )),
            }
            owned.push((pcb.pid(), range));
        }
    }

    for (index, (pid, range)) in owned.iter().enumerate() {
        for (other_pid, other) in &owned[index + 1..] {
            if range.overlaps(other) {
                violations.push(violation(
                    "process_pages",
                    format!(
                        "{} of process {} overlaps {} of process {}",
                        range, pid, other, other_pid
                    ),
                ));
            }
        }
    }

    violations
}
