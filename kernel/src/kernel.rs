//! The kernel resource layer as one owned value.
//!
//! [`KernelState`] owns the page allocator and the scheduler, each behind its
//! own spinlock, plus the saved register contexts. Lock rules:
//!
//! - Both locks are taken with interrupts masked.
//! - The allocator lock is never held while calling into the scheduler, and
//!   the only nesting is allocator then scheduler, in [`KernelState::inspect`].
//! - Policy scheduling decisions are made outside the scheduler lock, on a
//!   snapshot.
//! - Register save/restore happens outside both locks, in the same
//!   interrupts-masked section that committed the switch; the scheduler has
//!   already reserved both context slots.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU32, Ordering},
};

use crossbeam_queue::ArrayQueue;
use log::{error, info, trace, warn};
use spin::Mutex;
use x86_64::VirtAddr;

use crate::{
    arch::Cpu,
    config::KernelConfig,
    constants::memory::PAGE_SIZE,
    error::KernelError,
    memory::{
        compaction::{CompactionStrategy, Compactor, FragmentationInfo, PageMoveListener},
        page_allocator::{MemoryStats, PageAllocator},
        zone::{MemoryRegion, ZoneInfo},
        Mobility, PageRange,
    },
    policy::{AllocationHint, Policy, ResourceHint},
    processes::{
        process::{Pcb, Pid, ProcessInfo, ProcessState, WaitStatus},
        registers::Context,
        table::ProcessTable,
    },
    scheduler::{Scheduler, SchedulerStats, Switch},
};

/// Saved contexts, one per process slot plus the idle context at the end.
///
/// A slot is only ever touched by whoever the scheduler has reserved it for:
/// the creator of a reserved process slot, the two sides of a committed
/// switch, or a holder of the scheduler lock editing a process that is not
/// running.
struct ContextTable {
    slots: Box<[UnsafeCell<Context>]>,
}

// SAFETY: access to each slot is serialized by the scheduler as described above.
unsafe impl Sync for ContextTable {}

impl ContextTable {
    fn new(process_slots: usize, idle: Context) -> Self {
        let slots = (0..process_slots)
            .map(|_| Context::new())
            .chain(core::iter::once(idle))
            .map(UnsafeCell::new)
            .collect();
        Self { slots }
    }

    fn slot(&self, index: usize) -> *mut Context {
        self.slots[index].get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStats {
    pub memory: MemoryStats,
    pub scheduler: SchedulerStats,
    pub processes: usize,
    pub ready: usize,
    pub total_pages: usize,
    pub free_pages: usize,
}

pub struct KernelState<P: Policy, C: Cpu> {
    config: KernelConfig,
    allocator: Mutex<PageAllocator>,
    scheduler: Mutex<Scheduler>,
    contexts: ContextTable,
    wakeups: ArrayQueue<Pid>,
    next_pid: AtomicU32,
    idle_stack: PageRange,
    policy: P,
    cpu: C,
    listener: Option<Arc<dyn PageMoveListener>>,
}

impl<P: Policy, C: Cpu> KernelState<P, C> {
    /// Builds the zones from the boot memory map and sets up the idle context.
    pub fn new(
        config: KernelConfig,
        regions: &[MemoryRegion],
        policy: P,
        cpu: C,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        let mut allocator = PageAllocator::new(regions)?;

        let hint = allocator.sanitize_hint(AllocationHint::default());
        let idle_stack = allocator
            .try_alloc(config.idle_stack_pages, &hint, Mobility::Pinned)
            .ok_or(KernelError::OutOfMemory {
                requested: config.idle_stack_pages,
            })?;
        let idle = Context::for_entry(
            cpu.idle_entry(),
            cpu.phys_to_virt(idle_stack.end_address()),
        );

        info!(
            "kernel core up: {} pages in {} zones, {} process slots",
            allocator.total_pages(),
            allocator.zone_count(),
            config.max_processes
        );

        Ok(Self {
            config,
            allocator: Mutex::new(allocator),
            scheduler: Mutex::new(Scheduler::new(config.max_processes)),
            contexts: ContextTable::new(config.max_processes, idle),
            wakeups: ArrayQueue::new(config.pending_wakeups),
            next_pid: AtomicU32::new(1),
            idle_stack,
            policy,
            cpu,
            listener: None,
        })
    }

    /// Registers the collaborator told about every compactor relocation.
    pub fn with_page_move_listener(mut self, listener: Arc<dyn PageMoveListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn idle_stack(&self) -> PageRange {
        self.idle_stack
    }

    fn with_allocator<R>(&self, f: impl FnOnce(&mut PageAllocator) -> R) -> R {
        self.cpu.without_interrupts(|| f(&mut self.allocator.lock()))
    }

    fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        self.cpu.without_interrupts(|| f(&mut self.scheduler.lock()))
    }

    /// Read access to both structures at once, for consistency checks.
    pub fn inspect<R>(&self, f: impl FnOnce(&PageAllocator, &Scheduler) -> R) -> R {
        self.cpu.without_interrupts(|| {
            let allocator = self.allocator.lock();
            let scheduler = self.scheduler.lock();
            f(&allocator, &scheduler)
        })
    }

    // -- physical memory --

    fn allocate(
        &self,
        count: usize,
        hint: AllocationHint,
        mobility: Mobility,
    ) -> Result<PageRange, KernelError> {
        if count == 0 {
            return Err(KernelError::InvalidPageCount(0));
        }

        let range = self.with_allocator(|allocator| {
            let hint = allocator.sanitize_hint(hint);
            if let Some(range) = allocator.try_alloc(count, &hint, mobility) {
                return Ok(range);
            }

            if allocator.has_fragmented_capacity(count) {
                let align_pages = (hint.alignment / PAGE_SIZE) as usize;
                Compactor::new(allocator, &self.policy, &self.cpu, self.listener.as_deref())
                    .compact_for(count, hint.preferred_zone, align_pages);
                if let Some(range) = allocator.try_alloc(count, &hint, mobility) {
                    return Ok(range);
                }
            }

            allocator.stats_mut().oom_failures += 1;
            warn!(
                "out of memory: {} contiguous pages requested, {} free",
                count,
                allocator.free_pages()
            );
            Err(KernelError::OutOfMemory { requested: count })
        })?;

        self.policy.record_allocation(range);
        Ok(range)
    }

    /// Allocates `count` contiguous pages. A single page may later be
    /// relocated by the compactor.
    pub fn alloc_pages(&self, count: usize, hint: AllocationHint) -> Result<PageRange, KernelError> {
        self.allocate(count, hint, Mobility::Movable)
    }

    /// Allocates pages the compactor will never move.
    pub fn alloc_pinned_pages(
        &self,
        count: usize,
        hint: AllocationHint,
    ) -> Result<PageRange, KernelError> {
        self.allocate(count, hint, Mobility::Pinned)
    }

    /// Allocation entry point for other subsystems; placement is up to the
    /// policy.
    pub fn pmm_alloc_pages(&self, count: usize) -> Option<PageRange> {
        let hint = self.policy.predict_allocation(count);
        self.alloc_pages(count, hint).ok()
    }

    /// Returns pages to the allocator. Ranges outside every zone are logged
    /// and ignored. Returns the number of pages that were in use.
    pub fn free_pages(&self, range: PageRange) -> usize {
        match self.with_allocator(|allocator| allocator.free(range)) {
            Ok(freed) => {
                self.policy.record_free(range);
                freed
            }
            Err(err) => {
                warn!("ignoring free of {}: {}", range, err);
                0
            }
        }
    }

    pub fn pmm_free_pages(&self, range: PageRange) {
        self.free_pages(range);
    }

    pub fn reserve_pages(&self, range: PageRange) -> Result<(), KernelError> {
        self.with_allocator(|allocator| allocator.reserve(range))
    }

    /// Compacts every zone. Returns the number of pages moved.
    pub fn compact(&self, strategy: CompactionStrategy) -> usize {
        self.with_allocator(|allocator| {
            Compactor::new(allocator, &self.policy, &self.cpu, self.listener.as_deref())
                .compact(strategy)
        })
    }

    pub fn zone_count(&self) -> usize {
        self.with_allocator(|allocator| allocator.zone_count())
    }

    pub fn zone_info(&self, zone: usize) -> Option<ZoneInfo> {
        self.with_allocator(|allocator| allocator.zone_info(zone))
    }

    pub fn fragmentation(&self, zone: usize) -> Option<FragmentationInfo> {
        self.with_allocator(|allocator| allocator.analyze_fragmentation(zone))
    }

    // -- processes --

    fn clamp_resources(&self, hint: ResourceHint) -> ResourceHint {
        let clamped = ResourceHint {
            stack_pages: hint.stack_pages.clamp(1, self.config.max_stack_pages),
            heap_pages: hint.heap_pages.min(self.config.max_heap_pages),
        };
        if clamped != hint {
            warn!("clamped resource hint {:?} to {:?}", hint, clamped);
        }
        clamped
    }

    fn allocate_process_pages(
        &self,
        resources: ResourceHint,
    ) -> Result<(PageRange, Option<PageRange>), KernelError> {
        let stack_hint = self.policy.predict_allocation(resources.stack_pages);
        let stack = self.alloc_pinned_pages(resources.stack_pages, stack_hint)?;
        if resources.heap_pages == 0 {
            return Ok((stack, None));
        }

        let heap_hint = self.policy.predict_allocation(resources.heap_pages);
        match self.alloc_pinned_pages(resources.heap_pages, heap_hint) {
            Ok(heap) => Ok((stack, Some(heap))),
            Err(err) => {
                self.free_pages(stack);
                Err(err)
            }
        }
    }

    /// Next pid from the counter that is neither the idle pid nor still in
    /// the table. The table holds fewer than 2^32 processes, so this ends.
    fn allocate_pid(&self, table: &ProcessTable) -> Pid {
        loop {
            let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
            if pid != Pid::IDLE && table.get(pid).is_none() {
                return pid;
            }
        }
    }

    /// Creates a process that starts at `entry` and queues it as ready.
    ///
    /// The caller (the running process, if any) becomes its parent.
    pub fn process_create(&self, name: &str, entry: VirtAddr, priority: u8) -> Result<Pid, KernelError> {
        let slot = self.with_scheduler(|scheduler| scheduler.table_mut().reserve())?;

        let resources = self.clamp_resources(self.policy.predict_resources(name));
        let (stack, heap) = match self.allocate_process_pages(resources) {
            Ok(pages) => pages,
            Err(err) => {
                self.with_scheduler(|scheduler| scheduler.table_mut().release(slot));
                warn!("cannot create process {:?}: {}", name, err);
                return Err(err);
            }
        };

        let pid = self.with_scheduler(|scheduler| self.allocate_pid(scheduler.table()));
        let stack_top = self.cpu.phys_to_virt(stack.end_address());
        // SAFETY: the slot is reserved for this call; nothing else reads or
        // writes its context until the PCB is admitted below.
        unsafe { *self.contexts.slot(slot) = Context::for_entry(entry, stack_top) };

        let mut pcb = Pcb::new(pid, name, priority);
        pcb.stack = Some(stack);
        pcb.heap = heap;
        info!(
            "created process {} ({}): stack {}, heap {} pages",
            pid,
            pcb.name(),
            stack,
            resources.heap_pages
        );

        self.with_scheduler(|scheduler| {
            pcb.parent = scheduler.current();
            pcb.stats.created_at = scheduler.ticks();
            scheduler.admit(slot, pcb, self.config.default_quantum)
        })?;
        self.policy.record_creation(pid, name);
        Ok(pid)
    }

    /// Ends the running process: its pages go back to the allocator and the
    /// CPU moves on. On hardware this call does not return.
    pub fn process_exit(&self, code: i32) -> Result<(), KernelError> {
        let exited = self.with_scheduler(|scheduler| scheduler.exit_current(code))?;

        let freed: usize = exited
            .stack
            .into_iter()
            .chain(exited.heap)
            .map(|range| self.free_pages(range))
            .sum();
        self.policy.record_exit(exited.pid, code);
        info!(
            "process {} exited with code {}, released {} pages",
            exited.pid, code, freed
        );

        self.schedule();
        Ok(())
    }

    /// Collects the exit code of a child, blocking the caller until the
    /// child exits.
    ///
    /// Once the caller is resumed it checks the child again and returns
    /// `Exited`. `Pending` comes back only when `schedule()` returns with
    /// another process current, which happens on a CPU that does not really
    /// transfer control (`arch::sim`); such callers retry later.
    pub fn process_wait(&self, child: Pid) -> Result<WaitStatus, KernelError> {
        let caller = self.current().ok_or(KernelError::NoCurrentProcess)?;
        loop {
            let status = self.with_scheduler(|scheduler| scheduler.wait(child))?;
            if status != WaitStatus::Pending {
                return Ok(status);
            }
            self.schedule();
            if self.current() != Some(caller) {
                return Ok(WaitStatus::Pending);
            }
        }
    }

    /// Parks the running process until someone calls [`wake`](Self::wake).
    pub fn block_current(&self) -> Result<(), KernelError> {
        self.with_scheduler(|scheduler| scheduler.block_current())?;
        self.schedule();
        Ok(())
    }

    pub fn wake(&self, pid: Pid) -> Result<(), KernelError> {
        self.with_scheduler(|scheduler| scheduler.wake(pid))
    }

    /// Queues a wake-up without taking any lock, for interrupt handlers. It
    /// takes effect at the next `schedule()`.
    pub fn wake_from_interrupt(&self, pid: Pid) -> Result<(), KernelError> {
        self.wakeups.push(pid).map_err(KernelError::WakeupQueueFull)
    }

    fn drain_wakeups(&self) {
        while let Some(pid) = self.wakeups.pop() {
            if let Err(err) = self.wake(pid) {
                warn!("dropping wake-up for {}: {}", pid, err);
            }
        }
    }

    // -- scheduling --

    /// Timer interrupt entry: charges the tick and reschedules on quantum
    /// expiry.
    pub fn timer_tick(&self) {
        if self.with_scheduler(Scheduler::tick) {
            self.schedule();
        }
    }

    pub fn yield_now(&self) {
        self.schedule();
    }

    /// Asks the policy what runs next and switches to it.
    pub fn schedule(&self) {
        self.drain_wakeups();

        let (queue, current) = self.with_scheduler(|scheduler| {
            if let Err(err) = scheduler.reap_orphans() {
                error!("reaping failed: {}", err);
            }
            scheduler.snapshot()
        });

        let decision = self.policy.make_decision(&queue, current);

        // Interrupts stay masked from the commit until the switch is done:
        // a tick in between would reschedule through half-swapped slots.
        self.cpu.without_interrupts(|| {
            let committed = {
                let mut scheduler = self.scheduler.lock();
                scheduler.apply(decision, &self.config).map(|switch| {
                    switch.map(|switch| {
                        let stack = match switch.to {
                            Some(pid) => scheduler.table().get(pid).and_then(|pcb| pcb.stack),
                            None => Some(self.idle_stack),
                        };
                        (switch, stack)
                    })
                })
            };

            match committed {
                Ok(Some((switch, stack))) => self.switch_contexts(switch, stack),
                Ok(None) => {}
                Err(err) => error!("could not apply {:?}: {}", decision, err),
            }
        });
    }

    /// The idle context keeps no state: it always restarts at the top of
    /// its loop on an empty stack.
    fn idle_context(&self) -> Context {
        Context::for_entry(
            self.cpu.idle_entry(),
            self.cpu.phys_to_virt(self.idle_stack.end_address()),
        )
    }

    /// Must run with interrupts masked, from the commit of `switch` on.
    fn switch_contexts(&self, switch: Switch, stack: Option<PageRange>) {
        let target = switch.to.unwrap_or(Pid::IDLE);
        let Some(stack) = stack else {
            error!("process {} has no stack to resume on", target);
            panic!("no stack for process {}", target);
        };

        let idle = self.idle_context();
        // SAFETY: the scheduler committed this switch, so `from_slot` belongs
        // to the context leaving the CPU and `to_slot` to the one it just took
        // off the ready queue. The slots differ and nobody else touches them
        // until the next schedule.
        let (old, new) = unsafe {
            let old = &mut *self.contexts.slot(switch.from_slot);
            let new: &Context = match switch.to {
                Some(_) => &*self.contexts.slot(switch.to_slot),
                None => &idle,
            };
            (old, new)
        };

        let bottom = self.cpu.phys_to_virt(stack.start_address());
        let top = self.cpu.phys_to_virt(stack.end_address());
        if let Err(err) = new.validate(bottom, top) {
            error!("refusing to resume process {}: {}", target, err);
            panic!("corrupted context for process {}: {}", target, err);
        }

        trace!("resuming process {} at {:#x}", target, new.rip);
        // SAFETY: the caller keeps interrupts masked, `new` passed validation
        // and both contexts are exclusively ours.
        unsafe { self.cpu.save_and_switch(old, new) };
    }

    /// Edits the saved registers of a process that is not on the CPU.
    pub fn with_saved_context<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut Context) -> R,
    ) -> Result<R, KernelError> {
        self.with_scheduler(|scheduler| {
            let pcb = scheduler.table().get(pid).ok_or(KernelError::NoSuchProcess(pid))?;
            if pcb.state() == ProcessState::Running {
                return Err(KernelError::ProcessRunning(pid));
            }
            let slot = scheduler
                .table()
                .slot_of(pid)
                .ok_or(KernelError::NoSuchProcess(pid))?;
            // SAFETY: the process is off the CPU and the scheduler lock keeps
            // it from being switched to while `f` runs.
            Ok(f(unsafe { &mut *self.contexts.slot(slot) }))
        })
    }

    // -- introspection --

    pub fn current(&self) -> Option<Pid> {
        self.with_scheduler(|scheduler| scheduler.current())
    }

    pub fn process_info(&self, pid: Pid) -> Option<ProcessInfo> {
        self.with_scheduler(|scheduler| scheduler.table().get(pid).map(Pcb::info))
    }

    pub fn ready_pids(&self) -> Vec<Pid> {
        self.with_scheduler(|scheduler| scheduler.ready().iter().map(|entry| entry.pid).collect())
    }

    pub fn stats(&self) -> KernelStats {
        self.inspect(|allocator, scheduler| KernelStats {
            memory: allocator.stats(),
            scheduler: scheduler.stats(),
            processes: scheduler.table().len(),
            ready: scheduler.ready().len(),
            total_pages: allocator.total_pages(),
            free_pages: allocator.free_pages(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::sim::SimulatedCpu, policy::RoundRobinPolicy};

    type Kernel = KernelState<RoundRobinPolicy, SimulatedCpu>;

    fn kernel(pages: u64, config: KernelConfig) -> Kernel {
        KernelState::new(
            config,
            &[MemoryRegion::usable(0, pages * PAGE_SIZE)],
            RoundRobinPolicy::new(),
            SimulatedCpu::new(),
        )
        .unwrap()
    }

    fn entry() -> VirtAddr {
        VirtAddr::new(0x40_0000)
    }

    #[test]
    fn boot_reserves_the_idle_stack() {
        let kernel = kernel(64, KernelConfig::default());
        assert_eq!(kernel.idle_stack(), PageRange::new(0, 1));
        assert_eq!(kernel.zone_info(0).unwrap().used_pages, 1);
        assert_eq!(kernel.current(), None);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = KernelState::new(
            KernelConfig::default().with_pending_wakeups(0),
            &[MemoryRegion::usable(0, 64 * PAGE_SIZE)],
            RoundRobinPolicy::new(),
            SimulatedCpu::new(),
        );
        assert!(matches!(result, Err(KernelError::InvalidConfig(_))));
    }

    #[test]
    fn zero_page_allocation_is_rejected() {
        let kernel = kernel(64, KernelConfig::default());
        assert_eq!(
            kernel.alloc_pages(0, AllocationHint::default()),
            Err(KernelError::InvalidPageCount(0))
        );
    }

    #[test]
    fn full_table_rejects_creation() {
        let kernel = kernel(256, KernelConfig::default().with_max_processes(2));
        kernel.process_create("a", entry(), 0).unwrap();
        kernel.process_create("b", entry(), 0).unwrap();
        assert_eq!(
            kernel.process_create("c", entry(), 0),
            Err(KernelError::ProcessTableFull)
        );
    }

    #[test]
    fn failed_creation_releases_slot_and_pages() {
        // the idle stack takes 1 of 6 pages and the 2-page stack leaves 3,
        // short of the 4-page heap
        let kernel = kernel(6, KernelConfig::default().with_max_processes(1));
        let free = kernel.zone_info(0).unwrap().free_pages;
        assert!(matches!(
            kernel.process_create("big", entry(), 0),
            Err(KernelError::OutOfMemory { .. })
        ));
        assert_eq!(kernel.zone_info(0).unwrap().free_pages, free);
        assert_eq!(kernel.stats().processes, 0);

        // with the only slot released, a retry fails on memory again rather
        // than on the table
        assert!(matches!(
            kernel.process_create("big", entry(), 0),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn pid_counter_wrap_skips_idle_and_live_pids() {
        let kernel = kernel(128, KernelConfig::default());
        assert_eq!(kernel.process_create("a", entry(), 0), Ok(Pid(1)));

        kernel.next_pid.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(kernel.process_create("b", entry(), 0), Ok(Pid(u32::MAX)));
        // 0 is the idle pid and 1 is still alive
        assert_eq!(kernel.process_create("c", entry(), 0), Ok(Pid(2)));
    }

    #[test]
    fn new_process_context_points_at_entry_and_stack_top() {
        let kernel = kernel(64, KernelConfig::default());
        let pid = kernel.process_create("init", entry(), 1).unwrap();
        let info = kernel.process_info(pid).unwrap();
        let stack = info.stack.unwrap();
        let ctx = kernel.with_saved_context(pid, |ctx| *ctx).unwrap();
        assert_eq!(ctx.rip, entry().as_u64());
        assert_eq!(ctx.rsp, stack.end_address().as_u64() - 8);
        assert_eq!(ctx.rflags, 0x202);
        assert_eq!(info.state, ProcessState::Ready);
        assert_eq!(info.parent, None);
    }

    #[test]
    fn running_context_cannot_be_edited() {
        let kernel = kernel(64, KernelConfig::default());
        let pid = kernel.process_create("init", entry(), 0).unwrap();
        kernel.yield_now();
        assert_eq!(kernel.current(), Some(pid));
        assert_eq!(
            kernel.with_saved_context(pid, |_| ()),
            Err(KernelError::ProcessRunning(pid))
        );
    }

    #[test]
    fn interrupt_wakeups_apply_on_next_schedule() {
        let kernel = kernel(64, KernelConfig::default().with_pending_wakeups(1));
        let a = kernel.process_create("a", entry(), 0).unwrap();
        kernel.yield_now();
        kernel.block_current().unwrap();
        assert_eq!(kernel.current(), None);

        kernel.wake_from_interrupt(a).unwrap();
        assert_eq!(
            kernel.wake_from_interrupt(a),
            Err(KernelError::WakeupQueueFull(a))
        );
        assert_eq!(kernel.process_info(a).unwrap().state, ProcessState::Blocked);

        kernel.timer_tick();
        assert_eq!(kernel.current(), Some(a));
    }

    #[test]
    fn children_record_their_parent() {
        let kernel = kernel(128, KernelConfig::default());
        let parent = kernel.process_create("parent", entry(), 0).unwrap();
        kernel.yield_now();
        let child = kernel.process_create("child", entry(), 0).unwrap();
        assert_eq!(kernel.process_info(child).unwrap().parent, Some(parent));
    }

    #[test]
    fn free_outside_zones_is_ignored() {
        let kernel = kernel(64, KernelConfig::default());
        assert_eq!(kernel.free_pages(PageRange::new(1000, 4)), 0);
        assert_eq!(kernel.stats().memory.frees, 0);
    }
}
