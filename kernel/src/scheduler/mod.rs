//! Scheduler state: the process table, the ready queue and the running
//! process.
//!
//! Everything here runs under the scheduler lock and touches no register
//! state. [`Scheduler::apply`] turns a policy decision into PCB transitions
//! and, when the CPU has to change hands, a [`Switch`] naming the two context
//! slots the caller swaps once the lock is released.

pub mod ready_queue;

use alloc::vec::Vec;
use log::{debug, trace, warn};

use crate::{
    config::KernelConfig,
    error::KernelError,
    memory::PageRange,
    policy::SchedulingDecision,
    processes::{
        process::{Pcb, Pid, ProcessState, WaitStatus},
        table::ProcessTable,
    },
};

use ready_queue::ReadyQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub context_switches: u64,
}

/// Where the CPU goes after a validated decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Stay { quantum: Option<u32> },
    Process(Pid),
    Idle,
}

/// A committed context switch. `None` stands for the idle context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: Option<Pid>,
    pub to: Option<Pid>,
    pub from_slot: usize,
    pub to_slot: usize,
}

/// Resources handed back by an exiting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitedProcess {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub stack: Option<PageRange>,
    pub heap: Option<PageRange>,
}

pub struct Scheduler {
    table: ProcessTable,
    ready: ReadyQueue,
    current: Option<Pid>,
    stats: SchedulerStats,
}

impl Scheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: ProcessTable::new(capacity),
            ready: ReadyQueue::new(),
            current: None,
            stats: SchedulerStats::default(),
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ProcessTable {
        &mut self.table
    }

    pub fn ready(&self) -> &ReadyQueue {
        &self.ready
    }

    /// The running process, `None` while idle.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Context slot of the idle context, just past the process slots.
    pub fn idle_slot(&self) -> usize {
        self.table.capacity()
    }

    pub fn context_slot(&self, pid: Option<Pid>) -> Option<usize> {
        match pid {
            Some(pid) => self.table.slot_of(pid),
            None => Some(self.idle_slot()),
        }
    }

    /// What a policy gets to see.
    pub fn snapshot(&self) -> (ReadyQueue, Option<Pid>) {
        (self.ready.clone(), self.current)
    }

    /// Moves a freshly built PCB into its reserved slot and the ready queue.
    pub fn admit(&mut self, slot: usize, mut pcb: Pcb, quantum: u32) -> Result<(), KernelError> {
        pcb.set_state(ProcessState::Ready)?;
        pcb.quantum = quantum;
        self.ready.push_back(pcb.pid(), pcb.priority);
        self.table.install(slot, pcb);
        Ok(())
    }

    fn current_runnable(&self) -> bool {
        self.current
            .and_then(|pid| self.table.get(pid))
            .is_some_and(|pcb| pcb.state() == ProcessState::Running)
    }

    fn is_ready(&self, pid: Pid) -> bool {
        self.ready.contains(pid)
            && self
                .table
                .get(pid)
                .is_some_and(|pcb| pcb.state() == ProcessState::Ready)
    }

    fn fallback(&self) -> Target {
        match self.ready.front() {
            Some(entry) => Target::Process(entry.pid),
            None if self.current_runnable() => Target::Stay { quantum: None },
            None => Target::Idle,
        }
    }

    /// Checks a policy decision against the queue and the current process.
    fn resolve(&self, decision: SchedulingDecision) -> Target {
        match decision {
            SchedulingDecision::Continue { quantum } => {
                if self.current.is_none() || self.current_runnable() {
                    Target::Stay { quantum }
                } else {
                    warn!("policy kept a process that can no longer run, falling back");
                    self.fallback()
                }
            }
            SchedulingDecision::SwitchTo(pid)
                if Some(pid) == self.current && self.current_runnable() =>
            {
                Target::Stay { quantum: None }
            }
            SchedulingDecision::SwitchTo(pid) if self.is_ready(pid) => Target::Process(pid),
            SchedulingDecision::SwitchTo(pid) => {
                warn!("policy picked process {} which is not ready, falling back", pid);
                self.fallback()
            }
            SchedulingDecision::Idle => Target::Idle,
            SchedulingDecision::Migrate { pid, target_core } => {
                debug!(
                    "ignoring migration of process {} to core {} on a single core",
                    pid, target_core
                );
                self.resolve(SchedulingDecision::Continue { quantum: None })
            }
        }
    }

    /// Applies a policy decision. Returns the switch to perform, if any.
    pub fn apply(
        &mut self,
        decision: SchedulingDecision,
        config: &KernelConfig,
    ) -> Result<Option<Switch>, KernelError> {
        match self.resolve(decision) {
            Target::Stay { quantum } => {
                if let Some(pcb) = self.current.and_then(|pid| self.table.get_mut(pid)) {
                    match quantum {
                        Some(requested) => {
                            pcb.quantum = requested.clamp(1, config.max_quantum);
                            if pcb.quantum != requested {
                                debug!("clamped quantum {} to {}", requested, pcb.quantum);
                            }
                        }
                        None if pcb.quantum == 0 => pcb.quantum = config.default_quantum,
                        None => {}
                    }
                }
                Ok(None)
            }
            Target::Process(pid) if Some(pid) == self.current => {
                // woken before it left the CPU: it keeps running in place
                let pcb = self.table.lookup_mut(pid)?;
                pcb.set_state(ProcessState::Running)?;
                pcb.quantum = config.default_quantum;
                self.ready.remove(pid);
                Ok(None)
            }
            Target::Process(pid) => self.switch_to(Some(pid), config).map(Some),
            Target::Idle if self.current.is_none() => Ok(None),
            Target::Idle => self.switch_to(None, config).map(Some),
        }
    }

    fn switch_to(&mut self, to: Option<Pid>, config: &KernelConfig) -> Result<Switch, KernelError> {
        let from = self.current;
        let from_slot = self
            .context_slot(from)
            .ok_or(KernelError::NoCurrentProcess)?;
        let to_slot = match to {
            Some(pid) => self.table.slot_of(pid).ok_or(KernelError::NoSuchProcess(pid))?,
            None => self.idle_slot(),
        };

        if let Some(pid) = from {
            let pcb = self.table.lookup_mut(pid)?;
            if pcb.state() == ProcessState::Running {
                pcb.set_state(ProcessState::Ready)?;
                let priority = pcb.priority;
                self.ready.push_back(pid, priority);
            }
        }
        if let Some(pid) = to {
            let pcb = self.table.lookup_mut(pid)?;
            pcb.set_state(ProcessState::Running)?;
            pcb.quantum = config.default_quantum;
            pcb.stats.context_switches += 1;
            self.ready.remove(pid);
        }

        self.current = to;
        self.stats.context_switches += 1;
        trace!(
            "switch {} -> {}",
            from.unwrap_or(Pid::IDLE),
            to.unwrap_or(Pid::IDLE)
        );
        Ok(Switch {
            from,
            to,
            from_slot,
            to_slot,
        })
    }

    /// Charges one timer tick. Returns true when the scheduler should run.
    ///
    /// A current process that is no longer `Running` is inside a kernel call
    /// that ends in `schedule()`, so the tick does not preempt it.
    pub fn tick(&mut self) -> bool {
        self.stats.ticks += 1;
        let Some(pcb) = self.current.and_then(|pid| self.table.get_mut(pid)) else {
            self.stats.idle_ticks += 1;
            return true;
        };
        if pcb.state() != ProcessState::Running {
            return false;
        }
        pcb.stats.cpu_time += 1;
        pcb.quantum = pcb.quantum.saturating_sub(1);
        pcb.quantum == 0
    }

    pub fn ticks(&self) -> u64 {
        self.stats.ticks
    }

    pub fn block_current(&mut self) -> Result<Pid, KernelError> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        self.table.lookup_mut(pid)?.set_state(ProcessState::Blocked)?;
        Ok(pid)
    }

    pub fn wake(&mut self, pid: Pid) -> Result<(), KernelError> {
        let pcb = self.table.lookup_mut(pid)?;
        pcb.set_state(ProcessState::Ready)?;
        pcb.waiting_on = None;
        let priority = pcb.priority;
        self.ready.push_back(pid, priority);
        Ok(())
    }

    /// Turns the running process into a zombie and takes its page ranges.
    ///
    /// A parent blocked waiting for it is woken; its own children lose their
    /// parent and get reaped once they exit.
    pub fn exit_current(&mut self, code: i32) -> Result<ExitedProcess, KernelError> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let pcb = self.table.lookup_mut(pid)?;
        pcb.set_state(ProcessState::Zombie)?;
        pcb.exit_code = Some(code);
        let exited = ExitedProcess {
            pid,
            parent: pcb.parent,
            stack: pcb.stack.take(),
            heap: pcb.heap.take(),
        };

        if let Some(parent) = exited.parent {
            let waiting = self.table.get(parent).is_some_and(|pcb| {
                pcb.state() == ProcessState::Blocked && pcb.waiting_on == Some(pid)
            });
            if waiting {
                self.wake(parent)?;
            }
        }
        for child in self.table.iter_mut().filter(|pcb| pcb.parent == Some(pid)) {
            child.parent = None;
        }
        Ok(exited)
    }

    /// Collects `child` if it has exited, otherwise blocks the caller on it.
    pub fn wait(&mut self, child: Pid) -> Result<WaitStatus, KernelError> {
        let caller = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let pcb = self.table.get(child).ok_or(KernelError::NoSuchProcess(child))?;
        if pcb.parent != Some(caller) {
            return Err(KernelError::NotAChild(child));
        }

        if pcb.state() == ProcessState::Zombie {
            let reaped = self.table.reap(child)?;
            return Ok(WaitStatus::Exited(reaped.exit_code.unwrap_or_default()));
        }

        let me = self.table.lookup_mut(caller)?;
        me.set_state(ProcessState::Blocked)?;
        me.waiting_on = Some(child);
        Ok(WaitStatus::Pending)
    }

    /// Reaps zombies nobody will wait for. The running process is left alone
    /// until the CPU has left it.
    pub fn reap_orphans(&mut self) -> Result<Vec<Pid>, KernelError> {
        let orphans: Vec<Pid> = self
            .table
            .iter()
            .filter(|pcb| {
                pcb.state() == ProcessState::Zombie
                    && pcb.parent.is_none()
                    && Some(pcb.pid()) != self.current
            })
            .map(Pcb::pid)
            .collect();

        for &pid in &orphans {
            self.table.reap(pid)?;
            debug!("reaped orphan {}", pid);
        }
        Ok(orphans)
    }
}
