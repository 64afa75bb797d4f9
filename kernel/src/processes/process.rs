use arrayvec::ArrayString;
use core::fmt;

use crate::{constants::processes::PROCESS_NAME_MAX, error::KernelError, memory::PageRange};

/// Process identifier. Pid 0 is the idle context and never names a PCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl Pid {
    pub const IDLE: Pid = Pid(0);
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Ready,
    Running,
    Blocked,
    Zombie,
}

impl ProcessState {
    /// The lifecycle edges a PCB may take.
    pub fn can_transition_to(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Unused, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Running, Blocked)
                | (Running, Zombie)
                | (Blocked, Ready)
                | (Zombie, Unused)
        )
    }
}

/// Per-process accounting, in timer ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub cpu_time: u64,
    pub context_switches: u64,
    pub created_at: u64,
}

/// What `process_wait` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The child had exited and has been reaped.
    Exited(i32),
    /// The caller is now blocked until the child exits.
    Pending,
}

/// Process control block.
///
/// The saved register context lives next to the table, in the slot-indexed
/// context table owned by the kernel state.
#[derive(Debug, Clone)]
pub struct Pcb {
    pid: Pid,
    name: ArrayString<PROCESS_NAME_MAX>,
    state: ProcessState,
    pub priority: u8,
    pub quantum: u32,
    pub stack: Option<PageRange>,
    pub heap: Option<PageRange>,
    pub parent: Option<Pid>,
    pub exit_code: Option<i32>,
    /// Child this process is blocked in `process_wait` on.
    pub waiting_on: Option<Pid>,
    pub stats: ProcessStats,
}

impl Pcb {
    /// A PCB in the `Unused` state; admission moves it to `Ready`.
    pub fn new(pid: Pid, name: &str, priority: u8) -> Self {
        Self {
            pid,
            name: truncated_name(name),
            state: ProcessState::Unused,
            priority,
            quantum: 0,
            stack: None,
            heap: None,
            parent: None,
            exit_code: None,
            waiting_on: None,
            stats: ProcessStats::default(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, to: ProcessState) -> Result<(), KernelError> {
        if !self.state.can_transition_to(to) {
            return Err(KernelError::InvalidTransition {
                pid: self.pid,
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Pages this process owns, stack first.
    pub fn owned_ranges(&self) -> impl Iterator<Item = PageRange> {
        self.stack.into_iter().chain(self.heap)
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            name: self.name,
            state: self.state,
            priority: self.priority,
            quantum: self.quantum,
            stack: self.stack,
            heap: self.heap,
            parent: self.parent,
            exit_code: self.exit_code,
            stats: self.stats,
        }
    }
}

/// Point-in-time copy of a PCB, safe to hold after the scheduler lock is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: ArrayString<PROCESS_NAME_MAX>,
    pub state: ProcessState,
    pub priority: u8,
    pub quantum: u32,
    pub stack: Option<PageRange>,
    pub heap: Option<PageRange>,
    pub parent: Option<Pid>,
    pub exit_code: Option<i32>,
    pub stats: ProcessStats,
}

fn truncated_name(name: &str) -> ArrayString<PROCESS_NAME_MAX> {
    let mut end = name.len().min(PROCESS_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = ArrayString::new();
    out.push_str(&name[..end]);
    out
}
