use thiserror::Error;

use crate::processes::process::{Pid, ProcessState};

/// Errors surfaced by the kernel resource layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// No zone can supply the request, even after one compaction pass.
    #[error("out of memory: no zone can supply {requested} contiguous pages")]
    OutOfMemory { requested: usize },

    #[error("process table full")]
    ProcessTableFull,

    #[error("invalid page count {0}")]
    InvalidPageCount(usize),

    #[error("memory map has no usable region")]
    NoUsableMemory,

    #[error("page range {start}+{count} is not inside a single zone")]
    RangeOutsideZones { start: usize, count: usize },

    #[error("page range {start}+{count} is already in use")]
    RangeInUse { start: usize, count: usize },

    #[error("no such process {0}")]
    NoSuchProcess(Pid),

    #[error("no process is running")]
    NoCurrentProcess,

    #[error("process {pid}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        pid: Pid,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("process {0} is running")]
    ProcessRunning(Pid),

    #[error("process {0} is not a child of the caller")]
    NotAChild(Pid),

    #[error("wake-up queue full, dropped wake-up for {0}")]
    WakeupQueueFull(Pid),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
