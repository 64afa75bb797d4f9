//! Kernel resource layer: a zoned physical page allocator with compaction and
//! a policy-driven process scheduler.
//!
//! [`KernelState`] is the entry point. It is generic over a [`Policy`], which
//! advises on placement and scheduling, and a [`Cpu`](arch::Cpu), which does
//! the architecture-specific work.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod constants;
pub mod error;
pub mod invariants;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod policy;
pub mod processes;
pub mod scheduler;

pub use config::KernelConfig;
pub use error::KernelError;
pub use kernel::{KernelState, KernelStats};
pub use memory::{
    compaction::{CompactionStrategy, FragmentationInfo, PageMove, PageMoveListener},
    zone::MemoryRegion,
    PageRange,
};
pub use policy::{AllocationHint, Policy, ResourceHint, RoundRobinPolicy, SchedulingDecision};
pub use processes::{Context, ContextError, Pid, ProcessInfo, ProcessState, WaitStatus};
pub use scheduler::ready_queue::ReadyQueue;
