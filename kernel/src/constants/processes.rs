//! Process table and scheduling defaults.

pub const MAX_PROCESSES: usize = 64;
pub const PROCESS_NAME_MAX: usize = 32;

/// Timer ticks a process may run before it is preempted.
pub const DEFAULT_QUANTUM: u32 = 10;
pub const MAX_QUANTUM: u32 = 100;

pub const DEFAULT_STACK_PAGES: usize = 2; // 2 pages for the stack
pub const DEFAULT_HEAP_PAGES: usize = 4;
pub const MAX_STACK_PAGES: usize = 64;
pub const MAX_HEAP_PAGES: usize = 1024;
pub const IDLE_STACK_PAGES: usize = 1;

/// Capacity of the wake-up queue filled from interrupt context.
pub const MAX_PENDING_WAKEUPS: usize = 64;

/// RFLAGS bit 1 is reserved and always reads as one.
pub const RFLAGS_RESERVED: u64 = 1 << 1;
