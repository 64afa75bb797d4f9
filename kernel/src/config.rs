//! Runtime-tunable kernel parameters.

use crate::constants::processes::{
    DEFAULT_QUANTUM, IDLE_STACK_PAGES, MAX_HEAP_PAGES, MAX_PENDING_WAKEUPS, MAX_PROCESSES,
    MAX_QUANTUM, MAX_STACK_PAGES,
};
use crate::error::KernelError;

/// Parameters fixed when a [`KernelState`](crate::kernel::KernelState) boots.
///
/// Defaults come from [`crate::constants`]; tests and embedders override
/// individual fields through the `with_*` builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_processes: usize,
    pub default_quantum: u32,
    pub max_quantum: u32,
    pub max_stack_pages: usize,
    pub max_heap_pages: usize,
    pub idle_stack_pages: usize,
    pub pending_wakeups: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: MAX_PROCESSES,
            default_quantum: DEFAULT_QUANTUM,
            max_quantum: MAX_QUANTUM,
            max_stack_pages: MAX_STACK_PAGES,
            max_heap_pages: MAX_HEAP_PAGES,
            idle_stack_pages: IDLE_STACK_PAGES,
            pending_wakeups: MAX_PENDING_WAKEUPS,
        }
    }
}

impl KernelConfig {
    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    pub fn with_default_quantum(mut self, quantum: u32) -> Self {
        self.default_quantum = quantum;
        self
    }

    pub fn with_max_quantum(mut self, quantum: u32) -> Self {
        self.max_quantum = quantum;
        self
    }

    pub fn with_max_stack_pages(mut self, pages: usize) -> Self {
        self.max_stack_pages = pages;
        self
    }

    pub fn with_max_heap_pages(mut self, pages: usize) -> Self {
        self.max_heap_pages = pages;
        self
    }

    pub fn with_idle_stack_pages(mut self, pages: usize) -> Self {
        self.idle_stack_pages = pages;
        self
    }

    pub fn with_pending_wakeups(mut self, capacity: usize) -> Self {
        self.pending_wakeups = capacity;
        self
    }

    /// Rejects configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_processes == 0 {
            return Err(KernelError::InvalidConfig("max_processes must be non-zero"));
        }
        if self.default_quantum == 0 {
            return Err(KernelError::InvalidConfig("default_quantum must be non-zero"));
        }
        if self.max_quantum < self.default_quantum {
            return Err(KernelError::InvalidConfig(
                "max_quantum must not be below default_quantum",
            ));
        }
        if self.max_stack_pages == 0 {
            return Err(KernelError::InvalidConfig("max_stack_pages must be non-zero"));
        }
        if self.idle_stack_pages == 0 {
            return Err(KernelError::InvalidConfig("idle_stack_pages must be non-zero"));
        }
        if self.pending_wakeups == 0 {
            // ArrayQueue::new panics on a zero capacity
            return Err(KernelError::InvalidConfig("pending_wakeups must be non-zero"));
        }
        Ok(())
    }
}
