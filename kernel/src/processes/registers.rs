use core::fmt;

use thiserror::Error;
use x86_64::{registers::rflags::RFlags, VirtAddr};

use crate::constants::processes::RFLAGS_RESERVED;

/// Saved register file of a process that is not on the CPU.
///
/// The layout is fixed: the bare-metal switch routine addresses fields by
/// offset.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Why a saved context cannot be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("instruction pointer is null")]
    NullInstructionPointer,
    #[error("instruction pointer {0:#x} is not canonical")]
    NonCanonicalInstructionPointer(u64),
    #[error("stack pointer {rsp:#x} outside stack {bottom:#x}..={top:#x}")]
    StackPointerOutOfRange { rsp: u64, bottom: u64, top: u64 },
    #[error("reserved flag bit clear in rflags {0:#x}")]
    ReservedFlagClear(u64),
}

impl Context {
    pub const fn new() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
        }
    }

    /// Context that starts executing `entry` on a fresh stack whose highest
    /// address is `stack_top`, with interrupts enabled.
    ///
    /// `rsp` sits one slot below the top, where a `call` would have left the
    /// return address, so the entry function sees an ABI-conforming stack.
    pub fn for_entry(entry: VirtAddr, stack_top: VirtAddr) -> Self {
        let top = stack_top.align_down(16u64).as_u64();
        Self {
            rsp: top - 8,
            rip: entry.as_u64(),
            rflags: (RFlags::INTERRUPT_FLAG.bits() | RFLAGS_RESERVED),
            ..Self::new()
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        RFlags::from_bits_truncate(self.rflags).contains(RFlags::INTERRUPT_FLAG)
    }

    /// Checks that resuming this context would land on valid code with a
    /// stack pointer inside `[stack_bottom, stack_top]`.
    pub fn validate(&self, stack_bottom: VirtAddr, stack_top: VirtAddr) -> Result<(), ContextError> {
        if self.rip == 0 {
            return Err(ContextError::NullInstructionPointer);
        }
        if VirtAddr::try_new(self.rip).is_err() {
            return Err(ContextError::NonCanonicalInstructionPointer(self.rip));
        }
        let (bottom, top) = (stack_bottom.as_u64(), stack_top.as_u64());
        if self.rsp < bottom || self.rsp > top {
            return Err(ContextError::StackPointerOutOfRange {
                rsp: self.rsp,
                bottom,
                top,
            });
        }
        if self.rflags & RFLAGS_RESERVED == 0 {
            return Err(ContextError::ReservedFlagClear(self.rflags));
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ds = f.debug_struct("Context");

        ds.field("rax", &format_args!("{:#016x}", self.rax))
            .field("rbx", &format_args!("{:#016x}", self.rbx))
            .field("rcx", &format_args!("{:#016x}", self.rcx))
            .field("rdx", &format_args!("{:#016x}", self.rdx))
            .field("rsi", &format_args!("{:#016x}", self.rsi))
            .field("rdi", &format_args!("{:#016x}", self.rdi))
            .field("r8", &format_args!("{:#016x}", self.r8))
            .field("r9", &format_args!("{:#016x}", self.r9))
            .field("r10", &format_args!("{:#016x}", self.r10))
            .field("r11", &format_args!("{:#016x}", self.r11))
            .field("r12", &format_args!("{:#016x}", self.r12))
            .field("r13", &format_args!("{:#016x}", self.r13))
            .field("r14", &format_args!("{:#016x}", self.r14))
            .field("r15", &format_args!("{:#016x}", self.r15))
            .field("rbp", &format_args!("{:#016x}", self.rbp))
            .field("rsp", &format_args!("{:#016x}", self.rsp))
            .field("rip", &format_args!("{:#016x}", self.rip))
            .field("rflags", &format_args!("{:#016x}", self.rflags));

        ds.finish()
    }
}
