//! The architecture-specific surface of the kernel core.
//!
//! Everything above this module is portable: the scheduler decides *what* to
//! switch, a [`Cpu`] decides *how*.

pub mod sim;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

use ::x86_64::{PhysAddr, VirtAddr};

use crate::processes::registers::Context;

pub trait Cpu: Send + Sync {
    /// Runs `f` with interrupts masked, restoring the previous mask after.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R;

    /// Saves the live register file into `old` and resumes `new`.
    ///
    /// Returns when some later switch resumes `old`.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled. `new` must hold a context that passed
    /// [`Context::validate`], and no other reference to either context may be
    /// live for the duration of the call.
    unsafe fn save_and_switch(&self, old: &mut Context, new: &Context);

    /// Copies one page of physical memory.
    fn copy_page(&self, from: PhysAddr, to: PhysAddr);

    /// Address at which the kernel can reach physical memory.
    fn phys_to_virt(&self, addr: PhysAddr) -> VirtAddr;

    /// Where the idle context starts executing.
    fn idle_entry(&self) -> VirtAddr;
}
