//! Bare-metal x86_64 backend.
//!
//! Physical memory is reached through the bootloader's higher-half direct map.

use core::{arch::global_asm, mem::offset_of};

use x86_64::{
    instructions::interrupts,
    PhysAddr, VirtAddr,
};

use crate::{constants::memory::PAGE_SIZE, processes::registers::Context};

use super::Cpu;

// Offsets used by the switch routine below.
const _: () = {
    assert!(offset_of!(Context, rax) == 0x00);
    assert!(offset_of!(Context, rbx) == 0x08);
    assert!(offset_of!(Context, rcx) == 0x10);
    assert!(offset_of!(Context, rdx) == 0x18);
    assert!(offset_of!(Context, rsi) == 0x20);
    assert!(offset_of!(Context, rdi) == 0x28);
    assert!(offset_of!(Context, r8) == 0x30);
    assert!(offset_of!(Context, r15) == 0x68);
    assert!(offset_of!(Context, rbp) == 0x70);
    assert!(offset_of!(Context, rsp) == 0x78);
    assert!(offset_of!(Context, rip) == 0x80);
    assert!(offset_of!(Context, rflags) == 0x88);
};

// kcore_switch_context(old: *mut Context /* rdi */, new: *const Context /* rsi */)
//
// The outgoing context resumes at our return address with the stack as the
// caller will see it after `ret`. The incoming rip and rflags are pushed on
// the incoming stack and consumed by `popfq; ret`, so the new rflags (and its
// interrupt flag) take effect only on the final instruction pair.
global_asm!(
    r#"
.section .text
.global kcore_switch_context
kcore_switch_context:
    mov [rdi + 0x00], rax
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rcx
    mov [rdi + 0x18], rdx
    mov [rdi + 0x20], rsi
    mov [rdi + 0x28], rdi
    mov [rdi + 0x30], r8
    mov [rdi + 0x38], r9
    mov [rdi + 0x40], r10
    mov [rdi + 0x48], r11
    mov [rdi + 0x50], r12
    mov [rdi + 0x58], r13
    mov [rdi + 0x60], r14
    mov [rdi + 0x68], r15
    mov [rdi + 0x70], rbp
    lea rax, [rsp + 8]
    mov [rdi + 0x78], rax
    mov rax, [rsp]
    mov [rdi + 0x80], rax
    pushfq
    pop rax
    mov [rdi + 0x88], rax

    mov rsp, [rsi + 0x78]
    push qword ptr [rsi + 0x80]
    push qword ptr [rsi + 0x88]
    mov rax, [rsi + 0x00]
    mov rbx, [rsi + 0x08]
    mov rcx, [rsi + 0x10]
    mov rdx, [rsi + 0x18]
    mov rdi, [rsi + 0x28]
    mov r8,  [rsi + 0x30]
    mov r9,  [rsi + 0x38]
    mov r10, [rsi + 0x40]
    mov r11, [rsi + 0x48]
    mov r12, [rsi + 0x50]
    mov r13, [rsi + 0x58]
    mov r14, [rsi + 0x60]
    mov r15, [rsi + 0x68]
    mov rbp, [rsi + 0x70]
    mov rsi, [rsi + 0x20]
    popfq
    ret
"#
);

extern "C" {
    fn kcore_switch_context(old: *mut Context, new: *const Context);
}

/// Body of the idle context: sleep until the next interrupt, forever.
extern "C" fn idle_loop() -> ! {
    loop {
        interrupts::enable_and_hlt();
    }
}

pub struct X86Cpu {
    hhdm_offset: u64,
}

impl X86Cpu {
    /// `hhdm_offset` is the virtual base of the direct map of physical memory.
    pub const fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }
}

impl Cpu for X86Cpu {
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        interrupts::without_interrupts(f)
    }

    unsafe fn save_and_switch(&self, old: &mut Context, new: &Context) {
        kcore_switch_context(old, new);
    }

    fn copy_page(&self, from: PhysAddr, to: PhysAddr) {
        let src = self.phys_to_virt(from).as_ptr::<u8>();
        let dst = self.phys_to_virt(to).as_mut_ptr::<u8>();
        // SAFETY: both pages are inside the direct map and distinct, and the
        // allocator lock keeps every other writer away from them.
        unsafe { core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE as usize) };
    }

    fn phys_to_virt(&self, addr: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.hhdm_offset + addr.as_u64())
    }

    fn idle_entry(&self) -> VirtAddr {
        VirtAddr::new(idle_loop as usize as u64)
    }
}
