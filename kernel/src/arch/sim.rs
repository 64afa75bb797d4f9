//! A CPU that only exists in memory, for host-side tests.
//!
//! Physical pages are modelled by a single tag word each, enough to see that
//! the compactor carried a page's contents along with it.

use alloc::{collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use crate::processes::registers::Context;

use super::Cpu;

/// Entry point reported for the idle context.
pub const SIM_IDLE_ENTRY: u64 = 0xffff_8000_0000_1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRecord {
    pub from_rip: u64,
    pub to_rip: u64,
}

pub struct SimulatedCpu {
    interrupts_enabled: AtomicBool,
    live: Mutex<Context>,
    page_tags: Mutex<BTreeMap<u64, u64>>,
    switches: Mutex<Vec<SwitchRecord>>,
}

impl Default for SimulatedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCpu {
    pub fn new() -> Self {
        Self {
            interrupts_enabled: AtomicBool::new(true),
            live: Mutex::new(Context::new()),
            page_tags: Mutex::new(BTreeMap::new()),
            switches: Mutex::new(Vec::new()),
        }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    /// The register file currently "on the CPU".
    pub fn live_context(&self) -> Context {
        *self.live.lock()
    }

    /// Lets a test play the running process, e.g. by moving its stack pointer.
    pub fn update_live_context(&self, f: impl FnOnce(&mut Context)) {
        f(&mut self.live.lock());
    }

    pub fn switch_log(&self) -> Vec<SwitchRecord> {
        self.switches.lock().clone()
    }

    pub fn write_page_tag(&self, page: PhysAddr, tag: u64) {
        self.page_tags.lock().insert(page.as_u64(), tag);
    }

    pub fn page_tag(&self, page: PhysAddr) -> Option<u64> {
        self.page_tags.lock().get(&page.as_u64()).copied()
    }
}

impl Cpu for SimulatedCpu {
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let was_enabled = self.interrupts_enabled.swap(false, Ordering::SeqCst);
        let result = f();
        if was_enabled {
            self.interrupts_enabled.store(true, Ordering::SeqCst);
        }
        result
    }

    unsafe fn save_and_switch(&self, old: &mut Context, new: &Context) {
        assert!(
            !self.interrupts_enabled(),
            "context switch with interrupts enabled"
        );
        let mut live = self.live.lock();
        *old = *live;
        *live = *new;
        self.switches.lock().push(SwitchRecord {
            from_rip: old.rip,
            to_rip: new.rip,
        });
    }

    fn copy_page(&self, from: PhysAddr, to: PhysAddr) {
        let mut tags = self.page_tags.lock();
        match tags.get(&from.as_u64()).copied() {
            Some(tag) => tags.insert(to.as_u64(), tag),
            None => tags.remove(&to.as_u64()),
        };
    }

    fn phys_to_virt(&self, addr: PhysAddr) -> VirtAddr {
        VirtAddr::new(addr.as_u64())
    }

    fn idle_entry(&self) -> VirtAddr {
        VirtAddr::new(SIM_IDLE_ENTRY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_mask_nests() {
        let cpu = SimulatedCpu::new();
        cpu.without_interrupts(|| {
            cpu.without_interrupts(|| assert!(!cpu.interrupts_enabled()));
            assert!(!cpu.interrupts_enabled());
        });
        assert!(cpu.interrupts_enabled());
    }

    #[test]
    fn switch_saves_live_and_loads_new() {
        let cpu = SimulatedCpu::new();
        cpu.update_live_context(|ctx| ctx.rip = 0x1000);
        let mut old = Context::new();
        let new = Context {
            rip: 0x2000,
            ..Context::new()
        };
        cpu.without_interrupts(|| unsafe { cpu.save_and_switch(&mut old, &new) });
        assert_eq!(old.rip, 0x1000);
        assert_eq!(cpu.live_context().rip, 0x2000);
        assert_eq!(
            cpu.switch_log(),
            [SwitchRecord {
                from_rip: 0x1000,
                to_rip: 0x2000
            }]
        );
    }

    #[test]
    #[should_panic(expected = "interrupts enabled")]
    fn switch_requires_masked_interrupts() {
        let cpu = SimulatedCpu::new();
        let mut old = Context::new();
        unsafe { cpu.save_and_switch(&mut old, &Context::new()) };
    }

    #[test]
    fn page_copy_carries_the_tag() {
        let cpu = SimulatedCpu::new();
        let (a, b) = (PhysAddr::new(0x1000), PhysAddr::new(0x2000));
        cpu.write_page_tag(a, 7);
        cpu.copy_page(a, b);
        assert_eq!(cpu.page_tag(b), Some(7));
        cpu.copy_page(PhysAddr::new(0x3000), b);
        assert_eq!(cpu.page_tag(b), None);
    }
}
