use alloc::vec::Vec;

use crate::error::KernelError;

use super::process::{Pcb, Pid, ProcessState};

#[derive(Debug)]
enum Slot {
    Unused,
    /// Claimed by a `process_create` still allocating the process's pages.
    Reserved,
    Occupied(Pcb),
}

/// Fixed-capacity table of PCBs.
///
/// A PCB's slot index doubles as the index of its saved context, so a slot is
/// only reused once the PCB in it has been reaped.
#[derive(Debug)]
pub struct ProcessTable {
    slots: Vec<Slot>,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Unused);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live PCBs, zombies included.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the first unused slot.
    pub fn reserve(&mut self) -> Result<usize, KernelError> {
        let index = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Unused))
            .ok_or(KernelError::ProcessTableFull)?;
        self.slots[index] = Slot::Reserved;
        Ok(index)
    }

    /// Gives back a slot whose creation failed.
    pub fn release(&mut self, index: usize) {
        if matches!(self.slots.get(index), Some(Slot::Reserved)) {
            self.slots[index] = Slot::Unused;
        }
    }

    /// Fills a reserved slot.
    pub fn install(&mut self, index: usize, pcb: Pcb) {
        debug_assert!(matches!(self.slots[index], Slot::Reserved));
        self.slots[index] = Slot::Occupied(pcb);
    }

    pub fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Occupied(pcb) if pcb.pid() == pid))
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.iter().find(|pcb| pcb.pid() == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.iter_mut().find(|pcb| pcb.pid() == pid)
    }

    /// Looks up a PCB, turning a miss into `NoSuchProcess`.
    pub fn lookup_mut(&mut self, pid: Pid) -> Result<&mut Pcb, KernelError> {
        self.get_mut(pid).ok_or(KernelError::NoSuchProcess(pid))
    }

    /// Frees the slot of a zombie. The PCB is returned for its exit code.
    pub fn reap(&mut self, pid: Pid) -> Result<Pcb, KernelError> {
        let index = self.slot_of(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        let Slot::Occupied(pcb) = &mut self.slots[index] else {
            return Err(KernelError::NoSuchProcess(pid));
        };
        pcb.set_state(ProcessState::Unused)?;

        match core::mem::replace(&mut self.slots[index], Slot::Unused) {
            Slot::Occupied(pcb) => Ok(pcb),
            _ => Err(KernelError::NoSuchProcess(pid)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(pcb) => Some(pcb),
            _ => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Occupied(pcb) => Some(pcb),
            _ => None,
        })
    }
}
