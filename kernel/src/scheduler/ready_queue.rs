use alloc::collections::VecDeque;

use crate::processes::process::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEntry {
    pub pid: Pid,
    pub priority: u8,
}

/// FIFO of runnable processes, oldest first.
///
/// Policies receive a clone of this queue, so they see a consistent snapshot
/// without holding the scheduler lock.
#[derive(Debug, Clone, Default)]
pub struct ReadyQueue {
    entries: VecDeque<ReadyEntry>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, pid: Pid, priority: u8) {
        debug_assert!(!self.contains(pid), "{} queued twice", pid);
        self.entries.push_back(ReadyEntry { pid, priority });
    }

    pub fn front(&self) -> Option<&ReadyEntry> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<ReadyEntry> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, pid: Pid) -> bool {
        match self.entries.iter().position(|entry| entry.pid == pid) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.iter().any(|entry| entry.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadyEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_removal() {
        let mut queue = ReadyQueue::new();
        for pid in 1..=3 {
            queue.push_back(Pid(pid), 0);
        }
        assert!(queue.remove(Pid(2)));
        assert!(!queue.remove(Pid(2)));
        assert_eq!(queue.pop_front().map(|e| e.pid), Some(Pid(1)));
        assert_eq!(queue.front().map(|e| e.pid), Some(Pid(3)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn snapshot_is_independent() {
        let mut queue = ReadyQueue::new();
        queue.push_back(Pid(1), 5);
        let snapshot = queue.clone();
        queue.pop_front();
        assert!(queue.is_empty());
        assert!(snapshot.contains(Pid(1)));
        assert_eq!(snapshot.iter().next().map(|e| e.priority), Some(5));
    }
}
