//! Process slot table
//!
//! Fixed array of PCBs plus the bitmaps that index it: active slots,
//! ready slots, and allocated PIDs. The termination queue is a small
//! lock-free ring drained by the reaper.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    config::MAX_PROCESSES,
    process::{pcb::Pcb, Pid, ProcessState},
    security::{Privilege, SecurityToken, TokenFlags},
};

/// Lock-free ring of slots awaiting reaping. Indices only advance with
/// atomic operations; overflow means the reaper has been starved long
/// enough to count as structural corruption.
pub struct TerminationQueue {
    entries: [AtomicU32; MAX_PROCESSES],
    head: AtomicU32,
    tail: AtomicU32,
    count: AtomicU32,
}

impl TerminationQueue {
    pub const fn new() -> Self {
        Self {
            entries: [const { AtomicU32::new(0) }; MAX_PROCESSES],
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            count: AtomicU32::new(0),
        }
    }

    pub fn push(&self, slot: u32) {
        if self.count.load(Ordering::Acquire) >= MAX_PROCESSES as u32 {
            panic!("process: termination queue overflow");
        }
        let tail = self.tail.load(Ordering::Relaxed);
        self.entries[tail as usize].store(slot, Ordering::Release);
        self.tail
            .store((tail + 1) % MAX_PROCESSES as u32, Ordering::Release);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn pop(&self) -> Option<u32> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let head = self.head.load(Ordering::Relaxed);
        let slot = self.entries[head as usize].load(Ordering::Acquire);
        self.head
            .store((head + 1) % MAX_PROCESSES as u32, Ordering::Release);
        self.count.fetch_sub(1, Ordering::AcqRel);
        Some(slot)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The slot table.
pub struct ProcessTable {
    pub slots: [Pcb; MAX_PROCESSES],
    /// Bit set iff the slot holds a non-TERMINATED process.
    active_bitmap: u64,
    /// Bit set iff the slot is READY (maintained by the scheduler).
    ready_bitmap: u64,
    /// Bit set iff the PID is owned by a live process.
    pid_bitmap: u64,
    process_count: u32,
    pub termination_queue: TerminationQueue,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { Pcb::empty() }; MAX_PROCESSES],
            active_bitmap: 0,
            ready_bitmap: 0,
            pid_bitmap: 0,
            process_count: 0,
            termination_queue: TerminationQueue::new(),
        }
    }

    /// Set up slot 0 as the always-present idle process.
    pub fn init_idle(&mut self) {
        let idle = &mut self.slots[0];
        idle.pid = 0;
        idle.state.set(ProcessState::Running);
        idle.privilege = Privilege::System;
        idle.token = SecurityToken::issue(0, 0, Privilege::System, TokenFlags::CORE, 0);
        self.active_bitmap |= 1;
        self.pid_bitmap |= 1;
        self.process_count = 1;
    }

    /// Claim the lowest free slot above 0.
    pub fn claim_slot(&mut self) -> Option<usize> {
        let available = !self.active_bitmap & !1u64;
        if available == 0 {
            return None;
        }
        let slot = available.trailing_zeros() as usize;
        if slot >= MAX_PROCESSES {
            return None;
        }
        self.active_bitmap |= 1 << slot;
        Some(slot)
    }

    /// Release a slot claimed by `claim_slot`.
    pub fn release_slot(&mut self, slot: usize) {
        if slot > 0 && slot < MAX_PROCESSES {
            self.active_bitmap &= !(1 << slot);
            self.ready_bitmap &= !(1 << slot);
        }
    }

    /// Allocate the lowest unused PID at or above 1.
    pub fn alloc_pid(&mut self) -> Option<Pid> {
        let available = !self.pid_bitmap & !1u64;
        if available == 0 {
            return None;
        }
        let pid = available.trailing_zeros();
        self.pid_bitmap |= 1 << pid;
        Some(pid)
    }

    pub fn release_pid(&mut self, pid: Pid) {
        if pid != 0 && (pid as usize) < 64 {
            self.pid_bitmap &= !(1 << pid);
        }
    }

    pub fn pid_in_use(&self, pid: Pid) -> bool {
        (pid as usize) < 64 && self.pid_bitmap & (1 << pid) != 0
    }

    /// Slot of a live process by PID.
    pub fn slot_by_pid(&self, pid: Pid) -> Option<usize> {
        let mut bits = self.active_bitmap;
        while bits != 0 {
            let slot = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            if self.slots[slot].pid == pid && self.slots[slot].is_active() {
                return Some(slot);
            }
        }
        None
    }

    pub fn set_ready(&mut self, slot: usize) {
        self.ready_bitmap |= 1 << slot;
    }

    pub fn clear_ready(&mut self, slot: usize) {
        self.ready_bitmap &= !(1 << slot);
    }

    pub fn active_bitmap(&self) -> u64 {
        self.active_bitmap
    }

    pub fn ready_bitmap(&self) -> u64 {
        self.ready_bitmap
    }

    pub fn process_count(&self) -> u32 {
        self.process_count
    }

    pub fn count_up(&mut self) {
        self.process_count += 1;
    }

    pub fn count_down(&mut self) {
        self.process_count = self.process_count.saturating_sub(1);
    }

    /// Popcount of active slots; the integrity monitor compares this
    /// against `process_count`.
    pub fn active_popcount(&self) -> u32 {
        self.active_bitmap.count_ones()
    }

    /// Per-process counters: (cpu time, io ops, preemptions).
    pub fn process_stats(&self, pid: Pid) -> Option<(u64, u32, u32)> {
        let slot = self.slot_by_pid(pid)?;
        let pcb = &self.slots[slot];
        Some((pcb.cpu_time, pcb.io_ops, pcb.preemptions))
    }

    /// Log a table listing with CPU share per process.
    pub fn log_processes(&self) {
        let total_cpu: u64 = (0..MAX_PROCESSES)
            .filter(|&s| s == 0 || self.slots[s].pid != 0)
            .map(|s| self.slots[s].cpu_time)
            .sum::<u64>()
            .max(1);

        log::info!("pid  state       prio  cpu%  io    preempt");
        for slot in 0..MAX_PROCESSES {
            if slot != 0 && self.slots[slot].pid == 0 {
                continue;
            }
            let pcb = &self.slots[slot];
            log::info!(
                "{:<4} {:<11} {:<5} {:<5} {:<5} {}",
                pcb.pid,
                pcb.state.get().as_str(),
                pcb.priority,
                pcb.cpu_time * 100 / total_cpu,
                pcb.io_ops,
                pcb.preemptions
            );
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn idle_occupies_slot_zero() {
        let mut table = ProcessTable::new();
        table.init_idle();
        assert_eq!(table.process_count(), 1);
        assert_eq!(table.active_popcount(), 1);
        assert!(table.pid_in_use(0));
        // Slot 0 is never handed out.
        assert_eq!(table.claim_slot(), Some(1));
    }

    #[test]
    fn pids_start_at_one_and_are_unique() {
        let mut table = ProcessTable::new();
        table.init_idle();
        let a = table.alloc_pid().expect("pid available");
        let b = table.alloc_pid().expect("pid available");
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        table.release_pid(a);
        assert_eq!(table.alloc_pid(), Some(1));
    }

    #[test]
    fn slot_exhaustion_returns_none() {
        let mut table = ProcessTable::new();
        table.init_idle();
        for _ in 1..MAX_PROCESSES {
            table.claim_slot().expect("slots remain");
        }
        assert_eq!(table.claim_slot(), None);
    }

    #[test]
    fn slot_by_pid_ignores_dead_slots() {
        let mut table = ProcessTable::new();
        table.init_idle();
        let slot = table.claim_slot().expect("slot");
        table.slots[slot].pid = 7;
        table.slots[slot].state.set(ProcessState::Ready);
        assert_eq!(table.slot_by_pid(7), Some(slot));

        table.slots[slot].state.set(ProcessState::Terminated);
        assert_eq!(table.slot_by_pid(7), None);
    }

    #[test]
    fn termination_queue_is_fifo() {
        let queue = TerminationQueue::new();
        queue.push(3);
        queue.push(5);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(5));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn active_bitmap_matches_terminated_invariant() {
        let mut table = ProcessTable::new();
        table.init_idle();
        let slot = table.claim_slot().expect("slot");
        table.slots[slot].state.set(ProcessState::Ready);
        assert_ne!(table.active_bitmap() & (1 << slot), 0);

        table.slots[slot] = Pcb::empty();
        table.release_slot(slot);
        assert_eq!(table.active_bitmap() & (1 << slot), 0);
    }
}
