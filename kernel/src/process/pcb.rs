//! Process control block

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    arch::RegisterFrame,
    config::{CPU_BURST_HISTORY, QUANTUM_BASE, RT_PRIORITY_THRESHOLD},
    mm::VirtualAddress,
    process::{Pid, ProcessState, TerminationReason},
    security::{Privilege, SecurityToken},
};

/// Atomic process-state word. All transitions out of RUNNING or into
/// DYING go through `transition` so concurrent terminators cannot both
/// win.
pub struct StateCell(AtomicU32);

impl StateCell {
    pub const fn new(state: ProcessState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    pub fn get(&self) -> ProcessState {
        ProcessState::from_u32(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ProcessState) {
        self.0.store(state as u32, Ordering::Release);
    }

    /// Compare-exchange `from` to `to`; true on success.
    pub fn transition(&self, from: ProcessState, to: ProcessState) -> bool {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Everything the kernel tracks per process.
pub struct Pcb {
    pub pid: Pid,
    pub state: StateCell,
    /// Initial stack top; `None` until a stack is attached.
    pub stack_top: Option<VirtualAddress>,
    /// Register snapshot, restored on dispatch.
    pub context: RegisterFrame,
    pub privilege: Privilege,
    /// Current MLFQ level.
    pub priority: u8,
    /// Level assigned at admission; system processes revert to it.
    pub base_priority: u8,
    pub creation_tick: u64,
    pub last_scheduled_tick: u64,
    /// Accumulated CPU bursts, in ticks.
    pub cpu_time: u64,
    /// Blocking operations observed; drives interactive classification.
    pub io_ops: u32,
    pub preemptions: u32,
    /// Recent CPU bursts, most recent first.
    pub burst_history: [u32; CPU_BURST_HISTORY],
    pub token: SecurityToken,
    /// Index of this process's node in the scheduler arena, if queued.
    pub sched_node: Option<u16>,
    pub term_reason: TerminationReason,
    pub exit_code: u32,
    pub termination_tick: u64,
}

impl Pcb {
    pub const fn empty() -> Self {
        Self {
            pid: 0,
            state: StateCell::new(ProcessState::Terminated),
            stack_top: None,
            context: RegisterFrame::zeroed(),
            privilege: Privilege::User,
            priority: RT_PRIORITY_THRESHOLD,
            base_priority: RT_PRIORITY_THRESHOLD,
            creation_tick: 0,
            last_scheduled_tick: 0,
            cpu_time: 0,
            io_ops: 0,
            preemptions: 0,
            burst_history: [0; CPU_BURST_HISTORY],
            token: SecurityToken::empty(),
            sched_node: None,
            term_reason: TerminationReason::Normal,
            exit_code: 0,
            termination_tick: 0,
        }
    }

    /// Slot holds a live process (anything but TERMINATED).
    pub fn is_active(&self) -> bool {
        self.state.get() != ProcessState::Terminated
    }

    pub fn is_user(&self) -> bool {
        self.privilege != Privilege::System
    }

    /// Push a burst into the history ring, evicting the oldest.
    pub fn record_burst(&mut self, burst: u32) {
        for i in (1..CPU_BURST_HISTORY).rev() {
            self.burst_history[i] = self.burst_history[i - 1];
        }
        self.burst_history[0] = burst;
    }

    /// Arithmetic mean over the burst history.
    pub fn avg_burst(&self) -> u32 {
        let sum: u32 = self.burst_history.iter().sum();
        sum / CPU_BURST_HISTORY as u32
    }

    /// Seed the burst history with a neutral estimate.
    pub fn seed_burst_history(&mut self) {
        self.burst_history = [QUANTUM_BASE / 2; CPU_BURST_HISTORY];
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_exclusive() {
        let cell = StateCell::new(ProcessState::Running);
        assert!(cell.transition(ProcessState::Running, ProcessState::Dying));
        // The second terminator loses the race.
        assert!(!cell.transition(ProcessState::Running, ProcessState::Dying));
        assert_eq!(cell.get(), ProcessState::Dying);
    }

    #[test]
    fn burst_ring_shifts() {
        let mut pcb = Pcb::empty();
        for burst in 1..=4 {
            pcb.record_burst(burst);
        }
        assert_eq!(pcb.burst_history[0], 4);
        assert_eq!(pcb.burst_history[3], 1);
        assert_eq!(pcb.avg_burst(), (4 + 3 + 2 + 1) / CPU_BURST_HISTORY as u32);
    }

    #[test]
    fn zeroed_slot_is_terminated() {
        let pcb = Pcb::empty();
        assert!(!pcb.is_active());
        assert_eq!(pcb.state.get(), ProcessState::Terminated);
    }
}
