//! Scheduling
//!
//! The MLFQ engine lives in `scheduler`; this module owns the global
//! instance and the couple of atomics that let other subsystems observe
//! scheduler state without taking its lock (current slot, tick count, and
//! the deferred-wake bitmap IPC writes into).

pub mod governor;
pub mod queue;
pub mod scheduler;

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use lazy_static::lazy_static;

use crate::{
    arch::RegisterFrame,
    process,
    sync::{SpinLock, SpinLockGuard},
};

use scheduler::Mlfq;

lazy_static! {
    /// Global scheduler. First in the lock order; nothing else may be
    /// held when acquiring it.
    static ref SCHEDULER: SpinLock<Mlfq> = SpinLock::new(Mlfq::new());
}

/// Mirror of `Mlfq::current`, readable without the scheduler lock.
static CURRENT_SLOT: AtomicU32 = AtomicU32::new(0);
/// Mirror of `Mlfq::ticks`, readable without the scheduler lock.
static TICKS: AtomicU64 = AtomicU64::new(1);
/// Slots flipped READY by IPC sends, waiting to be re-queued at the next
/// tick. Written without the scheduler lock on purpose: IPC holds queue
/// locks, which rank below the scheduler.
static WAKE_PENDING: AtomicU64 = AtomicU64::new(0);

/// Lock the scheduler.
pub fn scheduler() -> SpinLockGuard<'static, Mlfq> {
    SCHEDULER.lock()
}

/// Current scheduler tick.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Slot of the process on the CPU.
pub fn current_slot() -> usize {
    CURRENT_SLOT.load(Ordering::Acquire) as usize
}

/// PID of the process on the CPU.
pub fn current_pid() -> u32 {
    let slot = current_slot();
    process::table().slots[slot].pid
}

/// Defer a wake-up for `slot`; the next tick re-queues it.
pub fn note_wake(slot: usize) {
    WAKE_PENDING.fetch_or(1 << slot, Ordering::AcqRel);
}

/// Timer-interrupt entry: drain deferred wakes, then run the MLFQ tick
/// against the interrupted register frame.
pub fn scheduler_tick(frame: &mut RegisterFrame) {
    let wakes = WAKE_PENDING.swap(0, Ordering::AcqRel);

    let mut sched = SCHEDULER.lock();
    let mut table = process::table();
    if wakes != 0 {
        sched.drain_wakes(&mut table, wakes);
    }
    sched.tick(&mut table, frame);

    CURRENT_SLOT.store(sched.current as u32, Ordering::Release);
    TICKS.store(sched.ticks, Ordering::Release);
}

/// Transition the running process to BLOCKED and request a reschedule.
/// Used by IPC receive; the caller must not hold any lock.
pub fn block_current() {
    let mut sched = SCHEDULER.lock();
    let mut table = process::table();
    let slot = sched.current;
    if slot != 0
        && table.slots[slot].state.transition(
            process::ProcessState::Running,
            process::ProcessState::Blocked,
        )
    {
        sched.on_block(&mut table, slot);
    }
}

/// Voluntarily give up the CPU until the next dispatch.
pub fn yield_now() {
    {
        let mut sched = SCHEDULER.lock();
        let mut table = process::table();
        sched.yield_current(&mut table);
    }
    crate::arch::halt();
}

/// Context switches since boot.
pub fn context_switches() -> u64 {
    SCHEDULER.lock().context_switches()
}

/// Spawn the background service processes and mark the scheduler live.
pub fn init() {
    #[cfg(feature = "integrity-monitor")]
    {
        let pid = process::spawn(
            crate::security::monitor::monitor_entry,
            crate::security::Privilege::System,
            crate::security::TokenFlags::CORE,
        )
        .expect("integrity monitor must start");
        log::info!("sched: integrity monitor running as pid {}", pid);
    }

    #[cfg(feature = "freq-governor")]
    {
        let pid = process::spawn(
            governor::governor_entry,
            crate::security::Privilege::System,
            crate::security::TokenFlags::CORE,
        )
        .expect("frequency governor must start");
        log::info!("sched: frequency governor running as pid {}", pid);
    }

    log::info!("sched: MLFQ online");
}

/// The boot CPU becomes the idle process: reap leftovers and sleep.
pub fn run() -> ! {
    loop {
        process::lifecycle::reap_zombies();
        crate::arch::halt();
    }
}
