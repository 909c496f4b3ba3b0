//! Process lifecycle
//!
//! Creation, termination and reaping. Termination is a CAS-driven state
//! walk: READY/RUNNING/BLOCKED → DYING → ZOMBIE → TERMINATED, with the
//! reaper doing the last step. Permission checks treat an attempt to kill
//! a protected process, or to create a SYSTEM process without SYSTEM
//! privilege, as an attack on the caller's part.

use crate::{
    arch::x86_64::context::RegisterFrame,
    config::{CLEANUP_MAX_PER_CALL, STACK_SIZE},
    ipc,
    mm::{vmm, VirtualAddress},
    process::{self, Pid, ProcessState, ProcessTable, TerminationReason},
    sched::{self, scheduler::Mlfq},
    security::{self, Privilege, SecurityToken, TokenFlags},
};

/// Process-management failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// All process slots are occupied.
    NoFreeSlot,
    /// The PID space is exhausted.
    PidExhausted,
    /// No live process has this PID.
    NotFound,
    /// The caller may not perform this operation.
    PermissionDenied,
    /// Stack allocation failed.
    OutOfMemory,
    /// Entry point was null.
    InvalidEntry,
    /// Another terminator already owns this process.
    AlreadyDying,
}

impl ProcessError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFreeSlot => "no free process slot",
            Self::PidExhausted => "pid space exhausted",
            Self::NotFound => "no such process",
            Self::PermissionDenied => "permission denied",
            Self::OutOfMemory => "out of memory",
            Self::InvalidEntry => "invalid entry point",
            Self::AlreadyDying => "already terminating",
        }
    }
}

impl core::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stack prepared for first dispatch.
#[derive(Debug, Clone, Copy)]
pub struct PreparedStack {
    /// Top of the allocation, for later freeing.
    pub top: VirtualAddress,
    /// Initial RSP: aligned, with the exit stub pushed as return address.
    pub initial_rsp: u64,
}

/// Admit a new process into the table and scheduler. The caller holds
/// both locks; `creator_slot` is the process performing the creation.
pub(crate) fn admit(
    sched: &mut Mlfq,
    table: &mut ProcessTable,
    entry: u64,
    stack: Option<PreparedStack>,
    privilege: Privilege,
    flags: TokenFlags,
    creator_slot: usize,
) -> Result<Pid, ProcessError> {
    if entry == 0 {
        return Err(ProcessError::InvalidEntry);
    }

    let creator_pid = table.slots[creator_slot].pid;
    let creator_privilege = table.slots[creator_slot].privilege;
    let creator_token = table.slots[creator_slot].token;

    // Privilege escalation through process creation is a hostile act.
    if privilege == Privilege::System && creator_privilege != Privilege::System {
        security::record_violation(creator_pid, "unauthorized system process creation");
        force_kill_locked(sched, table, creator_pid, "illegal system process creation");
        return Err(ProcessError::PermissionDenied);
    }

    if !creator_token.validate(creator_pid) {
        security::record_violation(creator_pid, "corrupt token during process creation");
        force_kill_locked(sched, table, creator_pid, "corrupt creator token");
        return Err(ProcessError::PermissionDenied);
    }

    let slot = table.claim_slot().ok_or(ProcessError::NoFreeSlot)?;
    let Some(pid) = table.alloc_pid() else {
        table.release_slot(slot);
        return Err(ProcessError::PidExhausted);
    };

    let now = sched.ticks;
    let pcb = &mut table.slots[slot];
    *pcb = crate::process::Pcb::empty();
    pcb.pid = pid;
    pcb.privilege = privilege;
    pcb.priority = if privilege == Privilege::System {
        0
    } else {
        crate::config::RT_PRIORITY_THRESHOLD
    };
    pcb.base_priority = pcb.priority;
    pcb.creation_tick = now;
    pcb.last_scheduled_tick = now;
    pcb.seed_burst_history();
    pcb.token = SecurityToken::issue(pid, creator_pid, privilege, flags, now);

    pcb.context = RegisterFrame::kernel_entry(
        entry,
        stack.map(|s| s.initial_rsp).unwrap_or(0),
    );
    pcb.stack_top = stack.map(|s| s.top);
    pcb.state.set(ProcessState::Ready);

    table.set_ready(slot);
    table.count_up();
    sched.enqueue_classified(table, slot);

    Ok(pid)
}

/// Create a process with a fresh guarded stack and schedule it.
pub fn spawn(entry: fn(), privilege: Privilege, flags: TokenFlags) -> Result<Pid, ProcessError> {
    let stack = prepare_stack()?;

    let mut sched = sched::scheduler();
    let mut table = process::table();
    let creator_slot = sched.current;

    let result = admit(
        &mut sched,
        &mut table,
        entry as usize as u64,
        Some(stack),
        privilege,
        flags,
        creator_slot,
    );
    if result.is_err() {
        drop(table);
        drop(sched);
        vmm::free_stack(stack.top, STACK_SIZE as u64);
    }
    result
}

/// Allocate a stack (guard page at the low end) and push the exit stub so
/// a plain return from the entry function terminates the process.
fn prepare_stack() -> Result<PreparedStack, ProcessError> {
    let top = vmm::alloc_stack(STACK_SIZE as u64).map_err(|_| ProcessError::OutOfMemory)?;

    let mut rsp = top.as_u64() & !0xF;
    rsp -= 8;
    // SAFETY: rsp points into the just-allocated, mapped stack.
    unsafe { *(rsp as *mut u64) = process_exit_stub as usize as u64 };

    Ok(PreparedStack {
        top,
        initial_rsp: rsp,
    })
}

/// Initial return address of every process: normal exit.
pub extern "C" fn process_exit_stub() {
    let pid = {
        let sched = sched::scheduler();
        let table = process::table();
        table.slots[sched.current].pid
    };
    log::info!("process: pid {} exited normally", pid);
    let _ = kill(pid, TerminationReason::Normal, 0);
    loop {
        crate::arch::halt();
    }
}

/// Terminate `pid` on behalf of the current process, enforcing the
/// protection rules.
pub fn kill(pid: Pid, reason: TerminationReason, exit_code: u32) -> Result<(), ProcessError> {
    let mut sched = sched::scheduler();
    let mut table = process::table();
    let caller_slot = sched.current;
    terminate(&mut sched, &mut table, pid, reason, exit_code, caller_slot)
}

/// Locked-core of `kill`.
pub(crate) fn terminate(
    sched: &mut Mlfq,
    table: &mut ProcessTable,
    pid: Pid,
    reason: TerminationReason,
    exit_code: u32,
    caller_slot: usize,
) -> Result<(), ProcessError> {
    let slot = table.slot_by_pid(pid).ok_or(ProcessError::NotFound)?;
    let state = table.slots[slot].state.get();
    if matches!(
        state,
        ProcessState::Dying | ProcessState::Zombie | ProcessState::Terminated
    ) {
        return Err(ProcessError::AlreadyDying);
    }

    let caller_pid = table.slots[caller_slot].pid;

    // The security path is internal and skips the permission gauntlet.
    if reason != TerminationReason::Security && caller_pid != pid {
        let target_privilege = table.slots[slot].privilege;
        let target_flags = table.slots[slot].token.flags;
        let caller_privilege = table.slots[caller_slot].privilege;

        // Only SYSTEM may kill SYSTEM; IMMUNE is untouchable; killing
        // CRITICAL is itself a violation. Each attempt turns on the caller.
        let offense = if target_privilege == Privilege::System
            && caller_privilege != Privilege::System
        {
            Some("attempted to kill a system process")
        } else if target_flags.contains(TokenFlags::IMMUNE) {
            Some("attempted to kill an immune process")
        } else if target_flags.contains(TokenFlags::CRITICAL) {
            Some("attempted to kill a critical process")
        } else {
            None
        };

        if let Some(offense) = offense {
            security::record_violation(caller_pid, offense);
            force_kill_locked(sched, table, caller_pid, offense);
            return Err(ProcessError::PermissionDenied);
        }

        if !table.slots[caller_slot].token.validate(caller_pid) {
            security::record_violation(caller_pid, "corrupt token during terminate");
            force_kill_locked(sched, table, caller_pid, "corrupt caller token");
            return Err(ProcessError::PermissionDenied);
        }
    }

    // Win the termination race or bow out.
    if !table.slots[slot].state.transition(state, ProcessState::Dying) {
        return Err(ProcessError::AlreadyDying);
    }

    log::info!("process: terminating pid {} ({:?})", pid, reason);
    retire(sched, table, slot, reason, exit_code);
    Ok(())
}

/// The integrity monitor's kill path: overrides IMMUNE and CRITICAL.
pub(crate) fn force_kill_locked(
    sched: &mut Mlfq,
    table: &mut ProcessTable,
    pid: Pid,
    reason: &str,
) {
    let Some(slot) = table.slot_by_pid(pid) else {
        return;
    };
    let state = table.slots[slot].state.get();
    if matches!(state, ProcessState::Zombie | ProcessState::Terminated) {
        return;
    }

    log::error!("security: force-terminating pid {}: {}", pid, reason);
    table.slots[slot].state.set(ProcessState::Dying);
    retire(sched, table, slot, TerminationReason::Security, u32::MAX);
}

/// Kernel wrapper for `force_kill_locked`.
pub fn force_kill(pid: Pid, reason: &str) {
    let mut sched = sched::scheduler();
    let mut table = process::table();
    force_kill_locked(&mut sched, &mut table, pid, reason);
}

/// Shared tail of both termination paths: the slot is already DYING.
fn retire(
    sched: &mut Mlfq,
    table: &mut ProcessTable,
    slot: usize,
    reason: TerminationReason,
    exit_code: u32,
) {
    sched.remove_slot(table, slot);
    table.clear_ready(slot);

    let now = sched.ticks;
    let pcb = &mut table.slots[slot];
    pcb.term_reason = reason;
    pcb.exit_code = exit_code;
    pcb.termination_tick = now;
    let pid = pcb.pid;

    pcb.state.set(ProcessState::Zombie);
    table.termination_queue.push(slot as u32);
    table.release_pid(pid);

    if slot == sched.current {
        sched.quantum_remaining = 0;
        sched.need_resched = true;
    }
}

/// Reap up to a bounded number of zombies: free the stack, clear the IPC
/// ring, zero the control block, release the slot.
pub(crate) fn reap(table: &mut ProcessTable) -> usize {
    let mut reaped = 0;

    while reaped < CLEANUP_MAX_PER_CALL {
        let Some(slot) = table.termination_queue.pop() else {
            break;
        };
        let slot = slot as usize;

        if table.slots[slot].state.get() != ProcessState::Zombie {
            log::warn!(
                "process: non-zombie slot {} in termination queue ({})",
                slot,
                table.slots[slot].state.get().as_str()
            );
            continue;
        }

        let pid = table.slots[slot].pid;
        let stack = table.slots[slot].stack_top.take();
        if let Some(top) = stack {
            vmm::free_stack(top, STACK_SIZE as u64);
        }
        ipc::flush_slot(slot);

        table.slots[slot] = crate::process::Pcb::empty();
        table.release_slot(slot);
        table.count_down();
        reaped += 1;

        log::debug!("process: reaped pid {}", pid);
    }

    reaped
}

/// Kernel wrapper for the reaper, used by the background maintenance
/// loops.
pub fn reap_zombies() -> usize {
    let mut table = process::table();
    reap(&mut table)
}

/// Terminate the calling process; does not return to the caller's logic.
pub fn exit_current(exit_code: u32) {
    let mut sched = sched::scheduler();
    let mut table = process::table();
    let slot = sched.current;
    let pid = table.slots[slot].pid;
    let _ = terminate(
        &mut sched,
        &mut table,
        pid,
        TerminationReason::Normal,
        exit_code,
        slot,
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::scheduler::Mlfq;

    fn fresh() -> (Mlfq, ProcessTable) {
        let mut table = ProcessTable::new();
        table.init_idle();
        (Mlfq::new(), table)
    }

    fn admit_user(sched: &mut Mlfq, table: &mut ProcessTable) -> Pid {
        admit(
            sched,
            table,
            0x1000,
            None,
            Privilege::User,
            TokenFlags::empty(),
            0,
        )
        .expect("admission from idle succeeds")
    }

    #[test]
    fn admit_assigns_pid_and_enqueues() {
        let (mut sched, mut table) = fresh();
        let pid = admit_user(&mut sched, &mut table);
        assert_eq!(pid, 1);

        let slot = table.slot_by_pid(pid).expect("live process");
        assert_eq!(table.slots[slot].state.get(), ProcessState::Ready);
        assert!(table.slots[slot].sched_node.is_some());
        assert!(table.slots[slot].token.validate(pid));
        assert_eq!(table.process_count(), 2);
    }

    #[test]
    fn user_cannot_create_system_process() {
        let (mut sched, mut table) = fresh();
        let pid = admit_user(&mut sched, &mut table);
        let slot = table.slot_by_pid(pid).expect("live");

        let result = admit(
            &mut sched,
            &mut table,
            0x2000,
            None,
            Privilege::System,
            TokenFlags::empty(),
            slot,
        );
        assert_eq!(result, Err(ProcessError::PermissionDenied));
        // The hostile caller was taken down.
        assert_eq!(table.slots[slot].state.get(), ProcessState::Zombie);
    }

    #[test]
    fn terminate_walks_to_zombie_and_frees_pid() {
        let (mut sched, mut table) = fresh();
        let pid = admit_user(&mut sched, &mut table);
        let slot = table.slot_by_pid(pid).expect("live");

        terminate(
            &mut sched,
            &mut table,
            pid,
            TerminationReason::Killed,
            1,
            0,
        )
        .expect("idle may kill a user process");

        assert_eq!(table.slots[slot].state.get(), ProcessState::Zombie);
        assert!(!table.pid_in_use(pid));
        assert!(table.slots[slot].sched_node.is_none());
        assert_eq!(table.termination_queue.len(), 1);
    }

    #[test]
    fn double_terminate_loses_race() {
        let (mut sched, mut table) = fresh();
        let pid = admit_user(&mut sched, &mut table);

        terminate(&mut sched, &mut table, pid, TerminationReason::Killed, 0, 0)
            .expect("first terminate");
        // The zombie cannot be terminated a second time.
        assert_eq!(
            terminate(&mut sched, &mut table, pid, TerminationReason::Killed, 0, 0),
            Err(ProcessError::AlreadyDying)
        );
    }

    #[test]
    fn immune_process_survives_user_kill() {
        let (mut sched, mut table) = fresh();
        // An immune system service, created by idle.
        let service = admit(
            &mut sched,
            &mut table,
            0x3000,
            None,
            Privilege::System,
            TokenFlags::IMMUNE,
            0,
        )
        .expect("idle creates system service");
        let attacker = admit_user(&mut sched, &mut table);
        let attacker_slot = table.slot_by_pid(attacker).expect("live");

        let result = terminate(
            &mut sched,
            &mut table,
            service,
            TerminationReason::Killed,
            0,
            attacker_slot,
        );
        assert_eq!(result, Err(ProcessError::PermissionDenied));

        let service_slot = table.slot_by_pid(service).expect("service survives");
        assert_eq!(table.slots[service_slot].state.get(), ProcessState::Ready);
        // The attacker did not.
        assert_eq!(
            table.slots[attacker_slot].state.get(),
            ProcessState::Zombie
        );
    }

    #[test]
    fn force_kill_overrides_immunity() {
        let (mut sched, mut table) = fresh();
        let service = admit(
            &mut sched,
            &mut table,
            0x3000,
            None,
            Privilege::System,
            TokenFlags::CORE,
            0,
        )
        .expect("core service");
        let slot = table.slot_by_pid(service).expect("live");
        force_kill_locked(&mut sched, &mut table, service, "token corruption");
        assert_eq!(table.slots[slot].state.get(), ProcessState::Zombie);
        assert!(!table.pid_in_use(service));
    }

    #[test]
    fn reaper_returns_slot_to_terminated() {
        let (mut sched, mut table) = fresh();
        let pid = admit_user(&mut sched, &mut table);
        let slot = table.slot_by_pid(pid).expect("live");
        terminate(&mut sched, &mut table, pid, TerminationReason::Killed, 0, 0)
            .expect("terminate");

        let reaped = reap(&mut table);
        assert_eq!(reaped, 1);
        assert_eq!(table.slots[slot].state.get(), ProcessState::Terminated);
        assert_eq!(table.active_bitmap() & (1 << slot), 0);
        assert_eq!(table.process_count(), 1);
        // A blocked process whose owner died never wakes: slot reusable.
        assert_eq!(table.claim_slot(), Some(slot));
    }
}
