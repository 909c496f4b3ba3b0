//! Integrity monitor
//!
//! A CORE-flagged system process that continuously audits the rest of the
//! system: re-validating security tokens over a rolling window, hunting
//! processes that hold SYSTEM privilege without the flags that justify
//! it, and checking scheduler invariants. Findings raise a threat level;
//! past the first threshold every unprotected process is terminated, past
//! the second the kernel gives up.

use crate::{
    config::*,
    process::{self, lifecycle, ProcessState, ProcessTable},
    sched::{self, scheduler::Mlfq},
    security::{self, Privilege, TokenFlags},
};

/// Threat added per corrupt token.
const THREAT_TOKEN: u32 = 10;
/// Threat added per illicit privilege elevation.
const THREAT_PRIVILEGE: u32 = 20;
/// Threat added per failed structural invariant.
const THREAT_STRUCTURAL: u32 = 20;

/// Walk up to `batch` active slots starting at `cursor`, re-validating
/// tokens. Corrupt processes are force-killed. Returns the threat delta.
pub(crate) fn token_scan(
    sched: &mut Mlfq,
    table: &mut ProcessTable,
    own_pid: u32,
    cursor: &mut usize,
    batch: usize,
) -> u32 {
    let mut threat = 0;

    for _ in 0..batch {
        *cursor = (*cursor + 1) % MAX_PROCESSES;
        let slot = *cursor;
        if table.active_bitmap() & (1 << slot) == 0 {
            continue;
        }

        let pcb = &table.slots[slot];
        let pid = pcb.pid;
        if pid == own_pid {
            continue;
        }
        if !matches!(
            pcb.state.get(),
            ProcessState::Ready | ProcessState::Running | ProcessState::Blocked
        ) {
            continue;
        }

        if !pcb.token.validate(pid) {
            security::record_violation(pid, "token corruption");
            lifecycle::force_kill_locked(sched, table, pid, "token corruption");
            threat += THREAT_TOKEN;
        }
    }

    threat
}

/// Hunt processes running as SYSTEM without SUPERVISOR or CRITICAL
/// authority. Returns the threat delta.
pub(crate) fn privilege_scan(
    sched: &mut Mlfq,
    table: &mut ProcessTable,
    cursor: &mut usize,
    batch: usize,
) -> u32 {
    let mut threat = 0;

    for _ in 0..batch {
        *cursor = (*cursor + 1) % MAX_PROCESSES;
        let slot = *cursor;
        if slot == 0 || table.active_bitmap() & (1 << slot) == 0 {
            continue;
        }

        let pcb = &table.slots[slot];
        let pid = pcb.pid;
        if pcb.privilege == Privilege::System
            && !pcb
                .token
                .flags
                .intersects(TokenFlags::SUPERVISOR | TokenFlags::CRITICAL)
        {
            security::record_violation(pid, "illicit system privilege");
            lifecycle::force_kill_locked(sched, table, pid, "unauthorized privilege escalation");
            threat += THREAT_PRIVILEGE;
        }
    }

    threat
}

/// Verify scheduler structural invariants. Out-of-range current slot is
/// unrecoverable; everything else raises the threat level.
pub(crate) fn consistency_check(sched: &Mlfq, table: &ProcessTable) -> u32 {
    if sched.current >= MAX_PROCESSES {
        panic!("security: scheduler current slot corrupt");
    }
    match sched.check_invariants(table) {
        Ok(()) => 0,
        Err(reason) => {
            log::error!("security: scheduler invariant violated: {}", reason);
            THREAT_STRUCTURAL
        }
    }
}

/// Selective lockdown: terminate everything that is neither CRITICAL nor
/// IMMUNE (nor the monitor itself).
pub(crate) fn lockdown(sched: &mut Mlfq, table: &mut ProcessTable, own_pid: u32) {
    log::error!("security: high threat level, entering selective lockdown");

    for slot in 1..MAX_PROCESSES {
        if table.active_bitmap() & (1 << slot) == 0 {
            continue;
        }
        let pcb = &table.slots[slot];
        let pid = pcb.pid;
        if pid == own_pid || !pcb.is_active() {
            continue;
        }
        if pcb
            .token
            .flags
            .intersects(TokenFlags::CRITICAL | TokenFlags::IMMUNE)
        {
            continue;
        }
        lifecycle::force_kill_locked(sched, table, pid, "system-wide security lockdown");
    }
}

/// Entry point of the integrity monitor process.
pub fn monitor_entry() {
    let own_pid = sched::current_pid();
    log::info!("security: integrity monitor active as pid {}", own_pid);

    let mut threat: u32 = 0;
    let mut token_cursor = 0usize;
    let mut privilege_cursor = 0usize;
    let mut last_token_scan = 0u64;
    let mut last_privilege_scan = 0u64;
    let mut last_consistency = 0u64;
    let mut last_decay = 0u64;

    loop {
        let now = sched::ticks();

        // If the monitor itself is dying, the security system has failed.
        {
            let slot = sched::current_slot();
            let table = process::table();
            let state = table.slots[slot].state.get();
            if matches!(state, ProcessState::Dying | ProcessState::Zombie) {
                panic!("security: integrity monitor terminated, system compromised");
            }
        }

        if now.saturating_sub(last_privilege_scan) >= PRIVILEGE_SCAN_INTERVAL {
            last_privilege_scan = now;
            let mut sched = sched::scheduler();
            let mut table = process::table();
            threat += privilege_scan(
                &mut sched,
                &mut table,
                &mut privilege_cursor,
                PRIVILEGE_SCAN_BATCH,
            );
        }

        if now.saturating_sub(last_token_scan) >= TOKEN_SCAN_INTERVAL {
            last_token_scan = now;
            let mut sched = sched::scheduler();
            let mut table = process::table();
            threat += token_scan(
                &mut sched,
                &mut table,
                own_pid,
                &mut token_cursor,
                TOKEN_SCAN_BATCH,
            );
        }

        if now.saturating_sub(last_consistency) >= SCHED_CONSISTENCY_INTERVAL {
            last_consistency = now;
            let sched = sched::scheduler();
            let table = process::table();
            threat += consistency_check(&sched, &table);
        }

        if threat > THREAT_PANIC_LEVEL {
            panic!("security: threat level indicates unrecoverable corruption");
        }
        if threat > THREAT_LOCKDOWN_LEVEL {
            let mut sched = sched::scheduler();
            let mut table = process::table();
            lockdown(&mut sched, &mut table, own_pid);
            // Drastic action taken; stay alert but step down.
            threat = THREAT_LOCKDOWN_LEVEL / 2;
        }

        if now.saturating_sub(last_decay) >= THREAT_DECAY_INTERVAL && threat > 0 {
            last_decay = now;
            threat -= 1;
        }

        lifecycle::reap_zombies();
        sched::yield_now();
    }
}
