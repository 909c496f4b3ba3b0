//! MLFQ scheduler
//!
//! Eight priority levels: the lowest-indexed few are real-time and always
//! win; the rest decay geometrically in quantum and are subject to load
//! balancing. Processes classify on admission by privilege, I/O history
//! and CPU-burst history, demote when they burn full quanta, and are
//! pulled back up by two periodic passes (fairness boost and aging) so
//! nothing starves.
//!
//! `tick` is the timer entry point: it accounts the running process,
//! decides preemption, picks the best queue, and swaps register frames.

use crate::{
    arch::RegisterFrame,
    config::*,
    process::{lifecycle, ProcessState, ProcessTable},
    security::{self, Privilege, TokenFlags},
};

use super::queue::{NodePool, RunQueue, NIL};

/// Bit mask of the real-time levels.
const RT_MASK: u32 = (1 << RT_PRIORITY_THRESHOLD) - 1;

/// Scratch buffer for walking a queue while relocating its nodes.
const WALK_BUF: usize = MAX_PROCESSES;

/// The scheduler state machine.
pub struct Mlfq {
    pub queues: [RunQueue; MAX_PRIORITY_LEVELS],
    nodes: NodePool,
    /// Bit set iff the level's queue is non-empty.
    active_bitmap: u32,
    /// Slot currently on the CPU (0 = idle).
    pub current: usize,
    pub quantum_remaining: u32,
    pub ticks: u64,
    last_aging_tick: u64,
    /// Processes currently linked into ready queues.
    total_queued: u32,
    pub need_resched: bool,
    context_switches: u64,
    scheduler_calls: u64,
    /// EMA of observed dispatch overhead, in ticks.
    context_switch_overhead: u32,
}

impl Mlfq {
    pub fn new() -> Self {
        let mut queues = [const { RunQueue::new() }; MAX_PRIORITY_LEVELS];
        for (level, queue) in queues.iter_mut().enumerate() {
            queue.quantum = if (level as u8) < RT_PRIORITY_THRESHOLD {
                // Real-time quanta grow toward level 0.
                (QUANTUM_BASE << (RT_PRIORITY_THRESHOLD - level as u8)).min(QUANTUM_MAX)
            } else {
                // Regular quanta decay geometrically.
                (QUANTUM_BASE >> ((level as u8 - RT_PRIORITY_THRESHOLD) as u32 * QUANTUM_DECAY_SHIFT))
                    .max(QUANTUM_MIN)
            };
            queue.avg_burst = QUANTUM_BASE;
        }

        Self {
            queues,
            nodes: NodePool::new(),
            active_bitmap: 0,
            current: 0,
            quantum_remaining: 0,
            ticks: 1,
            last_aging_tick: 0,
            total_queued: 0,
            need_resched: false,
            context_switches: 0,
            scheduler_calls: 0,
            context_switch_overhead: 5,
        }
    }

    /// Pick the admission level for a process.
    fn classify(table: &ProcessTable, slot: usize) -> u8 {
        let pcb = &table.slots[slot];

        if pcb.privilege == Privilege::System && pcb.token.flags.contains(TokenFlags::CRITICAL) {
            return 0;
        }
        if pcb.io_ops > IO_BOOST_THRESHOLD {
            return 1;
        }

        let avg = pcb.avg_burst();
        if avg < QUANTUM_BASE / INTERACTIVE_AGGRESSIVE_DIVISOR {
            2
        } else if avg < QUANTUM_BASE / INTERACTIVE_BURST_DIVISOR {
            3
        } else {
            (MAX_PRIORITY_LEVELS - 1) as u8
        }
    }

    /// Link `slot` into the queue of `level`.
    fn link(&mut self, table: &mut ProcessTable, slot: usize, level: u8) {
        let idx = self
            .nodes
            .alloc(slot as u16)
            .expect("scheduler node pool sized to the process table");
        self.queues[level as usize].push_back(&mut self.nodes, idx);
        self.active_bitmap |= 1 << level;
        self.total_queued += 1;

        let pcb = &mut table.slots[slot];
        pcb.sched_node = Some(idx);
        pcb.last_scheduled_tick = self.ticks;
    }

    /// Admission / wake-from-scratch enqueue: classify, then link.
    pub fn enqueue_classified(&mut self, table: &mut ProcessTable, slot: usize) {
        if slot == 0 || table.slots[slot].state.get() != ProcessState::Ready {
            return;
        }
        let level = Self::classify(table, slot).min((MAX_PRIORITY_LEVELS - 1) as u8);
        table.slots[slot].priority = level;
        self.link(table, slot, level);
    }

    /// Re-enqueue a preempted process at its current (already adjusted)
    /// priority.
    fn requeue(&mut self, table: &mut ProcessTable, slot: usize) {
        if slot == 0 || table.slots[slot].state.get() != ProcessState::Ready {
            return;
        }
        let level = table.slots[slot].priority.min((MAX_PRIORITY_LEVELS - 1) as u8);
        self.link(table, slot, level);
    }

    fn clear_bit_if_empty(&mut self, level: usize) {
        if self.queues[level].is_empty() {
            self.active_bitmap &= !(1 << level);
        }
    }

    /// Unlink `slot` from whatever queue holds it.
    pub fn remove_slot(&mut self, table: &mut ProcessTable, slot: usize) {
        let Some(idx) = table.slots[slot].sched_node.take() else {
            return;
        };
        let level = table.slots[slot].priority.min((MAX_PRIORITY_LEVELS - 1) as u8) as usize;
        self.queues[level].detach(&mut self.nodes, idx);
        self.nodes.free(idx);
        self.clear_bit_if_empty(level);
        self.total_queued = self.total_queued.saturating_sub(1);
    }

    /// Move a queued process to another level without resetting its wait
    /// clock.
    fn relocate(&mut self, table: &mut ProcessTable, slot: usize, new_level: u8) {
        let Some(idx) = table.slots[slot].sched_node else {
            table.slots[slot].priority = new_level;
            return;
        };
        let old_level = table.slots[slot].priority.min((MAX_PRIORITY_LEVELS - 1) as u8) as usize;
        self.queues[old_level].detach(&mut self.nodes, idx);
        self.clear_bit_if_empty(old_level);

        table.slots[slot].priority = new_level;
        self.queues[new_level as usize].push_back(&mut self.nodes, idx);
        self.active_bitmap |= 1 << new_level;
    }

    /// Best level to run next: real-time always wins; regular levels are
    /// skipped while overloaded if another regular level has work.
    fn find_best_queue(&self) -> Option<usize> {
        if self.active_bitmap == 0 {
            return None;
        }

        let rt_active = self.active_bitmap & RT_MASK;
        if rt_active != 0 {
            return Some(rt_active.trailing_zeros() as usize);
        }

        let regular = self.active_bitmap & !RT_MASK;
        if regular == 0 {
            return None;
        }
        for level in RT_PRIORITY_THRESHOLD as usize..MAX_PRIORITY_LEVELS {
            if regular & (1 << level) != 0 {
                if self.queues[level].count > LOAD_BALANCE_THRESHOLD
                    && regular & !(1 << level) != 0
                {
                    continue;
                }
                return Some(level);
            }
        }
        Some(regular.trailing_zeros() as usize)
    }

    /// Periodic promotion of READY processes that have waited too long:
    /// system processes toward level 0, user processes toward the top
    /// regular level.
    fn fairness_boost(&mut self, table: &mut ProcessTable) {
        let mut bits = table.active_bitmap() & !1u64;
        while bits != 0 {
            let slot = bits.trailing_zeros() as usize;
            bits &= bits - 1;

            if table.slots[slot].state.get() != ProcessState::Ready {
                continue;
            }
            let wait = self.ticks.saturating_sub(table.slots[slot].last_scheduled_tick);
            if wait <= FAIRNESS_WAIT_THRESHOLD && wait <= STARVATION_THRESHOLD {
                continue;
            }

            let target = if table.slots[slot].privilege == Privilege::System {
                0
            } else {
                RT_PRIORITY_THRESHOLD
            };
            if table.slots[slot].priority > target {
                self.relocate(table, slot, target);
            }
        }
    }

    /// Aging pass over the regular queues: anything past the adaptive
    /// threshold is pulled up and its wait clock restarted.
    fn aging(&mut self, table: &mut ProcessTable) {
        // System load scales the threshold down so heavy load ages faster.
        let mut total_waiting: u64 = 0;
        for level in 0..MAX_PRIORITY_LEVELS {
            let mut level_wait: u64 = 0;
            let mut idx = self.queues[level].head();
            while idx != NIL {
                let slot = self.nodes.slot_of(idx) as usize;
                level_wait += self.ticks.saturating_sub(table.slots[slot].last_scheduled_tick);
                idx = self.nodes.next_of(idx);
            }
            self.queues[level].total_wait = level_wait;
            total_waiting += level_wait;
        }

        let mut threshold = AGING_THRESHOLD_BASE;
        if total_waiting > self.total_queued as u64 * FAIRNESS_WAIT_THRESHOLD {
            threshold /= AGING_ACCELERATION_FACTOR;
        }

        for level in RT_PRIORITY_THRESHOLD as usize..MAX_PRIORITY_LEVELS {
            // Snapshot the chain first; relocation edits it underneath us.
            let mut slots = [0u16; WALK_BUF];
            let mut n = 0;
            let mut idx = self.queues[level].head();
            while idx != NIL && n < WALK_BUF {
                slots[n] = self.nodes.slot_of(idx);
                n += 1;
                idx = self.nodes.next_of(idx);
            }

            for &slot16 in &slots[..n] {
                let slot = slot16 as usize;
                let wait = self.ticks.saturating_sub(table.slots[slot].last_scheduled_tick);
                if wait <= threshold && wait <= STARVATION_THRESHOLD {
                    continue;
                }

                let target = if table.slots[slot].privilege == Privilege::System {
                    0
                } else {
                    RT_PRIORITY_THRESHOLD
                };
                if table.slots[slot].priority > target {
                    self.relocate(table, slot, target);
                    table.slots[slot].last_scheduled_tick = self.ticks;
                }
            }
        }
    }

    /// Final gate before dispatch: a candidate with a corrupt token or an
    /// illicit privilege combination is terminated instead of run.
    fn preflight(&mut self, table: &mut ProcessTable, slot: usize) -> bool {
        if slot == 0 {
            return true;
        }
        let pid = table.slots[slot].pid;

        if !table.slots[slot].token.validate(pid) {
            security::record_violation(pid, "preflight token validation failure");
            lifecycle::force_kill_locked(self, table, pid, "preflight token failure");
            return false;
        }

        if table.slots[slot].privilege == Privilege::System
            && !table.slots[slot]
                .token
                .flags
                .intersects(TokenFlags::SUPERVISOR | TokenFlags::CRITICAL | TokenFlags::IMMUNE)
        {
            security::record_violation(pid, "illicit SYSTEM privilege");
            lifecycle::force_kill_locked(self, table, pid, "unauthorized privilege escalation");
            return false;
        }

        true
    }

    /// Pop the next runnable slot, or 0 for idle.
    fn select_next(&mut self, table: &mut ProcessTable) -> usize {
        loop {
            let Some(level) = self.find_best_queue() else {
                return 0;
            };
            let Some(slot) = self.queues[level].pop_front(&mut self.nodes) else {
                // Bitmap said otherwise; resynchronize and retry.
                self.clear_bit_if_empty(level);
                continue;
            };
            let slot = slot as usize;
            self.clear_bit_if_empty(level);
            self.total_queued = self.total_queued.saturating_sub(1);
            table.slots[slot].sched_node = None;

            if !self.preflight(table, slot) {
                continue;
            }
            if table.slots[slot].state.get() != ProcessState::Ready {
                continue;
            }
            return slot;
        }
    }

    /// Timer entry point.
    pub fn tick(&mut self, table: &mut ProcessTable, frame: &mut RegisterFrame) {
        self.scheduler_calls += 1;
        self.ticks += 1;

        if self.ticks % FAIRNESS_BOOST_INTERVAL == 0 {
            self.fairness_boost(table);
        }
        if self.ticks.saturating_sub(self.last_aging_tick) >= 2 * BOOST_INTERVAL {
            self.aging(table);
            self.last_aging_tick = self.ticks;
        }

        let old_slot = self.current;
        let mut requeue_old = false;

        if old_slot == 0 {
            // Idle keeps its context up to date and always yields.
            table.slots[0].context = *frame;
            self.need_resched = false;
        } else {
            let state = table.slots[old_slot].state.get();
            if !matches!(
                state,
                ProcessState::Dying | ProcessState::Zombie | ProcessState::Terminated
            ) {
                let level = table.slots[old_slot].priority.min((MAX_PRIORITY_LEVELS - 1) as u8);
                let burst = self.queues[level as usize]
                    .quantum
                    .saturating_sub(self.quantum_remaining);

                {
                    let pcb = &mut table.slots[old_slot];
                    pcb.record_burst(burst);
                    pcb.cpu_time += burst as u64;
                }

                let pid = table.slots[old_slot].pid;
                if !table.slots[old_slot].token.validate(pid) {
                    // The token went bad while the process ran.
                    security::record_violation(pid, "post-execution token corruption");
                    lifecycle::force_kill_locked(self, table, pid, "token corruption");
                } else {
                    table.slots[old_slot].context = *frame;

                    if self.quantum_remaining > 0 {
                        self.quantum_remaining -= 1;
                    }

                    let best = self.find_best_queue();
                    let mut should_preempt = self.need_resched;
                    if let Some(best) = best {
                        let priority = table.slots[old_slot].priority;
                        if best as u8 == CRITICAL_PREEMPTION_LEVEL
                            && priority > PREEMPTION_MIN_PRIORITY_GAP
                        {
                            should_preempt = true;
                        }
                        if (best as u8).saturating_add(PREEMPTION_BIAS) < priority {
                            should_preempt = true;
                        }
                    }
                    if self.quantum_remaining == 0 {
                        should_preempt = true;
                    }

                    if !should_preempt {
                        return;
                    }
                    self.need_resched = false;

                    if state == ProcessState::Blocked {
                        // Blocked in receive: off the CPU, not requeued.
                        table.clear_ready(old_slot);
                    } else {
                        let full_quantum = self.quantum_remaining == 0;
                        let pcb = &mut table.slots[old_slot];
                        pcb.state.set(ProcessState::Ready);
                        pcb.preemptions += 1;

                        if pcb.is_user() {
                            if full_quantum {
                                // CPU hog: one level down, bounded.
                                pcb.priority =
                                    (pcb.priority + 1).min((MAX_PRIORITY_LEVELS - 1) as u8);
                            } else if burst < self.queues[level as usize].quantum / 2
                                && pcb.priority > RT_PRIORITY_THRESHOLD
                            {
                                // Yielded early: interactive, pull it up.
                                pcb.priority = RT_PRIORITY_THRESHOLD;
                            }
                        } else if pcb.priority > pcb.base_priority {
                            pcb.priority = pcb.base_priority;
                        }

                        table.set_ready(old_slot);
                        requeue_old = true;
                    }
                }
            }
        }

        if requeue_old {
            self.requeue(table, old_slot);
        }

        let next_slot = self.select_next(table);
        self.current = next_slot;

        if next_slot == 0 {
            self.quantum_remaining = 0;
            *frame = table.slots[0].context;
            return;
        }

        let pcb = &mut table.slots[next_slot];
        pcb.state.set(ProcessState::Running);
        let level = pcb.priority.min((MAX_PRIORITY_LEVELS - 1) as u8) as usize;

        let mut quantum = self.queues[level].quantum;
        if pcb.io_ops >= IO_BOOST_THRESHOLD * 3 {
            quantum = quantum * IO_QUANTUM_BOOST.0 / IO_QUANTUM_BOOST.1;
        }
        if pcb.avg_burst() > quantum * CPU_INTENSIVE_MULTIPLIER {
            quantum = quantum * CPU_QUANTUM_PENALTY.0 / CPU_QUANTUM_PENALTY.1;
        }
        self.quantum_remaining = quantum.max(1);

        pcb.last_scheduled_tick = self.ticks;
        *frame = pcb.context;
        table.clear_ready(next_slot);

        self.context_switches += 1;
        // Dispatch happens within one tick, so the observed overhead is
        // the tick delta (usually zero); keep the estimator moving anyway.
        self.context_switch_overhead = (self.context_switch_overhead * 7) / 8;
    }

    /// The running process is blocking (IPC receive): account the partial
    /// burst and ask for a reschedule.
    pub fn on_block(&mut self, table: &mut ProcessTable, slot: usize) {
        let level = table.slots[slot].priority.min((MAX_PRIORITY_LEVELS - 1) as u8) as usize;
        table.slots[slot].io_ops += 1;

        if slot == self.current {
            let partial = self.queues[level]
                .quantum
                .saturating_sub(self.quantum_remaining);
            table.slots[slot].record_burst(partial);
            self.quantum_remaining = 0;
            self.need_resched = true;
        }
    }

    /// A blocked process was flipped READY by a sender; put it back in a
    /// queue, promoting user processes into the interactive band.
    pub fn wake(&mut self, table: &mut ProcessTable, slot: usize) {
        if table.slots[slot].state.get() != ProcessState::Ready {
            return;
        }
        if table.slots[slot].sched_node.is_some() {
            return;
        }
        if table.slots[slot].is_user() && table.slots[slot].priority > RT_PRIORITY_THRESHOLD {
            table.slots[slot].priority = RT_PRIORITY_THRESHOLD;
        }
        table.set_ready(slot);
        self.requeue(table, slot);
    }

    /// Drain the deferred-wake bitmap collected outside the scheduler
    /// lock.
    pub fn drain_wakes(&mut self, table: &mut ProcessTable, mut bits: u64) {
        while bits != 0 {
            let slot = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            self.wake(table, slot);
        }
    }

    /// Voluntary yield: back to READY, reschedule on the next tick.
    pub fn yield_current(&mut self, table: &mut ProcessTable) {
        let slot = self.current;
        if slot != 0
            && table.slots[slot]
                .state
                .transition(ProcessState::Running, ProcessState::Ready)
        {
            table.set_ready(slot);
        }
        self.need_resched = true;
    }

    /// Structural invariants the integrity monitor verifies periodically.
    pub fn check_invariants(&self, table: &ProcessTable) -> Result<(), &'static str> {
        if self.current >= MAX_PROCESSES {
            return Err("current slot out of range");
        }
        if table.active_popcount() != table.process_count() {
            return Err("active bitmap / process count mismatch");
        }
        for level in 0..MAX_PRIORITY_LEVELS {
            if self.queues[level].count != self.queues[level].walk_length(&self.nodes) {
                return Err("queue count diverges from chain length");
            }
            let bit_set = self.active_bitmap & (1 << level) != 0;
            if bit_set == self.queues[level].is_empty() {
                return Err("active bitmap diverges from queue state");
            }
        }
        Ok(())
    }

    pub fn context_switches(&self) -> u64 {
        self.context_switches
    }

    pub fn scheduler_calls(&self) -> u64 {
        self.scheduler_calls
    }

    pub fn switch_overhead(&self) -> u32 {
        self.context_switch_overhead
    }

    pub fn total_queued(&self) -> u32 {
        self.total_queued
    }

    /// Queue-depth summary for the frequency governor:
    /// (total, max, real-time, active queue count).
    pub fn queue_depths(&self) -> (u32, u32, u32, u32) {
        let mut total = 0;
        let mut max = 0;
        let mut rt = 0;
        let mut active = 0;
        for (level, queue) in self.queues.iter().enumerate() {
            total += queue.count;
            max = max.max(queue.count);
            if (level as u8) < RT_PRIORITY_THRESHOLD {
                rt += queue.count;
            }
            if !queue.is_empty() {
                active += 1;
            }
        }
        (total, max, rt, active)
    }

    /// Log per-level queue state and headline counters.
    pub fn log_state(&self) {
        log::info!(
            "sched: current={} quantum={} queued={} switches={} overhead={}",
            self.current,
            self.quantum_remaining,
            self.total_queued,
            self.context_switches,
            self.context_switch_overhead
        );
        for (level, queue) in self.queues.iter().enumerate() {
            if !queue.is_empty() {
                log::info!(
                    "  L{}{}: {} procs, quantum {}",
                    level,
                    if (level as u8) < RT_PRIORITY_THRESHOLD {
                        " (rt)"
                    } else {
                        ""
                    },
                    queue.count,
                    queue.quantum
                );
            }
        }
    }
}

impl Default for Mlfq {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::{lifecycle::admit, TerminationReason};
    use crate::security::SecurityToken;

    fn fresh() -> (Mlfq, ProcessTable, RegisterFrame) {
        let mut table = ProcessTable::new();
        table.init_idle();
        (Mlfq::new(), table, RegisterFrame::zeroed())
    }

    fn admit_proc(
        sched: &mut Mlfq,
        table: &mut ProcessTable,
        privilege: Privilege,
        flags: TokenFlags,
    ) -> usize {
        let pid = admit(sched, table, 0x1000, None, privilege, flags, 0)
            .expect("admission succeeds");
        table.slot_by_pid(pid).expect("just admitted")
    }

    #[test]
    fn quantum_table_shape() {
        let sched = Mlfq::new();
        // RT quanta grow toward level 0.
        assert!(sched.queues[0].quantum > sched.queues[1].quantum);
        assert!(sched.queues[1].quantum > sched.queues[RT_PRIORITY_THRESHOLD as usize].quantum);
        // Regular quanta decay but respect the floor.
        assert!(sched.queues[MAX_PRIORITY_LEVELS - 1].quantum >= QUANTUM_MIN);
    }

    #[test]
    fn critical_system_process_classifies_to_level_zero() {
        let (mut sched, mut table, _) = fresh();
        let slot = admit_proc(
            &mut sched,
            &mut table,
            Privilege::System,
            TokenFlags::CORE,
        );
        assert_eq!(table.slots[slot].priority, 0);
    }

    #[test]
    fn io_heavy_process_classifies_interactive() {
        let (mut sched, mut table, _) = fresh();
        let slot = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        // Rebuild with a heavy I/O history and re-admit.
        sched.remove_slot(&mut table, slot);
        table.slots[slot].io_ops = IO_BOOST_THRESHOLD + 1;
        sched.enqueue_classified(&mut table, slot);
        assert_eq!(table.slots[slot].priority, 1);
    }

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let (mut sched, mut table, mut frame) = fresh();
        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, 0);
        assert_eq!(sched.quantum_remaining, 0);
    }

    #[test]
    fn dispatch_restores_context_and_sets_running() {
        let (mut sched, mut table, mut frame) = fresh();
        let slot = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        table.slots[slot].context.rip = 0xAAAA;

        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, slot);
        assert_eq!(table.slots[slot].state.get(), ProcessState::Running);
        assert_eq!(frame.rip, 0xAAAA);
        assert!(sched.quantum_remaining > 0);
    }

    #[test]
    fn full_quantum_demotes_user_process() {
        let (mut sched, mut table, mut frame) = fresh();
        let a = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        let b = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());

        // Park both on a mid level so demotion is observable.
        for slot in [a, b] {
            sched.remove_slot(&mut table, slot);
            table.slots[slot].priority = 4;
            sched.requeue(&mut table, slot);
        }

        sched.tick(&mut table, &mut frame);
        let running = sched.current;
        let before = table.slots[running].priority;
        // Burn the full quantum.
        for _ in 0..sched.queues[before as usize].quantum + 2 {
            if sched.current != running {
                break;
            }
            sched.tick(&mut table, &mut frame);
        }
        assert_eq!(table.slots[running].priority, before + 1);
    }

    #[test]
    fn rt_wake_preempts_lower_priority_process() {
        let (mut sched, mut table, mut frame) = fresh();
        let user = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        // Run the user process at a level well below the preemption gap.
        sched.remove_slot(&mut table, user);
        table.slots[user].priority = RT_PRIORITY_THRESHOLD + 2;
        sched.requeue(&mut table, user);
        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, user);
        assert!(sched.quantum_remaining >= 5);

        // A critical system process arrives.
        let critical = admit_proc(
            &mut sched,
            &mut table,
            Privilege::System,
            TokenFlags::CORE,
        );

        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, critical, "critical process must run next");
        assert_eq!(table.slots[user].state.get(), ProcessState::Ready);
    }

    #[test]
    fn blocked_process_is_skipped_until_woken() {
        let (mut sched, mut table, mut frame) = fresh();
        let slot = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, slot);

        // Blocks in receive.
        table.slots[slot]
            .state
            .transition(ProcessState::Running, ProcessState::Blocked);
        sched.on_block(&mut table, slot);
        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, 0, "blocked process must not run");
        assert!(table.slots[slot].sched_node.is_none());

        // Sender wakes it.
        table.slots[slot]
            .state
            .transition(ProcessState::Blocked, ProcessState::Ready);
        sched.drain_wakes(&mut table, 1 << slot);
        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, slot);
        assert!(table.slots[slot].io_ops > 0);
    }

    #[test]
    fn wake_promotes_user_into_interactive_band() {
        let (mut sched, mut table, _) = fresh();
        let slot = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        sched.remove_slot(&mut table, slot);
        table.slots[slot].priority = (MAX_PRIORITY_LEVELS - 1) as u8;
        table.slots[slot].state.set(ProcessState::Ready);

        sched.wake(&mut table, slot);
        assert_eq!(table.slots[slot].priority, RT_PRIORITY_THRESHOLD);
        assert!(table.slots[slot].sched_node.is_some());
    }

    #[test]
    fn corrupt_token_is_killed_at_selection() {
        let (mut sched, mut table, mut frame) = fresh();
        let slot = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        let before = security::violation_count();

        // Flip one bit of the stored token's flags field.
        let tampered = table.slots[slot].token.flags.bits() ^ (1 << 5);
        table.slots[slot].token.flags = TokenFlags::from_bits_retain(tampered);

        sched.tick(&mut table, &mut frame);
        assert_eq!(sched.current, 0, "tampered process must not be dispatched");
        assert_eq!(table.slots[slot].state.get(), ProcessState::Zombie);
        assert_eq!(table.slots[slot].term_reason, TerminationReason::Security);
        assert!(security::violation_count() > before);
    }

    #[test]
    fn illicit_system_process_is_killed_at_selection() {
        let (mut sched, mut table, mut frame) = fresh();
        // Forge a SYSTEM process with no supervisor/critical/immune flag:
        // token is internally consistent, privileges are not.
        let slot = table.claim_slot().expect("slot");
        let pid = table.alloc_pid().expect("pid");
        let pcb = &mut table.slots[slot];
        pcb.pid = pid;
        pcb.privilege = Privilege::System;
        pcb.token = SecurityToken::issue(pid, 0, Privilege::System, TokenFlags::empty(), 0);
        pcb.seed_burst_history();
        pcb.state.set(ProcessState::Ready);
        table.count_up();
        sched.enqueue_classified(&mut table, slot);

        sched.tick(&mut table, &mut frame);
        assert_eq!(table.slots[slot].state.get(), ProcessState::Zombie);
    }

    #[test]
    fn scheduler_fairness_over_identical_processes() {
        let (mut sched, mut table, mut frame) = fresh();
        let a = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        let b = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());

        for _ in 0..10_000 {
            sched.tick(&mut table, &mut frame);
        }

        let ta = table.slots[a].cpu_time;
        let tb = table.slots[b].cpu_time;
        let larger = ta.max(tb).max(1);
        let diff = ta.abs_diff(tb);
        assert!(
            diff * 100 <= larger * 5,
            "cpu time skew too large: {} vs {}",
            ta,
            tb
        );
        sched
            .check_invariants(&table)
            .expect("invariants hold after a long run");
    }

    #[test]
    fn waiting_process_is_promoted_not_starved() {
        let (mut sched, mut table, mut frame) = fresh();
        // A real-time hog that never leaves level 0...
        let _hog = admit_proc(
            &mut sched,
            &mut table,
            Privilege::System,
            TokenFlags::CORE,
        );
        // ...and a user process parked at the bottom level.
        let starved = admit_proc(&mut sched, &mut table, Privilege::User, TokenFlags::empty());
        sched.remove_slot(&mut table, starved);
        table.slots[starved].priority = (MAX_PRIORITY_LEVELS - 1) as u8;
        sched.requeue(&mut table, starved);

        for _ in 0..2 * (AGING_THRESHOLD_BASE + 2 * BOOST_INTERVAL) {
            sched.tick(&mut table, &mut frame);
        }

        // The boost/aging passes lifted it into the interactive band even
        // though it never got the CPU.
        assert_eq!(table.slots[starved].priority, RT_PRIORITY_THRESHOLD);
        sched
            .check_invariants(&table)
            .expect("relocation kept the queues consistent");
    }

    #[test]
    fn invariants_hold_through_churn() {
        let (mut sched, mut table, mut frame) = fresh();
        for round in 0..8 {
            let pid = admit(
                &mut sched,
                &mut table,
                0x1000,
                None,
                Privilege::User,
                TokenFlags::empty(),
                0,
            )
            .expect("admit");
            for _ in 0..17 {
                sched.tick(&mut table, &mut frame);
            }
            if round % 2 == 0 {
                let _ = crate::process::lifecycle::terminate(
                    &mut sched,
                    &mut table,
                    pid,
                    TerminationReason::Killed,
                    0,
                    0,
                );
                crate::process::lifecycle::reap(&mut table);
            }
            sched
                .check_invariants(&table)
                .expect("invariants after churn round");
        }
    }
}
