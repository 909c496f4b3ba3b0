//! Kernel-wide tunables.
//!
//! Every configurable limit, interval, and threshold lives here so the
//! subsystems stay free of magic numbers. Values are in timer ticks unless
//! stated otherwise.

/// Maximum number of process slots (bounded by the 64-bit slot bitmaps).
pub const MAX_PROCESSES: usize = 64;

/// Per-process kernel stack size in bytes (excluding the guard page).
pub const STACK_SIZE: usize = 16 * 1024;

/// Number of MLFQ priority levels.
pub const MAX_PRIORITY_LEVELS: usize = 8;

/// Levels below this index are real-time queues.
pub const RT_PRIORITY_THRESHOLD: u8 = 2;

/// Base quantum from which the per-level quantum table is derived.
pub const QUANTUM_BASE: u32 = 20;
/// Lower bound for regular-queue quanta after geometric decay.
pub const QUANTUM_MIN: u32 = 5;
/// Upper bound for real-time quanta.
pub const QUANTUM_MAX: u32 = 100;
/// Right-shift applied per level below the real-time threshold.
pub const QUANTUM_DECAY_SHIFT: u32 = 1;

/// Entries in the per-process CPU burst history ring.
pub const CPU_BURST_HISTORY: usize = 8;

/// I/O operations after which a process classifies as interactive.
pub const IO_BOOST_THRESHOLD: u32 = 10;
/// Average burst below `QUANTUM_BASE / this` classifies as short.
pub const INTERACTIVE_AGGRESSIVE_DIVISOR: u32 = 4;
/// Average burst below `QUANTUM_BASE / this` classifies as medium.
pub const INTERACTIVE_BURST_DIVISOR: u32 = 2;

/// Quantum boost for I/O heavy processes, as numerator/denominator.
pub const IO_QUANTUM_BOOST: (u32, u32) = (3, 2);
/// Quantum penalty for CPU intensive processes, as numerator/denominator.
pub const CPU_QUANTUM_PENALTY: (u32, u32) = (3, 4);
/// Average burst beyond `quantum * this` marks a process CPU intensive.
pub const CPU_INTENSIVE_MULTIPLIER: u32 = 2;

/// Queue depth beyond which a regular queue is skipped while another
/// regular queue still has work.
pub const LOAD_BALANCE_THRESHOLD: u32 = 4;

/// Preempt when the best queue index plus this bias is still better than
/// the running process's level.
pub const PREEMPTION_BIAS: u8 = 2;
/// The queue index whose arrivals always preempt lower-priority work.
pub const CRITICAL_PREEMPTION_LEVEL: u8 = 0;
/// Minimum level of the running process for a critical-level preemption.
pub const PREEMPTION_MIN_PRIORITY_GAP: u8 = 3;

/// Interval of the fairness-boost pass over READY processes.
pub const FAIRNESS_BOOST_INTERVAL: u64 = 100;
/// Wait time beyond which the fairness pass promotes a process.
pub const FAIRNESS_WAIT_THRESHOLD: u64 = 150;
/// Base interval of the aging pass (the pass runs every two intervals).
pub const BOOST_INTERVAL: u64 = 50;
/// Base wait threshold of the aging pass.
pub const AGING_THRESHOLD_BASE: u64 = 200;
/// Divisor applied to the aging threshold when the system is loaded.
pub const AGING_ACCELERATION_FACTOR: u64 = 2;
/// Wait time beyond which a process is considered starving outright.
pub const STARVATION_THRESHOLD: u64 = 500;

/// Zombies reaped per cleanup pass, bounding time spent per call.
pub const CLEANUP_MAX_PER_CALL: usize = 4;

/// Security violations tolerated before the kernel gives up.
pub const SECURITY_VIOLATION_LIMIT: u32 = 50;
/// Interval of the integrity monitor's token re-validation scan.
pub const TOKEN_SCAN_INTERVAL: u64 = 50;
/// Processes re-validated per token scan.
pub const TOKEN_SCAN_BATCH: usize = 16;
/// Interval of the privilege-escalation scan.
pub const PRIVILEGE_SCAN_INTERVAL: u64 = 25;
/// Processes inspected per privilege scan.
pub const PRIVILEGE_SCAN_BATCH: usize = 8;
/// Interval of the scheduler-invariant consistency check.
pub const SCHED_CONSISTENCY_INTERVAL: u64 = 200;
/// Threat level that triggers a selective lockdown.
pub const THREAT_LOCKDOWN_LEVEL: u32 = 40;
/// Threat level that is treated as unrecoverable corruption.
pub const THREAT_PANIC_LEVEL: u32 = 75;
/// Interval at which the threat level decays by one.
pub const THREAT_DECAY_INTERVAL: u64 = 200;

/// IPC ring capacity per process.
pub const MAX_MESSAGES: usize = 32;
/// IPC payload size in bytes.
pub const IPC_MAX_PAYLOAD: usize = 512;

/// Largest buffer accepted by the `write` system call.
pub const MAX_SYSCALL_BUFFER: usize = 256;

/// Timer frequency bounds for the governor, in Hz.
pub const MIN_TIMER_FREQ: u16 = 200;
pub const MAX_TIMER_FREQ: u16 = 2000;
/// Governor baseline frequency in Hz.
pub const BASELINE_TIMER_FREQ: u16 = 330;
/// Boot-time timer frequency in Hz.
pub const DEFAULT_TIMER_FREQ: u16 = 250;
/// Ticks between governor samples.
pub const SAMPLING_INTERVAL: u64 = 20;
/// Entries in the governor's frequency history ring.
pub const FREQ_HISTORY_SIZE: usize = 32;
/// Samples consulted by the governor's prediction window.
pub const PREDICTION_WINDOW: usize = 5;
/// Minimum frequency delta (Hz) before the timer is reprogrammed.
pub const HYSTERESIS_THRESHOLD: u16 = 25;
/// Stable samples before the hysteresis band is halved.
pub const STABILITY_REQUIREMENT: u32 = 10;
