//! Process management
//!
//! Process control blocks live in a fixed slot table; slot 0 is the idle
//! process. State words are atomics so transitions out of RUNNING or into
//! DYING are compare-exchange based and cannot race into double
//! termination. Structural changes to the table happen under its spinlock,
//! which sits between the scheduler lock and the IPC queue locks in the
//! ordering.

pub mod lifecycle;
pub mod pcb;
pub mod table;

pub use lifecycle::{spawn, ProcessError};
pub use pcb::Pcb;
pub use table::ProcessTable;

use crate::sync::{SpinLock, SpinLockGuard};

/// Process identifier.
pub type Pid = u32;

/// Lifecycle states of a process slot.
///
/// TERMINATED is zero so a zeroed slot is a free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessState {
    Terminated = 0,
    Ready = 1,
    Running = 2,
    Blocked = 3,
    /// Resources not yet reclaimed by the reaper.
    Zombie = 4,
    /// Mid-termination; no scheduler interaction allowed.
    Dying = 5,
}

impl ProcessState {
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Zombie,
            5 => Self::Dying,
            _ => Self::Terminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminated => "TERMINATED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Zombie => "ZOMBIE",
            Self::Dying => "DYING",
        }
    }
}

/// Why a process was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TerminationReason {
    Normal = 0,
    Killed = 1,
    Crashed = 2,
    Security = 3,
    Resource = 4,
}

/// The global process table.
static PROCESS_TABLE: SpinLock<ProcessTable> = SpinLock::new(ProcessTable::new());

/// Lock the process table. The scheduler lock, if needed, must already be
/// held.
pub fn table() -> SpinLockGuard<'static, ProcessTable> {
    PROCESS_TABLE.lock()
}

/// Install the idle process in slot 0.
pub fn init() {
    table().init_idle();
    log::info!("process: table ready, idle process installed");
}
