//! Security subsystem
//!
//! Tamper-evident per-process tokens and the background integrity monitor
//! that re-validates them, hunts illicit privilege elevation, and checks
//! scheduler invariants. Violations are never reported to the offender:
//! the offending process is force-terminated and the global threat counter
//! rises.

pub mod monitor;
pub mod token;

pub use token::{Privilege, SecurityToken, TokenFlags};

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::SECURITY_VIOLATION_LIMIT;

/// Count of confirmed security violations since boot.
static VIOLATION_COUNT: AtomicU32 = AtomicU32::new(0);

/// Record a violation; too many of them mean the kernel itself can no
/// longer be trusted.
pub fn record_violation(pid: u32, reason: &str) {
    let count = VIOLATION_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    log::error!("security: violation by pid {}: {}", pid, reason);

    if count > SECURITY_VIOLATION_LIMIT {
        panic!("security: violation limit exceeded, system compromised");
    }
}

pub fn violation_count() -> u32 {
    VIOLATION_COUNT.load(Ordering::Relaxed)
}
