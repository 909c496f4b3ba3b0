//! Synchronization primitives
//!
//! Interrupt-safe locking for the kernel's shared state. The lock order is
//! scheduler, process table, IPC queue, VM manager, physical allocator;
//! acquiring out of that order is forbidden.

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
