//! Interrupt-safe spinlock
//!
//! A test-and-set spinlock that disables interrupts for the duration of the
//! critical section and restores the previous interrupt state on release
//! (the save/restore IRQ flags pattern). Every singleton the kernel shares
//! with interrupt handlers is guarded by one of these; a plain `spin::Mutex`
//! would deadlock the moment a handler touched a lock its own core already
//! holds.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Saved interrupt state, restored when the guard drops.
#[derive(Clone, Copy)]
struct IrqState {
    was_enabled: bool,
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn irq_save() -> IrqState {
    let was_enabled = x86_64::instructions::interrupts::are_enabled();
    x86_64::instructions::interrupts::disable();
    IrqState { was_enabled }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn irq_restore(state: IrqState) {
    if state.was_enabled {
        x86_64::instructions::interrupts::enable();
    }
}

// Host builds have no interrupt flag to manage; the lock degrades to a
// plain spinlock so the unit tests exercise the same code paths.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn irq_save() -> IrqState {
    IrqState { was_enabled: false }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn irq_restore(_state: IrqState) {}

/// Interrupt-safe spinlock.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: the lock grants exclusive access to the data at runtime, so the
// container is Send/Sync whenever the payload could be moved to another
// context on its own.
unsafe impl<T: Send> Send for SpinLock<T> {}
// SAFETY: see above; shared references only hand out data through the guard.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling interrupts first.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq = irq_save();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard { lock: self, irq }
    }

    /// Try to acquire without spinning. Interrupt state is only touched on
    /// success.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq = irq_save();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self, irq })
        } else {
            irq_restore(irq);
            None
        }
    }
}

/// RAII guard; releases the lock and restores interrupts on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq: IrqState,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held, so no other reference
        // to the data exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        irq_restore(self.irq);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_gives_exclusive_access() {
        let lock = SpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_succeeds_when_free() {
        let lock = SpinLock::new(5u32);
        let guard = lock.try_lock().expect("uncontended try_lock should succeed");
        assert_eq!(*guard, 5);
    }
}
