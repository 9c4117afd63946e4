//! A per-CPU, IRQ-safe mutex, adapted from `queen-core`'s `sync/spin.rs`.
//!
//! The teacher's `MutexNoIrq` disables and restores local interrupts around
//! every critical section via direct calls into the aarch64 interrupt
//! controller. This core has no real interrupt controller to assume, so the
//! disable/restore hook is an [`InterruptControl`] trait object the host
//! installs; the default is a no-op, which is what every hosted test uses.
//!
//! Every short critical section named in §5 (run-queue mutation, wait-word
//! bucket locking, dependency-edge list locking) goes through this type.

use core::{
    fmt,
    ops::{Deref, DerefMut},
};
use spin::MutexGuard;

pub type Mutex<T> = spin::Mutex<T>;

/// Disables/restores whatever would otherwise preempt a critical section.
/// On bare metal this is local interrupts; under a hosted test harness
/// there is nothing to disable, so [`NoopInterruptControl`] is the default.
pub trait InterruptControl: Sync {
    /// Disables interrupts and returns an opaque flags value to restore.
    ///
    /// # Safety
    /// Must be paired with exactly one [`InterruptControl::restore`] call
    /// with the returned flags, on the same CPU, before any other task runs.
    unsafe fn disable_and_store(&self) -> usize;

    /// # Safety
    /// `flags` must be the value returned by the matching `disable_and_store`.
    unsafe fn restore(&self, flags: usize);
}

pub struct NoopInterruptControl;

impl InterruptControl for NoopInterruptControl {
    unsafe fn disable_and_store(&self) -> usize {
        0
    }
    unsafe fn restore(&self, _flags: usize) {}
}

static INTERRUPT_CONTROL: spin::Once<&'static dyn InterruptControl> = spin::Once::new();

/// Installs the host's interrupt controller. Call once at boot before any
/// [`MutexNoIrq`] is locked; later calls are ignored.
pub fn install_interrupt_control(control: &'static dyn InterruptControl) {
    INTERRUPT_CONTROL.call_once(|| control);
}

fn interrupt_control() -> &'static dyn InterruptControl {
    *INTERRUPT_CONTROL.call_once(|| &NoopInterruptControl)
}

pub struct MutexNoIrq<T>(Mutex<T>);

unsafe impl<T: Send> Sync for MutexNoIrq<T> {}
unsafe impl<T: Send> Send for MutexNoIrq<T> {}

impl<T> MutexNoIrq<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.0.into_inner()
    }
}

impl<T> MutexNoIrq<T> {
    /// Returns `true` if the lock is currently held.
    ///
    /// # Safety
    ///
    /// This function provides no synchronization guarantees and so its result should be considered 'out of date'
    /// the instant it is called. Do not use it for synchronization purposes. However, it may be useful as a heuristic.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    /// Locks the [`Mutex`] and returns a guard that permits access to the inner data.
    ///
    /// The returned value may be dereferenced for data access
    /// and the lock will be dropped when the guard falls out of scope.
    #[inline]
    pub fn lock(&self) -> MutexGuardNoIrq<T> {
        MutexGuardNoIrq::new(self.0.lock())
    }

    /// Force unlock this [`Mutex`].
    ///
    /// # Safety
    ///
    /// This is *extremely* unsafe if the lock is not held by the current
    /// thread. However, this can be useful in some instances for exposing the
    /// lock to FFI that doesn't know how to deal with RAII.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        self.0.force_unlock()
    }

    /// Try to lock this [`Mutex`], returning a lock guard if successful.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuardNoIrq<T>> {
        self.0.try_lock().map(MutexGuardNoIrq::new)
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the [`Mutex`] mutably, and a mutable reference is guaranteed to be exclusive in Rust,
    /// no actual locking needs to take place -- the mutable borrow statically guarantees no locks exist. As such,
    /// this is a 'zero-cost' operation.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for MutexNoIrq<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl<T: Default> Default for MutexNoIrq<T> {
    fn default() -> MutexNoIrq<T> {
        Self::new(Default::default())
    }
}

impl<T> From<T> for MutexNoIrq<T> {
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

pub struct MutexGuardNoIrq<'a, T: 'a> {
    inner: MutexGuard<'a, T>,
    flags: usize,
}

impl<'a, T: 'a> MutexGuardNoIrq<'a, T> {
    fn new(inner: MutexGuard<'a, T>) -> Self {
        let flags = unsafe { interrupt_control().disable_and_store() };
        MutexGuardNoIrq { inner, flags }
    }
}

impl<'a, T: 'a> Drop for MutexGuardNoIrq<'a, T> {
    fn drop(&mut self) {
        unsafe { interrupt_control().restore(self.flags) }
    }
}

impl<'a, T: fmt::Debug> fmt::Debug for MutexGuardNoIrq<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: fmt::Display> fmt::Display for MutexGuardNoIrq<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<'a, T: 'a> Deref for MutexGuardNoIrq<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.inner.deref()
    }
}

impl<'a, T: 'a> DerefMut for MutexGuardNoIrq<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.deref_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let m = MutexNoIrq::new(5);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = MutexNoIrq::new(0);
        let _g = m.lock();
        assert!(m.try_lock().is_none());
    }
}
