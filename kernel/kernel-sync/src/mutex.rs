use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A value whose every shared access goes through a busy-wait lock.
///
/// The raw lock `R` decides the acquisition discipline (test-and-set
/// or ticket); this wrapper contributes the RAII pairing. Access is
/// only possible through a [`MutexGuard`], which releases on every
/// exit path, panics included, so an unlock cannot be forgotten.
pub struct Mutex<T, R> {
    lock: R,
    value: UnsafeCell<T>,
}

// UnsafeCell removes Sync; guarded access restores the usual bounds.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(lock: R, value: T) -> Self {
        Self {
            lock,
            value: UnsafeCell::new(value),
        }
    }

    /// Direct access through `&mut self`; the exclusive borrow rules
    /// out contention, so no locking happens.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    /// Spins until the lock is free, then returns the access guard.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.lock.raw_lock();
        MutexGuard {
            lock: &self.lock,
            value: &self.value,
        }
    }

    /// One acquisition attempt; `None` if the lock is currently held.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.lock.raw_try_lock().then(|| MutexGuard {
            lock: &self.lock,
            value: &self.value,
        })
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        f(&mut self.lock())
    }
}

impl<T: fmt::Debug, R: RawLock + RawUnlock> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(g) => f.debug_tuple("Mutex").field(&*g).finish(),
            None => f.write_str("Mutex(<held>)"),
        }
    }
}

/// Exclusive access to the value behind a [`Mutex`], held until drop.
pub struct MutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    lock: &'a R,
    value: &'a UnsafeCell<T>,
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        // the guard is live, so the lock is held and access is exclusive
        unsafe { &*self.value.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        unsafe { self.lock.raw_unlock() }
    }
}
