use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(debug_assertions)]
use core::sync::atomic::AtomicUsize;

#[cfg(debug_assertions)]
const NO_OWNER: usize = usize::MAX;

/// Test-and-set spin lock.
///
/// `lock` swaps the held flag and spins on plain loads until it observes
/// the lock free (TATAS), so contending cores mostly read their cache
/// line instead of hammering it with exchanges.
pub struct RawSpin {
    held: AtomicBool,
    /// Core that currently holds the lock; diagnostic only.
    #[cfg(debug_assertions)]
    owner: AtomicUsize,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Same-core re-acquisition deadlocks by contract; make it loud in
    /// debug builds when core identity is available.
    #[cfg(debug_assertions)]
    fn assert_not_reentrant(&self) {
        if let Some(me) = crate::core_id::current_core() {
            assert_ne!(
                self.owner.load(Ordering::Relaxed),
                me,
                "core {me} re-acquired a spin lock it already holds"
            );
        }
    }

    #[cfg(debug_assertions)]
    fn record_owner(&self) {
        if let Some(me) = crate::core_id::current_core() {
            self.owner.store(me, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn lock(&self) {
        #[cfg(debug_assertions)]
        self.assert_not_reentrant();

        // Fast path: try once, then spin on reads until free
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }

        #[cfg(debug_assertions)]
        self.record_owner();
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        let acquired = !self.held.swap(true, Ordering::Acquire);
        #[cfg(debug_assertions)]
        if acquired {
            self.record_owner();
        }
        acquired
    }

    /// # Safety
    /// Caller must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        #[cfg(debug_assertions)]
        self.owner.store(NO_OWNER, Ordering::Relaxed);

        self.held.store(false, Ordering::Release);
    }
}

impl RawLock for RawSpin {
    fn raw_lock(&self) {
        self.lock();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_lock()
    }
}

impl RawUnlock for RawSpin {
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}
