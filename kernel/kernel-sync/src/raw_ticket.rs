use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
const NO_OWNER: usize = usize::MAX;

/// Ticket spin lock: contenders take a ticket and wait for their turn,
/// which makes acquisition FIFO-fair between cores.
pub struct RawTicket {
    next: AtomicUsize,
    serving: AtomicUsize,
    /// Core that currently holds the lock; diagnostic only.
    #[cfg(debug_assertions)]
    holder: AtomicUsize,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            serving: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            holder: AtomicUsize::new(NO_OWNER),
        }
    }

    #[cfg(debug_assertions)]
    fn assert_not_reentrant(&self) {
        if let Some(me) = crate::core_id::current_core() {
            assert_ne!(
                self.holder.load(Ordering::Relaxed),
                me,
                "core {me} re-acquired a ticket lock it already holds"
            );
        }
    }

    #[cfg(debug_assertions)]
    fn record_holder(&self) {
        if let Some(me) = crate::core_id::current_core() {
            self.holder.store(me, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn lock(&self) {
        #[cfg(debug_assertions)]
        self.assert_not_reentrant();

        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        // Acquire when we observe our turn
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }

        #[cfg(debug_assertions)]
        self.record_holder();
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        let serving = self.serving.load(Ordering::Relaxed);
        let next = self.next.load(Ordering::Relaxed);
        if next != serving {
            return false;
        }
        // claim the next ticket only if nobody raced us to it
        let acquired = self
            .next
            .compare_exchange(next, next + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        #[cfg(debug_assertions)]
        if acquired {
            self.record_holder();
        }
        acquired
    }

    /// # Safety
    /// Caller must hold the lock.
    #[inline]
    pub unsafe fn unlock(&self) {
        #[cfg(debug_assertions)]
        self.holder.store(NO_OWNER, Ordering::Relaxed);

        // Release when we advance to the next ticket
        let t = self.serving.load(Ordering::Relaxed);
        self.serving.store(t.wrapping_add(1), Ordering::Release);
    }
}

impl RawLock for RawTicket {
    fn raw_lock(&self) {
        self.lock();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_lock()
    }
}

impl RawUnlock for RawTicket {
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}
