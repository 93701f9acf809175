//! # Kernel synchronization primitives
//!
//! Busy-wait locks for short critical sections over shared kernel state
//! (frame pool, thread tables, identifier counter). None of these are
//! reentrant: a core re-acquiring a lock it already holds deadlocks by
//! contract. Debug builds detect that case when a core-identity provider
//! has been registered (see [`core_id`]).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod core_id;
pub mod irq;
mod mutex;
mod raw_spin;
mod raw_ticket;

pub use irq::{IrqGuard, IrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;

/// Test-and-set backed mutex; unfair under contention but cheap.
pub type SpinMutex<T> = Mutex<T, RawSpin>;
/// Ticket backed mutex; FIFO-fair between contending cores.
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

/// Acquire side of a raw lock.
pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

/// Release side of a raw lock.
pub trait RawUnlock {
    /// # Safety
    /// Caller must hold the lock.
    unsafe fn raw_unlock(&self);
}
