//! # Thread model and scheduler core
//!
//! Control blocks and lifecycle operations for kernel threads and
//! processes, plus the per-core round-robin scheduler that drives them.
//!
//! The [`Scheduler`] is a plain state machine: it decides *which*
//! thread runs next and hands the decision back as a [`Switch`], while
//! the architecture layer performs the actual context switch and the
//! kernel state object provides the locking around every call. Both
//! voluntary suspension (block, exit, sleep) and timer preemption feed
//! into the same [`Scheduler::reschedule`] entry point.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod context;
mod process;
mod scheduler;
mod thread;

pub use context::Context;
pub use process::Process;
pub use scheduler::{Scheduler, SpawnError, Switch, ThreadRef, Trigger};
pub use thread::{BlockReason, StackRegion, Thread, ThreadId, ThreadState};
