//! Pluggable core identity for debug-build lock diagnostics.
//!
//! The raw locks cannot know which CPU core is running them; SMP setup
//! registers a provider once (typically reading the local APIC ID) and
//! the locks then use it to flag same-core re-acquisition in debug
//! builds. Without a provider the diagnostic is silently disabled, so
//! release behavior and single-binary tests are unaffected.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

static PROVIDER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

/// Registers the function used to identify the executing core.
///
/// The provider must be cheap, callable from interrupt context, and must
/// never return `usize::MAX` (reserved as the "unowned" sentinel by the
/// lock implementations). Later registrations replace earlier ones.
pub fn set_core_id_provider(f: fn() -> usize) {
    PROVIDER.store(f as *mut (), Ordering::Release);
}

/// Identity of the executing core, if a provider has been registered.
#[must_use]
pub fn current_core() -> Option<usize> {
    let p = PROVIDER.load(Ordering::Acquire);
    if p.is_null() {
        return None;
    }
    // Round-trips the fn pointer stored by `set_core_id_provider`.
    let f: fn() -> usize = unsafe { core::mem::transmute::<*mut (), fn() -> usize>(p) };
    Some(f())
}
