//! Scoped interrupt masking.
//!
//! Any lock that an interrupt handler may also want must be taken with
//! interrupts disabled on the local core, or the handler can interrupt
//! the critical section and deadlock against it. [`IrqGuard`] pairs the
//! disable with a guaranteed restore on every exit path, and
//! [`Mutex::lock_irq`] bundles it with lock acquisition in the right
//! order (mask first, then lock).
//!
//! The actual `cli`/`sti`/`pushfq` sequences sit behind the `asm` cargo
//! feature: they require a privileged x86-64 context and would fault in
//! hosted builds, where the guard degrades to a no-op.

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};

/// A mutex guard that also keeps interrupts disabled while held.
///
/// Created via [`Mutex::lock_irq`]; drops restore lock then interrupt
/// state, the reverse of acquisition order.
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    _g: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<'a, T, R: RawLock + RawUnlock> core::ops::Deref for IrqMutex<'a, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self._g
    }
}

impl<'a, T, R: RawLock + RawUnlock> core::ops::DerefMut for IrqMutex<'a, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self._g
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's
    /// lifetime.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let irq = IrqGuard::new();
        let g = self.lock();
        IrqMutex { _g: g, _irq: irq }
    }
}

/// Disables hardware interrupts (`cli`).
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// RAII guard that disables interrupts on creation and restores them on
/// drop.
///
/// The guard snapshots the `IF` bit; interrupts are re-enabled on drop
/// only if they were enabled before, so nesting is harmless.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[cfg(all(feature = "asm", target_arch = "x86_64"))]
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (rflags() & (1 << 9)) != 0;
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Hosted stand-in: there are no maskable interrupts to disable.
    #[cfg(not(all(feature = "asm", target_arch = "x86_64")))]
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            were_enabled: false,
        }
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts only if they were previously enabled.
    fn drop(&mut self) {
        #[cfg(all(feature = "asm", target_arch = "x86_64"))]
        if self.were_enabled {
            sti_enable_interrupts();
        }
        #[cfg(not(all(feature = "asm", target_arch = "x86_64")))]
        let _ = self.were_enabled;
    }
}
