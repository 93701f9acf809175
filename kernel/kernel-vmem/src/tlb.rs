//! TLB maintenance.
//!
//! Changing or removing a live translation leaves stale entries in the
//! local TLB; the caller of [`AddressSpace::unmap_one`] (or of a
//! remapping [`AddressSpace::map_one`]) must invalidate the affected
//! page on every core that may have cached it. Cross-core shootdown is
//! the surrounding kernel's responsibility.
//!
//! [`AddressSpace::map_one`]: crate::AddressSpace::map_one
//! [`AddressSpace::unmap_one`]: crate::AddressSpace::unmap_one

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::VirtAddr;

/// Invalidates the TLB entry covering `va` on the executing core.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub fn invalidate_page(va: VirtAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Flushes the entire non-global TLB by reloading CR3.
///
/// # Safety
/// Must run at CPL0 with paging enabled.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub unsafe fn flush_all() {
    unsafe {
        let cr3: u64;
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}
