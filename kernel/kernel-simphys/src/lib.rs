//! Simulated physical memory for hosted tests.
//!
//! The allocator and scheduler crates are `no_std` and only touch
//! physical memory through the [`PhysMapper`] seam. [`SimPhys`] backs
//! that seam with an owned, frame-aligned buffer so the whole
//! resource-management core can be exercised as ordinary tests:
//! physical addresses are byte offsets from zero, frame `n` lives at
//! `pa == n * 4096`.
//!
//! This crate is test tooling; nothing in it is meant for the target.

#![allow(unsafe_code)]

use kernel_info::memory::PAGE_SIZE;
use kernel_info::{MemoryRegion, RegionKind};
use kernel_vmem::{PhysAddr, PhysMapper};

/// A 4 KiB-aligned frame of simulated RAM.
#[repr(align(4096))]
struct Aligned4K([u8; PAGE_SIZE as usize]);

/// Simulated physical RAM behind a [`PhysMapper`].
///
/// The frame vector is contiguous with a 4096-byte stride, so byte
/// offsets that cross frame boundaries stay valid, just like they would
/// through a real higher-half direct map.
pub struct SimPhys {
    frames: Vec<Aligned4K>,
}

impl SimPhys {
    /// Simulated machine with `frames` frames of RAM.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let mut v = Vec::with_capacity(frames);
        for _ in 0..frames {
            v.push(Aligned4K([0u8; PAGE_SIZE as usize]));
        }
        Self { frames: v }
    }

    /// Total simulated RAM in bytes.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.frames.len() as u64 * PAGE_SIZE
    }

    /// A one-entry memory map declaring all simulated RAM usable.
    #[must_use]
    pub fn usable_map(&self) -> [MemoryRegion; 1] {
        [MemoryRegion::new(0, self.len_bytes(), RegionKind::Usable)]
    }

    /// Reads one byte of simulated RAM.
    ///
    /// # Panics
    /// If `pa` is outside the simulated range.
    #[must_use]
    pub fn byte(&self, pa: u64) -> u8 {
        assert!(pa < self.len_bytes(), "address {pa:#x} outside simulated RAM");
        let frame = (pa / PAGE_SIZE) as usize;
        let off = (pa % PAGE_SIZE) as usize;
        self.frames[frame].0[off]
    }

    fn base_ptr(&self) -> *mut u8 {
        self.frames.as_ptr() as *mut u8
    }
}

impl PhysMapper for SimPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
        debug_assert!(
            pa.as_u64() < self.len_bytes(),
            "address {:#x} outside simulated RAM",
            pa.as_u64()
        );
        unsafe { &mut *self.base_ptr().add(pa.as_u64() as usize).cast::<T>() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_contiguous_and_aligned() {
        let sim = SimPhys::new(4);
        let p0 = core::ptr::from_ref(&sim.frames[0]) as usize;
        let p3 = core::ptr::from_ref(&sim.frames[3]) as usize;
        assert_eq!(p0 % 4096, 0);
        assert_eq!(p3 - p0, 3 * 4096);
    }

    #[test]
    fn mapper_writes_are_visible() {
        let sim = SimPhys::new(2);
        let b: &mut u8 = unsafe { sim.phys_to_mut(PhysAddr::new(0x1003)) };
        *b = 0xab;
        assert_eq!(sim.byte(0x1003), 0xab);
    }
}
