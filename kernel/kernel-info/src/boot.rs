//! Boot-time handover structures.
//!
//! The loader (or boot protocol shim) fills these in before the kernel
//! proper runs. Everything the resource-management core knows about the
//! machine's memory arrives through [`BootInfo`]; there is no other
//! discovery path.

use crate::memory::PAGE_SIZE;

/// Classification of a firmware-reported memory region.
#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RegionKind {
    /// Free conventional memory; may be handed to the frame allocator.
    Usable = 0,
    /// Firmware- or device-owned; never allocated from.
    Reserved = 1,
    /// Holds boot structures the kernel still reads; reclaimable later,
    /// treated as reserved by the allocator.
    Reclaimable = 2,
}

/// One `(base, length, kind)` entry of the firmware memory map.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    /// Physical base address of the region.
    pub base: u64,
    /// Length of the region in bytes.
    pub length: u64,
    /// What the region may be used for.
    pub kind: RegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: RegionKind) -> Self {
        Self { base, length, kind }
    }

    /// Exclusive end address of the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }

    /// The region clipped inwards to whole frames: base rounded up,
    /// end rounded down. May come out empty.
    #[must_use]
    pub const fn frame_aligned(&self) -> Self {
        let base = self.base.next_multiple_of(PAGE_SIZE);
        let end = self.end() & !(PAGE_SIZE - 1);
        let length = if end > base { end - base } else { 0 };
        Self {
            base,
            length,
            kind: self.kind,
        }
    }
}

/// Boot information handed to the kernel by the loader.
///
/// Raw pointer/length pairs because this structure crosses the
/// loader→kernel ABI boundary; use [`BootInfo::memory_map`] and
/// [`BootInfo::reserved`] to view the lists.
#[repr(C)]
#[derive(Debug)]
pub struct BootInfo {
    /// Firmware memory map, sorted by base address.
    pub memory_map_ptr: *const MemoryRegion,
    pub memory_map_len: usize,
    /// Extra regions the mapper must make addressable (e.g. MMIO windows)
    /// even though they are not usable RAM. May be empty.
    pub reserved_ptr: *const MemoryRegion,
    pub reserved_len: usize,
}

impl BootInfo {
    /// # Safety
    /// The pointer/length pairs must describe live, correctly aligned
    /// arrays for the lifetime of the returned slice.
    #[must_use]
    pub const unsafe fn memory_map(&self) -> &[MemoryRegion] {
        unsafe { core::slice::from_raw_parts(self.memory_map_ptr, self.memory_map_len) }
    }

    /// # Safety
    /// Same contract as [`BootInfo::memory_map`].
    #[must_use]
    pub const unsafe fn reserved(&self) -> &[MemoryRegion] {
        unsafe { core::slice::from_raw_parts(self.reserved_ptr, self.reserved_len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_aligned_clips_inwards() {
        let r = MemoryRegion::new(0x1234, 0x3000, RegionKind::Usable);
        let a = r.frame_aligned();
        assert_eq!(a.base, 0x2000);
        assert_eq!(a.end(), 0x4000);
    }

    #[test]
    fn frame_aligned_can_be_empty() {
        let r = MemoryRegion::new(0x1100, 0x200, RegionKind::Usable);
        assert_eq!(r.frame_aligned().length, 0);
    }
}
