//! # Virtual Memory Support
//!
//! x86-64 paging for the kernel: typed physical/virtual addresses, the
//! hardware page-table entry layout, and an [`AddressSpace`] that maps
//! frames into a 4-level translation tree.
//!
//! ## Virtual address walk
//!
//! A canonical 48-bit virtual address indexes four table levels before
//! the page offset:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each table holds 512 eight-byte entries. A PT entry maps a 4 KiB
//! page; a PD entry with the large-page bit set maps 2 MiB directly and
//! terminates the walk one level early. Larger (1 GiB) leaves exist in
//! hardware but are not used here.
//!
//! Frames for new tables come from a [`FrameSource`]; table memory is
//! reached through a [`PhysMapper`], which on the real machine is the
//! higher-half direct map and in tests is simulated RAM.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod page_entry;
mod page_table;
pub mod tlb;

pub use address_space::{AddressSpace, MapError};
pub use page_entry::PageTableEntry;
pub use page_table::PageTable;

use kernel_info::memory::PAGE_SIZE;

/// A **physical** memory address (machine bus address).
///
/// Newtype over `u64` to prevent mixing with virtual addresses.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn add_bytes(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    #[must_use]
    pub const fn is_frame_aligned(self) -> bool {
        self.0.is_multiple_of(PAGE_SIZE)
    }
}

/// A **virtual** memory address (process/kernel address space).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn add_bytes(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    /// PML4 index (bits 47-39).
    #[inline]
    pub(crate) const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }

    /// PDPT index (bits 38-30).
    #[inline]
    pub(crate) const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }

    /// PD index (bits 29-21).
    #[inline]
    pub(crate) const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }

    /// PT index (bits 20-12).
    #[inline]
    pub(crate) const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1ff) as usize
    }
}

/// Leaf sizes supported by [`AddressSpace`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PageSize {
    /// 4 KiB page mapped through the PT level.
    Size4K,
    /// 2 MiB page mapped by a PD entry with the large-page bit.
    Size2M,
}

impl PageSize {
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => PAGE_SIZE,
            Self::Size2M => 2 * 1024 * 1024,
        }
    }
}

bitflags::bitflags! {
    /// Caller-facing permission bits for a mapping.
    ///
    /// Presence is implied; a mapped page is always present. The flags
    /// translate onto the hardware entry bits of the leaf.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct MapFlags: u64 {
        /// Writes allowed.
        const WRITABLE = 1 << 0;
        /// Accessible from user mode (CPL=3).
        const USER = 1 << 1;
        /// Write-through caching (MMIO-ish regions).
        const WRITE_THROUGH = 1 << 2;
        /// Caching disabled entirely.
        const NO_CACHE = 1 << 3;
        /// Survives CR3 reloads in the TLB; kernel mappings.
        const GLOBAL = 1 << 4;
        /// Instruction fetches disallowed.
        const NO_EXECUTE = 1 << 5;
    }
}

/// Source of 4 KiB physical frames for paging structures.
///
/// Returned frames must be frame-aligned; `None` means out of memory.
/// Frames need not be zeroed, the mapper clears new tables itself.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Option<PhysAddr>;
}

/// Converts physical addresses to usable pointers in the current
/// virtual address space (identity map, HHDM, or simulated RAM).
///
/// # Safety
/// - `pa` must be mapped writable in the current page tables for the
///   returned `&mut T` to be sound.
/// - Type `T` must match the bytes at `pa`.
pub trait PhysMapper {
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T;
}
