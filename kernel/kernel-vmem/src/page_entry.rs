use crate::{MapFlags, PhysAddr};
use bitfield_struct::bitfield;

/// A single 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// Models the common superset of fields across all four paging levels
/// (PML4E, PDPTE, PDE, PTE). An entry either points at the next-level
/// table or, with `large_page` set at the PD/PDPT level, directly maps a
/// physical page.
///
/// | Bits  | Name            | Meaning                                |
/// |-------|-----------------|----------------------------------------|
/// | 0     | `P`             | Valid entry if set                     |
/// | 1     | `RW`            | Writable if set                        |
/// | 2     | `US`            | User-mode accessible if set            |
/// | 3     | `PWT`           | Write-through caching                  |
/// | 4     | `PCD`           | Disable caching                        |
/// | 5     | `A`             | Accessed (set by hardware)             |
/// | 6     | `D`             | Dirty (leaf only, set by hardware)     |
/// | 7     | `PS`            | Large-page flag                        |
/// | 8     | `G`             | Global (leaf only)                     |
/// | 9–11  | OS avail low    | Reserved for OS use                    |
/// | 12–51 | frame           | Physical frame bits `[51:12]`          |
/// | 52–58 | OS avail high   | Reserved for OS use                    |
/// | 59–62 | `PKU`           | Protection key or OS use               |
/// | 63    | `NX`            | Execute disable                        |
#[bitfield(u64)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global_translation: bool,
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame bits `[51:12]`; the low 12 bits are implied zero
    /// by alignment. Reconstruct with `bits << 12`.
    #[bits(40)]
    frame_bits_51_12: u64,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl PageTableEntry {
    #[inline]
    pub const fn set_frame(&mut self, frame: PhysAddr) {
        self.set_frame_bits_51_12(frame.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysAddr {
        PhysAddr::new(self.frame_bits_51_12() << 12)
    }

    /// Entry linking to a next-level table. Kept permissive (writable,
    /// supervisor); the leaf decides the effective permissions.
    #[inline]
    #[must_use]
    pub const fn non_leaf(table: PhysAddr) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_bits_51_12(table.as_u64() >> 12)
    }

    /// Leaf entry mapping `frame` with the given caller-facing flags.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysAddr, flags: MapFlags, large: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.contains(MapFlags::WRITABLE))
            .with_user_access(flags.contains(MapFlags::USER))
            .with_write_through(flags.contains(MapFlags::WRITE_THROUGH))
            .with_cache_disabled(flags.contains(MapFlags::NO_CACHE))
            .with_global_translation(flags.contains(MapFlags::GLOBAL))
            .with_no_execute(flags.contains(MapFlags::NO_EXECUTE))
            .with_large_page(large)
            .with_frame_bits_51_12(frame.as_u64() >> 12)
    }
}
