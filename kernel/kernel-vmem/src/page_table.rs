use crate::PageTableEntry;

/// One 4 KiB paging structure: 512 entries at any of the four levels.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; Self::ENTRIES],
}

impl PageTable {
    pub const ENTRIES: usize = 512;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::new(); Self::ENTRIES],
        }
    }

    /// Clears every entry. New tables must be zeroed before they are
    /// linked in, or stale frame contents become live translations.
    #[inline]
    pub const fn zero(&mut self) {
        self.entries = [PageTableEntry::new(); Self::ENTRIES];
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(core::mem::size_of::<PageTable>() == 4096);
