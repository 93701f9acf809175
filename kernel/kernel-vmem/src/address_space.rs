use crate::{
    FrameSource, MapFlags, PageSize, PageTable, PageTableEntry, PhysAddr, PhysMapper, VirtAddr,
};
use kernel_info::memory::{HHDM_BASE, PAGE_SIZE};
use kernel_info::{MemoryRegion, RegionKind};

/// Failures of the mapping operations.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// The frame source ran dry while allocating paging structures.
    #[error("out of frames for paging structures")]
    OutOfFrames,
    /// Address not aligned to the requested page size.
    #[error("address not aligned to the page size")]
    Unaligned,
    /// No translation exists at the given address.
    #[error("no translation at the given address")]
    Unmapped,
    /// The walk hit a huge-page leaf where a table was expected.
    #[error("translation covered by a huge page")]
    HugePage,
}

/// One translation tree, rooted at a PML4 frame.
///
/// The root frame is owned by this value; per-process address spaces
/// are owned by their process, the kernel space by the kernel state
/// object. All operations take the allocator and mapper explicitly so
/// the structure itself stays a plain handle.
///
/// ## Remap policy
///
/// Mapping a virtual address that already has a translation of the same
/// page size **updates** it in place; only a size conflict (a huge page
/// in the way of a table walk) is an error. Callers changing live
/// mappings are responsible for TLB invalidation (see [`crate::tlb`]).
pub struct AddressSpace {
    root: PhysAddr,
}

/// View a physical frame as the page table stored in it.
#[inline]
fn table<'t, M: PhysMapper>(mapper: &M, frame: PhysAddr) -> &'t mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(frame) }
}

/// Walk one level down from `parent[index]`, allocating and linking a
/// zeroed table if the entry is empty.
fn next_table<A: FrameSource, M: PhysMapper>(
    alloc: &mut A,
    mapper: &M,
    parent: PhysAddr,
    index: usize,
) -> Result<PhysAddr, MapError> {
    let entry = table(mapper, parent).entry(index);
    if entry.present() {
        if entry.large_page() {
            return Err(MapError::HugePage);
        }
        return Ok(entry.frame());
    }
    let frame = alloc.alloc_frame().ok_or(MapError::OutOfFrames)?;
    table(mapper, frame).zero();
    *table(mapper, parent).entry_mut(index) = PageTableEntry::non_leaf(frame);
    Ok(frame)
}

impl AddressSpace {
    /// Creates an empty address space with a fresh, zeroed root table.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the root.
    pub fn new<A: FrameSource, M: PhysMapper>(
        alloc: &mut A,
        mapper: &M,
    ) -> Result<Self, MapError> {
        let root = alloc.alloc_frame().ok_or(MapError::OutOfFrames)?;
        table(mapper, root).zero();
        Ok(Self { root })
    }

    /// Adopts an existing translation tree (e.g. the one CR3 points at).
    ///
    /// # Safety
    /// `root` must be the frame of a valid, exclusively owned PML4.
    #[must_use]
    pub const unsafe fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Physical address of the root table (what CR3 would be loaded with).
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    /// Builds the kernel's own address space: every usable or
    /// reclaimable region of the memory map becomes addressable at
    /// [`HHDM_BASE`]` + pa`, and the extra `reserved` regions (MMIO
    /// windows and the like) are mapped the same way with caching
    /// disabled.
    ///
    /// # Errors
    /// Propagates allocation failures from the frame source.
    pub fn new_kernel<A: FrameSource, M: PhysMapper>(
        alloc: &mut A,
        mapper: &M,
        memory_map: &[MemoryRegion],
        reserved: &[MemoryRegion],
    ) -> Result<Self, MapError> {
        let mut space = Self::new(alloc, mapper)?;

        let ram = MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::NO_EXECUTE;
        for region in memory_map {
            if matches!(region.kind, RegionKind::Usable | RegionKind::Reclaimable) {
                space.map_physical(alloc, mapper, *region, ram)?;
            }
        }
        for region in reserved {
            space.map_physical(alloc, mapper, *region, ram | MapFlags::NO_CACHE)?;
        }
        Ok(space)
    }

    /// Installs a translation `va → pa` for one page of `size`.
    ///
    /// Missing intermediate tables are allocated from `alloc`. An
    /// existing same-size translation at `va` is updated in place; the
    /// caller must invalidate the TLB if this space is live.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `va` or `pa` is not aligned to `size`.
    /// - [`MapError::OutOfFrames`] if a table allocation fails.
    /// - [`MapError::HugePage`] if a 4 KiB mapping would land inside an
    ///   existing 2 MiB leaf.
    pub fn map_one<A: FrameSource, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &M,
        va: VirtAddr,
        pa: PhysAddr,
        size: PageSize,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        if !va.as_u64().is_multiple_of(size.bytes()) || !pa.as_u64().is_multiple_of(size.bytes()) {
            return Err(MapError::Unaligned);
        }

        let pdpt = next_table(alloc, mapper, self.root, va.pml4_index())?;
        let pd = next_table(alloc, mapper, pdpt, va.pdpt_index())?;
        match size {
            PageSize::Size2M => {
                *table(mapper, pd).entry_mut(va.pd_index()) = PageTableEntry::leaf(pa, flags, true);
            }
            PageSize::Size4K => {
                let pt = next_table(alloc, mapper, pd, va.pd_index())?;
                *table(mapper, pt).entry_mut(va.pt_index()) = PageTableEntry::leaf(pa, flags, false);
            }
        }
        Ok(())
    }

    /// Translates `va` to its physical address, if mapped.
    ///
    /// The returned address includes the offset within the page.
    #[must_use]
    pub fn query<M: PhysMapper>(&self, mapper: &M, va: VirtAddr) -> Option<PhysAddr> {
        let e4 = table(mapper, self.root).entry(va.pml4_index());
        if !e4.present() {
            return None;
        }
        let e3 = table(mapper, e4.frame()).entry(va.pdpt_index());
        // 1 GiB leaves are never created by this mapper
        if !e3.present() || e3.large_page() {
            return None;
        }
        let e2 = table(mapper, e3.frame()).entry(va.pd_index());
        if !e2.present() {
            return None;
        }
        if e2.large_page() {
            let offset = va.as_u64() & (PageSize::Size2M.bytes() - 1);
            return Some(e2.frame().add_bytes(offset));
        }
        let e1 = table(mapper, e2.frame()).entry(va.pt_index());
        if !e1.present() {
            return None;
        }
        Some(e1.frame().add_bytes(va.as_u64() & (PAGE_SIZE - 1)))
    }

    /// Removes the 4 KiB translation at `va` and returns the frame it
    /// pointed at. The caller must invalidate the TLB on cores that may
    /// have the translation cached.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `va` is not page-aligned.
    /// - [`MapError::Unmapped`] if no translation exists.
    /// - [`MapError::HugePage`] if `va` lies inside a 2 MiB leaf.
    pub fn unmap_one<M: PhysMapper>(
        &mut self,
        mapper: &M,
        va: VirtAddr,
    ) -> Result<PhysAddr, MapError> {
        if !va.as_u64().is_multiple_of(PAGE_SIZE) {
            return Err(MapError::Unaligned);
        }
        let e4 = table(mapper, self.root).entry(va.pml4_index());
        if !e4.present() {
            return Err(MapError::Unmapped);
        }
        let e3 = table(mapper, e4.frame()).entry(va.pdpt_index());
        if !e3.present() {
            return Err(MapError::Unmapped);
        }
        let e2 = table(mapper, e3.frame()).entry(va.pd_index());
        if !e2.present() {
            return Err(MapError::Unmapped);
        }
        if e2.large_page() {
            return Err(MapError::HugePage);
        }
        let pt = table(mapper, e2.frame());
        let e1 = pt.entry(va.pt_index());
        if !e1.present() {
            return Err(MapError::Unmapped);
        }
        *pt.entry_mut(va.pt_index()) = PageTableEntry::new();
        Ok(e1.frame())
    }

    /// Offset-map one region at `HHDM_BASE + pa`, preferring 2 MiB
    /// leaves where alignment and length allow.
    fn map_physical<A: FrameSource, M: PhysMapper>(
        &mut self,
        alloc: &mut A,
        mapper: &M,
        region: MemoryRegion,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        let region = region.frame_aligned();
        let two_mib = PageSize::Size2M.bytes();
        let end = region.end();
        let mut pa = region.base;
        while pa < end {
            let va = VirtAddr::new(HHDM_BASE + pa);
            if pa.is_multiple_of(two_mib) && end - pa >= two_mib {
                self.map_one(alloc, mapper, va, PhysAddr::new(pa), PageSize::Size2M, flags)?;
                pa += two_mib;
            } else {
                self.map_one(alloc, mapper, va, PhysAddr::new(pa), PageSize::Size4K, flags)?;
                pa += PAGE_SIZE;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A trivial bump allocator: hands out the next 4 KiB frame and
    /// never reuses anything. Plenty for exercising table creation.
    struct BumpAlloc {
        next: u64,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self { next: start, end }
        }
    }

    impl FrameSource for BumpAlloc {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            if self.next + PAGE_SIZE > self.end {
                return None;
            }
            let p = self.next;
            self.next += PAGE_SIZE;
            Some(PhysAddr::new(p))
        }
    }

    /// A 4 KiB-aligned raw frame used as simulated physical RAM.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated RAM plus an HHDM-style mapper: physical addresses are
    /// byte offsets from zero, `frames[pa >> 12]` is the backing frame.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K([0u8; 4096]));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xfff) as usize;
            // Page tables are always frame-aligned.
            debug_assert_eq!(off, 0);
            unsafe { &mut *(&raw const self.frames[idx] as *mut u8).cast::<T>() }
        }
    }

    fn setup(frames: usize) -> (TestPhys, BumpAlloc) {
        let phys = TestPhys::with_frames(frames);
        let alloc = BumpAlloc::new(0, (frames as u64) << 12);
        (phys, alloc)
    }

    #[test]
    fn map_4k_creates_tables_and_leaf() {
        let (phys, mut alloc) = setup(64);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let va = VirtAddr::new(0xffff_8000_0000_0000);
        let pa = PhysAddr::new(0x30_0000);
        space
            .map_one(
                &mut alloc,
                &phys,
                va,
                pa,
                PageSize::Size4K,
                MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::NO_EXECUTE,
            )
            .unwrap();

        // Walk the tree by hand and verify each level.
        let e4 = table(&phys, space.root()).entry(va.pml4_index());
        assert!(e4.present());
        let e3 = table(&phys, e4.frame()).entry(va.pdpt_index());
        assert!(e3.present());
        assert!(!e3.large_page());
        let e2 = table(&phys, e3.frame()).entry(va.pd_index());
        assert!(e2.present());
        assert!(!e2.large_page());
        let e1 = table(&phys, e2.frame()).entry(va.pt_index());
        assert!(e1.present());
        assert!(e1.writable());
        assert!(e1.global_translation());
        assert!(e1.no_execute());
        assert!(!e1.large_page());
        assert_eq!(e1.frame(), pa);
    }

    #[test]
    fn map_2m_sets_large_page() {
        let (phys, mut alloc) = setup(64);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let va = VirtAddr::new(0xffff_8000_2000_0000);
        let pa = PhysAddr::new(0x40_0000);
        space
            .map_one(&mut alloc, &phys, va, pa, PageSize::Size2M, MapFlags::WRITABLE)
            .unwrap();

        let e4 = table(&phys, space.root()).entry(va.pml4_index());
        let e3 = table(&phys, e4.frame()).entry(va.pdpt_index());
        let e2 = table(&phys, e3.frame()).entry(va.pd_index());
        assert!(e2.present());
        assert!(e2.large_page());
        assert_eq!(e2.frame(), pa);

        // query resolves through the huge leaf with the right offset
        let probe = space.query(&phys, va.add_bytes(0x1234)).unwrap();
        assert_eq!(probe, pa.add_bytes(0x1234));
    }

    #[test]
    fn remap_updates_translation_in_place() {
        let (phys, mut alloc) = setup(64);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let va = VirtAddr::new(0x10_0000_0000);
        space
            .map_one(
                &mut alloc,
                &phys,
                va,
                PhysAddr::new(0x30_0000),
                PageSize::Size4K,
                MapFlags::WRITABLE,
            )
            .unwrap();
        space
            .map_one(
                &mut alloc,
                &phys,
                va,
                PhysAddr::new(0x31_0000),
                PageSize::Size4K,
                MapFlags::empty(),
            )
            .unwrap();

        assert_eq!(space.query(&phys, va), Some(PhysAddr::new(0x31_0000)));
    }

    #[test]
    fn query_includes_page_offset() {
        let (phys, mut alloc) = setup(64);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let va = VirtAddr::new(0x20_0000_0000);
        let pa = PhysAddr::new(0x32_0000);
        space
            .map_one(&mut alloc, &phys, va, pa, PageSize::Size4K, MapFlags::WRITABLE)
            .unwrap();

        assert_eq!(space.query(&phys, va.add_bytes(0xabc)), Some(pa.add_bytes(0xabc)));
        assert_eq!(space.query(&phys, VirtAddr::new(0x30_0000_0000)), None);
    }

    #[test]
    fn unmap_returns_frame_and_clears() {
        let (phys, mut alloc) = setup(64);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let va = VirtAddr::new(0x40_0000_0000);
        let pa = PhysAddr::new(0x33_0000);
        space
            .map_one(&mut alloc, &phys, va, pa, PageSize::Size4K, MapFlags::WRITABLE)
            .unwrap();

        assert_eq!(space.unmap_one(&phys, va), Ok(pa));
        assert_eq!(space.query(&phys, va), None);
        assert_eq!(space.unmap_one(&phys, va), Err(MapError::Unmapped));
    }

    #[test]
    fn four_k_inside_huge_leaf_is_an_error() {
        let (phys, mut alloc) = setup(64);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let va = VirtAddr::new(0x50_0000_0000);
        space
            .map_one(
                &mut alloc,
                &phys,
                va,
                PhysAddr::new(0x60_0000),
                PageSize::Size2M,
                MapFlags::WRITABLE,
            )
            .unwrap();

        let inner = va.add_bytes(PAGE_SIZE);
        let got = space.map_one(
            &mut alloc,
            &phys,
            inner,
            PhysAddr::new(0x34_0000),
            PageSize::Size4K,
            MapFlags::WRITABLE,
        );
        assert_eq!(got, Err(MapError::HugePage));
    }

    #[test]
    fn unaligned_mapping_is_rejected() {
        let (phys, mut alloc) = setup(16);
        let mut space = AddressSpace::new(&mut alloc, &phys).unwrap();

        let got = space.map_one(
            &mut alloc,
            &phys,
            VirtAddr::new(0x1001),
            PhysAddr::new(0x2000),
            PageSize::Size4K,
            MapFlags::WRITABLE,
        );
        assert_eq!(got, Err(MapError::Unaligned));
    }

    #[test]
    fn kernel_space_offset_maps_usable_memory() {
        let (phys, mut alloc) = setup(64);
        let map = [
            MemoryRegion::new(0x0000, 0x5000, RegionKind::Usable),
            MemoryRegion::new(0x5000, 0x2000, RegionKind::Reserved),
            MemoryRegion::new(0x7000, 0x1000, RegionKind::Reclaimable),
        ];

        let space = AddressSpace::new_kernel(&mut alloc, &phys, &map, &[]).unwrap();

        // usable + reclaimable frames are reachable through the offset map
        for pa in [0x0000u64, 0x4000, 0x7000] {
            let va = VirtAddr::new(HHDM_BASE + pa);
            assert_eq!(space.query(&phys, va), Some(PhysAddr::new(pa)));
        }
        // plain reserved memory is not
        assert_eq!(space.query(&phys, VirtAddr::new(HHDM_BASE + 0x5000)), None);
    }
}
