//! # Physical Frame Allocator
//!
//! Bitmap allocator over the firmware memory map: one bit per 4 KiB
//! frame across the whole reported physical span, set meaning in use.
//! The bitmap itself lives in managed physical memory (carved out of
//! the first usable region that can hold it) and is reached through the
//! [`PhysMapper`] seam, so the allocator works identically on the
//! machine and against simulated RAM in tests.
//!
//! The allocator is not internally synchronized. The kernel state
//! object wraps it in a lock; see `kernel`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use kernel_info::MemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{FrameSource, PhysAddr, PhysMapper};

/// Allocation failure.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    /// No run of `requested` contiguous free frames exists.
    #[error("out of physical frames (requested {requested})")]
    OutOfFrames { requested: usize },
}

/// Failure to build the allocator from the memory map.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("memory map contains no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold the {bytes}-byte frame bitmap")]
    NoRoomForBitmap { bytes: usize },
}

/// Bitmap allocator for physical frames.
///
/// Placement is first-fit from a rotating search hint; the policy is
/// not observable by callers, but the allocator is count-conserving:
/// `free + allocated == total usable` holds after every operation.
pub struct FrameAllocator {
    /// Where the bitmap was carved out of usable memory.
    bitmap_base: PhysAddr,
    bitmap_bytes: usize,
    /// Frames covered by the bitmap (the whole physical span, including
    /// holes and reserved regions, which stay permanently marked used).
    span_frames: usize,
    /// Frames ever handed to the free pool.
    total_usable: usize,
    free_frames: usize,
    /// Frame index where the next scan starts.
    search_hint: usize,
}

impl FrameAllocator {
    /// Builds the free pool from the firmware memory map.
    ///
    /// Only `Usable` regions enter the pool; everything else, the
    /// bitmap's own frames, and frame 0 (kept out so a zero address
    /// never doubles as a valid allocation) stay marked used.
    ///
    /// # Errors
    /// [`InitError::NoUsableMemory`] or [`InitError::NoRoomForBitmap`].
    pub fn init<M: PhysMapper>(
        mapper: &M,
        memory_map: &[MemoryRegion],
    ) -> Result<Self, InitError> {
        let span_end = memory_map
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.frame_aligned().end())
            .max()
            .ok_or(InitError::NoUsableMemory)?;
        if span_end == 0 {
            return Err(InitError::NoUsableMemory);
        }

        let span_frames = (span_end / PAGE_SIZE) as usize;
        let bitmap_bytes = span_frames.div_ceil(8);
        let bitmap_span = (bitmap_bytes as u64).next_multiple_of(PAGE_SIZE);

        // Carve the bitmap out of the first usable region that can hold
        // it, skipping frame 0.
        let bitmap_base = memory_map
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.frame_aligned())
            .find_map(|r| {
                let base = r.base.max(PAGE_SIZE);
                (r.end() >= base + bitmap_span).then_some(base)
            })
            .ok_or(InitError::NoRoomForBitmap {
                bytes: bitmap_bytes,
            })?;

        let mut pool = Self {
            bitmap_base: PhysAddr::new(bitmap_base),
            bitmap_bytes,
            span_frames,
            total_usable: 0,
            free_frames: 0,
            search_hint: 0,
        };

        // Everything starts out used...
        for i in 0..bitmap_bytes {
            *pool.bitmap_byte_mut(mapper, i) = 0xff;
        }
        // ...then usable frames are released...
        for region in memory_map.iter().filter(|r| r.is_usable()) {
            let region = region.frame_aligned();
            let first = (region.base / PAGE_SIZE) as usize;
            let count = (region.length / PAGE_SIZE) as usize;
            for frame in first..first + count {
                if frame == 0 {
                    continue;
                }
                if pool.is_used(mapper, frame) {
                    pool.mark_free(mapper, frame);
                    pool.free_frames += 1;
                }
            }
        }
        // ...and the bitmap's own frames are taken back.
        let bitmap_first = (bitmap_base / PAGE_SIZE) as usize;
        for frame in bitmap_first..bitmap_first + (bitmap_span / PAGE_SIZE) as usize {
            if !pool.is_used(mapper, frame) {
                pool.mark_used(mapper, frame);
                pool.free_frames -= 1;
            }
        }

        pool.total_usable = pool.free_frames;
        pool.search_hint = 1;

        log::info!(
            "pmm: {} usable frames, bitmap at {:#x} ({} bytes)",
            pool.total_usable,
            bitmap_base,
            bitmap_bytes
        );
        Ok(pool)
    }

    /// Allocates `count` contiguous frames.
    ///
    /// # Errors
    /// [`AllocError::OutOfFrames`] if no suitable run exists.
    pub fn alloc<M: PhysMapper>(
        &mut self,
        mapper: &M,
        count: usize,
    ) -> Result<PhysAddr, AllocError> {
        debug_assert!(count > 0, "zero-frame allocation");
        if count > self.free_frames {
            return Err(AllocError::OutOfFrames { requested: count });
        }

        let mut run = 0usize;
        let mut start = 0usize;
        let mut frame = self.search_hint;
        for _ in 0..self.span_frames {
            if frame >= self.span_frames {
                frame = 0;
                run = 0;
            }
            if self.is_used(mapper, frame) {
                run = 0;
            } else {
                if run == 0 {
                    start = frame;
                }
                run += 1;
                if run == count {
                    for f in start..start + count {
                        self.mark_used(mapper, f);
                    }
                    self.free_frames -= count;
                    self.search_hint = start + count;
                    let pa = PhysAddr::new(start as u64 * PAGE_SIZE);
                    log::trace!("pmm: alloc {} at {:#x}", count, pa.as_u64());
                    return Ok(pa);
                }
            }
            frame += 1;
        }
        Err(AllocError::OutOfFrames { requested: count })
    }

    /// Allocates `count` contiguous frames and zero-fills them.
    ///
    /// Required for stack regions and fresh page tables so stale
    /// physical memory content never leaks into a new owner.
    ///
    /// # Errors
    /// [`AllocError::OutOfFrames`] if no suitable run exists.
    pub fn allocz<M: PhysMapper>(
        &mut self,
        mapper: &M,
        count: usize,
    ) -> Result<PhysAddr, AllocError> {
        let base = self.alloc(mapper, count)?;
        for i in 0..count as u64 {
            let frame: &mut u8 = unsafe { mapper.phys_to_mut(base.add_bytes(i * PAGE_SIZE)) };
            unsafe {
                core::ptr::write_bytes(core::ptr::from_mut(frame), 0, PAGE_SIZE as usize);
            }
        }
        Ok(base)
    }

    /// Returns `count` frames starting at `base` to the free pool.
    ///
    /// The caller must exclusively own the frames and must free them at
    /// most once; debug builds flag violations, release builds trust
    /// the caller.
    pub fn free<M: PhysMapper>(&mut self, mapper: &M, base: PhysAddr, count: usize) {
        debug_assert!(base.is_frame_aligned(), "freeing unaligned address");
        let first = (base.as_u64() / PAGE_SIZE) as usize;
        debug_assert!(first + count <= self.span_frames, "free outside managed span");

        for frame in first..first + count {
            debug_assert!(
                self.is_used(mapper, frame),
                "double free of frame {frame:#x}"
            );
            self.mark_free(mapper, frame);
        }
        self.free_frames += count;
        if first < self.search_hint {
            self.search_hint = first;
        }
        log::trace!("pmm: free {} at {:#x}", count, base.as_u64());
    }

    /// Frames currently in the free pool.
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Frames the pool ever contained; `free + allocated` equals this
    /// at all times.
    #[must_use]
    pub const fn total_usable_frames(&self) -> usize {
        self.total_usable
    }

    fn bitmap_byte_mut<'a, M: PhysMapper>(&self, mapper: &M, index: usize) -> &'a mut u8 {
        debug_assert!(index < self.bitmap_bytes);
        unsafe { mapper.phys_to_mut::<u8>(self.bitmap_base.add_bytes(index as u64)) }
    }

    fn is_used<M: PhysMapper>(&self, mapper: &M, frame: usize) -> bool {
        *self.bitmap_byte_mut(mapper, frame / 8) & (1 << (frame % 8)) != 0
    }

    fn mark_used<M: PhysMapper>(&mut self, mapper: &M, frame: usize) {
        *self.bitmap_byte_mut(mapper, frame / 8) |= 1 << (frame % 8);
    }

    fn mark_free<M: PhysMapper>(&mut self, mapper: &M, frame: usize) {
        *self.bitmap_byte_mut(mapper, frame / 8) &= !(1 << (frame % 8));
    }
}

/// Adapter lending the allocator out as a [`FrameSource`] for paging
/// structure allocation.
pub struct PoolFrameSource<'a, M: PhysMapper> {
    pub pool: &'a mut FrameAllocator,
    pub mapper: &'a M,
}

impl<M: PhysMapper> FrameSource for PoolFrameSource<'_, M> {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        self.pool.alloc(self.mapper, 1).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_simphys::SimPhys;

    fn pool(frames: usize) -> (SimPhys, FrameAllocator) {
        let sim = SimPhys::new(frames);
        let pmm = FrameAllocator::init(&sim, &sim.usable_map()).unwrap();
        (sim, pmm)
    }

    #[test]
    fn init_reserves_bitmap_and_frame_zero() {
        let (_sim, pmm) = pool(64);
        // 64 frames: one for the bitmap page, one for frame 0
        assert_eq!(pmm.total_usable_frames(), 62);
        assert_eq!(pmm.free_frames(), 62);
    }

    #[test]
    fn conservation_across_alloc_and_free() {
        let (sim, mut pmm) = pool(64);
        let total = pmm.total_usable_frames();

        let a = pmm.alloc(&sim, 3).unwrap();
        assert_eq!(pmm.free_frames(), total - 3);
        let b = pmm.alloc(&sim, 5).unwrap();
        assert_eq!(pmm.free_frames(), total - 8);

        pmm.free(&sim, a, 3);
        assert_eq!(pmm.free_frames(), total - 5);
        let c = pmm.alloc(&sim, 2).unwrap();
        assert_eq!(pmm.free_frames(), total - 7);

        pmm.free(&sim, b, 5);
        pmm.free(&sim, c, 2);
        assert_eq!(pmm.free_frames(), total);
    }

    #[test]
    fn live_allocations_never_overlap() {
        let (sim, mut pmm) = pool(128);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for count in [1usize, 4, 2, 8, 1, 3] {
            let base = pmm.alloc(&sim, count).unwrap().as_u64();
            let end = base + count as u64 * 4096;
            for &(lb, le) in &live {
                assert!(end <= lb || base >= le, "overlap with a live allocation");
            }
            live.push((base, end));
        }
    }

    #[test]
    fn allocz_returns_zeroed_frames() {
        let (sim, mut pmm) = pool(64);

        // dirty a frame, free it, and expect allocz to scrub the reuse
        let a = pmm.alloc(&sim, 1).unwrap();
        let dirty: &mut [u8; 4096] = unsafe { sim.phys_to_mut(a) };
        dirty.fill(0x5a);
        pmm.free(&sim, a, 1);

        let b = pmm.allocz(&sim, 2).unwrap();
        for off in 0..2 * 4096 {
            assert_eq!(sim.byte(b.as_u64() + off), 0, "stale byte at offset {off}");
        }
    }

    #[test]
    fn exhaustion_is_an_error_not_a_panic() {
        let (sim, mut pmm) = pool(16);
        let total = pmm.total_usable_frames();

        let all = pmm.alloc(&sim, total).unwrap();
        assert_eq!(pmm.free_frames(), 0);
        assert_eq!(
            pmm.alloc(&sim, 1),
            Err(AllocError::OutOfFrames { requested: 1 })
        );

        pmm.free(&sim, all, total);
        assert_eq!(pmm.free_frames(), total);
    }

    #[test]
    fn contiguous_request_larger_than_any_run_fails() {
        let (sim, mut pmm) = pool(16);
        let total = pmm.total_usable_frames();
        assert!(pmm.alloc(&sim, total + 1).is_err());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_detected_in_debug() {
        let (sim, mut pmm) = pool(32);
        let a = pmm.alloc(&sim, 2).unwrap();
        pmm.free(&sim, a, 2);
        pmm.free(&sim, a, 2);
    }

    #[test]
    fn only_usable_regions_enter_the_pool() {
        use kernel_info::{MemoryRegion, RegionKind};

        let sim = SimPhys::new(64);
        let map = [
            MemoryRegion::new(0, 16 * 4096, RegionKind::Usable),
            MemoryRegion::new(16 * 4096, 32 * 4096, RegionKind::Reserved),
            MemoryRegion::new(48 * 4096, 16 * 4096, RegionKind::Reclaimable),
        ];
        let mut pmm = FrameAllocator::init(&sim, &map).unwrap();

        // 16 usable frames minus frame 0 and the bitmap page
        assert_eq!(pmm.total_usable_frames(), 14);

        // every frame handed out must come from the usable region
        while let Ok(pa) = pmm.alloc(&sim, 1) {
            assert!(pa.as_u64() < 16 * 4096);
        }
    }
}
