//! # Kernel state object
//!
//! Ties the resource-management crates together behind one shared,
//! internally locked value: the frame pool ([`kernel_pmm`]), the
//! kernel's own address space ([`kernel_vmem`]) and the scheduler
//! ([`kernel_sched`]), each behind its own lock so that every core can
//! call in concurrently through a `&Kernel`.
//!
//! ## Lock order
//!
//! `sched` before `frames` before `space`. Scheduler operations that
//! allocate or free memory take the scheduler lock first and the frame
//! lock inside it; nothing ever takes them the other way around, so
//! the ordering is deadlock free.

#![cfg_attr(not(any(test, doctest)), no_std)]

use kernel_info::boot::MemoryRegion;
use kernel_pmm::{AllocError, FrameAllocator, InitError, PoolFrameSource};
use kernel_sched::{BlockReason, Scheduler, SpawnError, Switch, ThreadRef};
use kernel_sync::{SpinMutex, TicketMutex};
use kernel_vmem::{AddressSpace, MapError, MapFlags, PageSize, PhysAddr, PhysMapper, VirtAddr};

/// Failure during kernel bring-up or a kernel service call.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Frames(#[from] AllocError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// The kernel's shared state.
///
/// One value of this type exists per boot; every core holds a `&Kernel`
/// and all mutation goes through the interior locks. The scheduler sits
/// behind a ticket lock so cores contending on every timer interrupt
/// are served in order; the frame pool and kernel address space see
/// shorter, rarer critical sections and use plain spin locks.
pub struct Kernel<'m, M: PhysMapper> {
    mapper: &'m M,
    frames: SpinMutex<FrameAllocator>,
    sched: TicketMutex<Scheduler>,
    space: SpinMutex<AddressSpace>,
}

impl<'m, M: PhysMapper> Kernel<'m, M> {
    /// Brings the kernel up from the boot memory map: initializes the
    /// frame pool, builds the kernel address space (all usable and
    /// reclaimable RAM at the higher-half direct map, `reserved` MMIO
    /// windows mapped uncached) and prepares a scheduler for `cores`
    /// logical CPUs.
    ///
    /// # Errors
    /// Fails if the memory map has no room for the frame pool or the
    /// direct map cannot be built.
    pub fn init(
        mapper: &'m M,
        cores: usize,
        memory_map: &[MemoryRegion],
        reserved: &[MemoryRegion],
    ) -> Result<Self, KernelError> {
        let mut frames = FrameAllocator::init(mapper, memory_map)?;
        let space = {
            let mut src = PoolFrameSource {
                pool: &mut frames,
                mapper,
            };
            AddressSpace::new_kernel(&mut src, mapper, memory_map, reserved)?
        };
        log::info!(
            "kernel up: {cores} cores, {} of {} frames free",
            frames.free_frames(),
            frames.total_usable_frames()
        );
        Ok(Self {
            mapper,
            frames: SpinMutex::new(frames),
            sched: TicketMutex::new(Scheduler::new(cores)),
            space: SpinMutex::new(space),
        })
    }

    /// Physical address of the kernel root page table, for loading
    /// into CR3 on cores joining the boot core.
    pub fn kernel_space_root(&self) -> PhysAddr {
        self.space.lock().root()
    }

    /// Translates a virtual address through the kernel address space.
    #[must_use]
    pub fn translate_kernel(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.space.lock().query(self.mapper, va)
    }

    /// Maps one page into the kernel address space. An existing
    /// same-size translation at `va` is replaced.
    ///
    /// # Errors
    /// See [`AddressSpace::map_one`].
    pub fn map_kernel_page(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        size: PageSize,
        flags: MapFlags,
    ) -> Result<(), KernelError> {
        let mut frames = self.frames.lock();
        let mut src = PoolFrameSource {
            pool: &mut frames,
            mapper: self.mapper,
        };
        self.space.lock().map_one(&mut src, self.mapper, va, pa, size, flags)?;
        Ok(())
    }

    /// Removes a 4 KiB translation from the kernel address space and
    /// returns the frame it pointed at.
    ///
    /// # Errors
    /// See [`AddressSpace::unmap_one`].
    pub fn unmap_kernel_page(&self, va: VirtAddr) -> Result<PhysAddr, KernelError> {
        Ok(self.space.lock().unmap_one(self.mapper, va)?)
    }

    /// Allocates `count` contiguous frames.
    ///
    /// # Errors
    /// [`AllocError::OutOfFrames`] when no suitable run exists.
    pub fn frame_alloc(&self, count: usize) -> Result<PhysAddr, AllocError> {
        self.frames.lock().alloc(self.mapper, count)
    }

    /// Allocates `count` contiguous frames and zeroes them.
    ///
    /// # Errors
    /// [`AllocError::OutOfFrames`] when no suitable run exists.
    pub fn frame_allocz(&self, count: usize) -> Result<PhysAddr, AllocError> {
        self.frames.lock().allocz(self.mapper, count)
    }

    /// Returns `count` frames starting at `base` to the pool.
    pub fn frame_free(&self, base: PhysAddr, count: usize) {
        self.frames.lock().free(self.mapper, base, count);
    }

    /// Frames currently free in the pool.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    /// Frames the pool managed at boot.
    #[must_use]
    pub fn total_usable_frames(&self) -> usize {
        self.frames.lock().total_usable_frames()
    }

    /// Creates a process whose main thread starts at `entry` with
    /// `arg` as its first argument.
    ///
    /// # Errors
    /// Propagates allocation and mapping failures.
    pub fn spawn_process(&self, entry: VirtAddr, arg: u64) -> Result<ThreadRef, KernelError> {
        let mut sched = self.sched.lock_irq();
        let mut frames = self.frames.lock();
        Ok(sched.spawn_process(&mut frames, self.mapper, entry, arg)?)
    }

    /// Creates another thread in the process currently running on
    /// `core`.
    ///
    /// # Errors
    /// [`SpawnError::NoCurrentThread`] if the core is idle, otherwise
    /// as for [`Kernel::spawn_process`].
    pub fn spawn_thread(
        &self,
        core: usize,
        entry: VirtAddr,
        arg: u64,
    ) -> Result<ThreadRef, KernelError> {
        let mut sched = self.sched.lock_irq();
        let mut frames = self.frames.lock();
        Ok(sched.spawn_thread(&mut frames, self.mapper, core, entry, arg)?)
    }

    /// Blocks the thread running on `core` and picks its successor.
    pub fn block_current(&self, core: usize, reason: BlockReason) -> Switch {
        let mut sched = self.sched.lock_irq();
        let mut frames = self.frames.lock();
        sched.block_current(core, &mut frames, self.mapper, reason)
    }

    /// Makes a blocked thread runnable again. Safe to call from
    /// interrupt context.
    pub fn unblock(&self, r: ThreadRef) {
        self.sched.lock_irq().unblock(r);
    }

    /// Terminates the thread running on `core` and picks its
    /// successor. The returned [`Switch`] never resumes the caller.
    pub fn exit_current(&self, core: usize, return_value: u64) -> Switch {
        let mut sched = self.sched.lock_irq();
        let mut frames = self.frames.lock();
        sched.exit_current(core, &mut frames, self.mapper, return_value)
    }

    /// Puts the thread running on `core` to sleep for at least `ticks`
    /// timer periods.
    pub fn sleep_current(&self, core: usize, ticks: u64) -> Switch {
        let mut sched = self.sched.lock_irq();
        let mut frames = self.frames.lock();
        sched.sleep_current(core, &mut frames, self.mapper, ticks)
    }

    /// Timer interrupt entry for the boot core.
    pub fn timer_tick(&self, core: usize) -> Switch {
        let mut sched = self.sched.lock_irq();
        let mut frames = self.frames.lock();
        sched.timer_tick(core, &mut frames, self.mapper)
    }

    /// Timer interrupt entry for every other core.
    pub fn preempt(&self, core: usize) -> Switch {
        let mut sched = self.sched.lock_irq();
        let mut frames = self.frames.lock();
        sched.preempt(core, &mut frames, self.mapper)
    }

    /// Requests cooperative cancellation of a thread. It exits at its
    /// next block or sleep checkpoint.
    pub fn kill(&self, r: ThreadRef) {
        self.sched.lock_irq().kill(r);
    }

    /// Thread currently running on `core`.
    #[must_use]
    pub fn current(&self, core: usize) -> Option<ThreadRef> {
        self.sched.lock_irq().current(core)
    }

    /// Global timer tick count.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.sched.lock_irq().ticks()
    }

    /// Return code of a process whose main thread has exited.
    #[must_use]
    pub fn process_return_code(&self, process: usize) -> Option<u8> {
        self.sched
            .lock_irq()
            .process(process)
            .and_then(kernel_sched::Process::return_code)
    }

    /// Read-only view into the scheduler, for inspection.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&Scheduler) -> R) -> R {
        f(&self.sched.lock_irq())
    }
}
