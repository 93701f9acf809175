use crate::context::Context;
use crate::process::Process;
use crate::thread::{BlockReason, StackRegion, Thread, ThreadId, ThreadState};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use kernel_info::memory::{PAGE_SIZE, THREAD_STACK_SIZE};
use kernel_pmm::{AllocError, FrameAllocator, PoolFrameSource};
use kernel_vmem::{AddressSpace, MapError, MapFlags, PageSize, PhysMapper, VirtAddr};

/// Stable handle to a thread: indices into the process table and the
/// process's thread table. Both tables only ever grow, so a handle
/// stays valid for the boot session (the thread it names may be
/// `Terminated`).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ThreadRef {
    process: usize,
    thread: usize,
}

impl ThreadRef {
    #[must_use]
    pub const fn process_index(self) -> usize {
        self.process
    }

    #[must_use]
    pub const fn thread_index(self) -> usize {
        self.thread
    }

    /// Whether this is its process's main thread.
    #[must_use]
    pub const fn is_main(self) -> bool {
        self.thread == 0
    }
}

/// Thread creation failure.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// No frames were available for the stack or a paging structure.
    #[error(transparent)]
    Frames(#[from] AllocError),
    /// Mapping the stack into the process's address space failed.
    #[error("mapping a thread stack failed: {0}")]
    Map(#[from] MapError),
    /// `spawn_thread` was called on a core with no current thread to
    /// take the owning process from.
    #[error("no current thread on core {core}")]
    NoCurrentThread { core: usize },
}

/// What caused a reschedule.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Trigger {
    /// Voluntary suspension: the current thread blocked or exited.
    Yield,
    /// Timer preemption of a still-runnable thread.
    Timer,
}

/// Outcome of a scheduling decision, to be acted on by the
/// architecture layer (context switch or halt).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Switch {
    /// Run `next`; `previous` (if any) has been put back in line or
    /// retired according to its state.
    To {
        previous: Option<ThreadRef>,
        next: ThreadRef,
    },
    /// Nothing is runnable on this core; halt until the next interrupt.
    Idle { previous: Option<ThreadRef> },
}

struct Core {
    current: Option<ThreadRef>,
    /// All live threads assigned to this core, in rotation order.
    /// Blocked entries stay in line and are skipped; terminated entries
    /// fall out during rotation.
    run_queue: VecDeque<ThreadRef>,
}

impl Core {
    const fn new() -> Self {
        Self {
            current: None,
            run_queue: VecDeque::new(),
        }
    }
}

/// The scheduler state machine.
///
/// Not internally synchronized: the kernel state object serializes all
/// calls behind one lock, which also covers the identifier counter, so
/// thread ids are strictly increasing across cores.
pub struct Scheduler {
    processes: Vec<Process>,
    cores: Vec<Core>,
    /// Global timer tick counter; advanced by the boot core's tick.
    ticks: u64,
    next_id: u64,
}

impl Scheduler {
    /// A scheduler for `cores` logical CPUs.
    #[must_use]
    pub fn new(cores: usize) -> Self {
        let mut v = Vec::with_capacity(cores);
        for _ in 0..cores {
            v.push(Core::new());
        }
        Self {
            processes: Vec::new(),
            cores: v,
            ticks: 0,
            next_id: 1,
        }
    }

    /// Current global tick.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    #[must_use]
    pub fn process(&self, index: usize) -> Option<&Process> {
        self.processes.get(index)
    }

    #[must_use]
    pub fn thread(&self, r: ThreadRef) -> Option<&Thread> {
        self.processes.get(r.process)?.thread(r.thread)
    }

    pub fn thread_mut(&mut self, r: ThreadRef) -> Option<&mut Thread> {
        self.processes.get_mut(r.process)?.thread_mut(r.thread)
    }

    /// Thread currently on the given core.
    #[must_use]
    pub fn current(&self, core: usize) -> Option<ThreadRef> {
        self.cores.get(core).and_then(|c| c.current)
    }

    /// Creates a new process with its main thread.
    ///
    /// # Errors
    /// [`SpawnError::Frames`] / [`SpawnError::Map`] if stack or paging
    /// memory cannot be allocated.
    pub fn spawn_process<M: PhysMapper>(
        &mut self,
        pmm: &mut FrameAllocator,
        mapper: &M,
        entry: VirtAddr,
        arg: u64,
    ) -> Result<ThreadRef, SpawnError> {
        let space = {
            let mut src = PoolFrameSource { pool: pmm, mapper };
            AddressSpace::new(&mut src, mapper)?
        };
        self.processes.push(Process::new(space));
        let process = self.processes.len() - 1;
        match self.admit_thread(pmm, mapper, process, entry, arg) {
            Ok(r) => {
                log::debug!("spawned process {process} with main thread {}", r.thread);
                Ok(r)
            }
            // no process without a main thread; drop the half-built one
            Err(e) => {
                self.processes.pop();
                Err(e)
            }
        }
    }

    /// Creates an additional thread in the process of the thread
    /// currently running on `core`.
    ///
    /// # Errors
    /// [`SpawnError::NoCurrentThread`] if the core is idle, otherwise
    /// as for [`Scheduler::spawn_process`].
    pub fn spawn_thread<M: PhysMapper>(
        &mut self,
        pmm: &mut FrameAllocator,
        mapper: &M,
        core: usize,
        entry: VirtAddr,
        arg: u64,
    ) -> Result<ThreadRef, SpawnError> {
        let current = self
            .current(core)
            .ok_or(SpawnError::NoCurrentThread { core })?;
        self.admit_thread(pmm, mapper, current.process, entry, arg)
    }

    /// Shared tail of process/thread creation: stack allocation and
    /// mapping, identifier assignment, context fabrication, enqueue.
    fn admit_thread<M: PhysMapper>(
        &mut self,
        pmm: &mut FrameAllocator,
        mapper: &M,
        process: usize,
        entry: VirtAddr,
        arg: u64,
    ) -> Result<ThreadRef, SpawnError> {
        let pages = (THREAD_STACK_SIZE / PAGE_SIZE) as usize;
        let frames = pmm.allocz(mapper, pages)?;

        let base = self.processes[process].reserve_stack_range();
        let mapped = {
            // Stacks are ordinary kernel data pages.
            let flags = MapFlags::WRITABLE | MapFlags::NO_EXECUTE;
            let mut src = PoolFrameSource { pool: pmm, mapper };
            let space = self.processes[process].space_mut();
            (0..pages).try_for_each(|i| {
                let off = i as u64 * PAGE_SIZE;
                space.map_one(
                    &mut src,
                    mapper,
                    base.add_bytes(off),
                    frames.add_bytes(off),
                    PageSize::Size4K,
                    flags,
                )
            })
        };
        if let Err(e) = mapped {
            // the advanced cursor keeps the partially mapped range out
            // of reuse; the frames themselves go back
            pmm.free(mapper, frames, pages);
            return Err(e.into());
        }

        let stack = StackRegion::new(base, frames, pages);
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;

        let mut thread = Thread::new(id, Context::first_call(entry, arg, stack.top()), stack);
        thread.transition(ThreadState::Ready);

        let index = self.processes[process].push_thread(thread);
        let r = ThreadRef {
            process,
            thread: index,
        };

        // place new threads on the least loaded core
        let target = self.least_loaded_core();
        self.cores[target].run_queue.push_back(r);
        log::debug!("thread {id} admitted to core {target}");
        Ok(r)
    }

    fn least_loaded_core(&self) -> usize {
        let mut best = 0;
        let mut best_len = usize::MAX;
        for (i, core) in self.cores.iter().enumerate() {
            let len = core.run_queue.len() + usize::from(core.current.is_some());
            if len < best_len {
                best = i;
                best_len = len;
            }
        }
        best
    }

    /// Voluntarily suspends the current thread with the given reason
    /// and yields. A killed thread does not block again: the flag is
    /// observed here, at its cooperative checkpoint, and the thread
    /// exits instead.
    pub fn block_current<M: PhysMapper>(
        &mut self,
        core: usize,
        pmm: &mut FrameAllocator,
        mapper: &M,
        reason: BlockReason,
    ) -> Switch {
        let Some(current) = self.current(core) else {
            return self.reschedule(core, pmm, mapper, Trigger::Yield);
        };
        // a sibling torn down from another core is already terminated;
        // retire it instead of touching its state again
        if self
            .thread(current)
            .is_none_or(|t| t.state() == ThreadState::Terminated)
        {
            return self.reschedule(core, pmm, mapper, Trigger::Yield);
        }
        if self.thread(current).is_some_and(Thread::killed) {
            return self.exit_current(core, pmm, mapper, 0);
        }
        if let Some(t) = self.thread_mut(current) {
            t.set_block_reason(reason);
            t.transition(ThreadState::Blocked);
        }
        self.reschedule(core, pmm, mapper, Trigger::Yield)
    }

    /// Makes a blocked thread runnable again. Callable from interrupt
    /// context; never blocks. A terminated thread stays terminated.
    pub fn unblock(&mut self, r: ThreadRef) {
        let Some(t) = self.thread_mut(r) else {
            return;
        };
        if t.state() == ThreadState::Blocked {
            t.set_block_reason(BlockReason::Nothing);
            t.transition(ThreadState::Ready);
        }
    }

    /// Marks a thread for cooperative cancellation. The flag is only
    /// observed at the thread's own block/exit checkpoints.
    pub fn kill(&mut self, r: ThreadRef) {
        if let Some(t) = self.thread_mut(r) {
            t.mark_killed();
        }
    }

    /// Terminates the current thread, returning its stack frames to the
    /// free pool. Wakes any thread waiting on it first. If the main
    /// thread exits, the process's return code is set to the low 8 bits
    /// of `return_value` and the remaining sibling threads are torn
    /// down. The returned [`Switch`] never resumes the exiting thread.
    pub fn exit_current<M: PhysMapper>(
        &mut self,
        core: usize,
        pmm: &mut FrameAllocator,
        mapper: &M,
        return_value: u64,
    ) -> Switch {
        let Some(current) = self.current(core) else {
            return self.reschedule(core, pmm, mapper, Trigger::Yield);
        };
        // already terminated by a remote process teardown; nothing
        // left to exit, reschedule retires it
        let Some(exiting_id) = self
            .thread(current)
            .filter(|t| t.state() != ThreadState::Terminated)
            .map(Thread::id)
        else {
            return self.reschedule(core, pmm, mapper, Trigger::Yield);
        };

        self.wake_waiters_of(exiting_id);

        if let Some(t) = self.thread_mut(current) {
            t.set_return_value(return_value);
            t.transition(ThreadState::Terminated);
            if let Some(stack) = t.take_stack() {
                let (pa, pages) = stack.into_frames();
                pmm.free(mapper, pa, pages);
            }
        }

        if current.is_main() {
            self.exit_process(current.process, pmm, mapper, return_value);
        }

        log::debug!("thread {exiting_id} exited with {return_value}");
        self.reschedule(core, pmm, mapper, Trigger::Yield)
    }

    /// Main thread exited: record the truncated return code and tear
    /// down the remaining sibling threads. Address-space reclamation is
    /// left to the surrounding kernel.
    fn exit_process<M: PhysMapper>(
        &mut self,
        process: usize,
        pmm: &mut FrameAllocator,
        mapper: &M,
        return_value: u64,
    ) {
        let Some(proc) = self.processes.get_mut(process) else {
            return;
        };
        proc.set_return_code(return_value as u8);
        for sibling in proc.threads_mut().iter_mut().skip(1) {
            if sibling.state() == ThreadState::Terminated {
                continue;
            }
            let on_cpu = sibling.state() == ThreadState::Running;
            sibling.transition(ThreadState::Terminated);
            // a sibling still executing on another core keeps its stack
            // until that core retires it in reschedule
            if on_cpu {
                continue;
            }
            if let Some(stack) = sibling.take_stack() {
                let (pa, pages) = stack.into_frames();
                pmm.free(mapper, pa, pages);
            }
        }
        log::debug!(
            "process {process} exited with code {}",
            return_value as u8
        );
    }

    /// Puts the current thread to sleep for at least `ticks` timer
    /// periods. It will not be selected again before the global tick
    /// reaches `now + ticks`.
    pub fn sleep_current<M: PhysMapper>(
        &mut self,
        core: usize,
        pmm: &mut FrameAllocator,
        mapper: &M,
        ticks: u64,
    ) -> Switch {
        if let Some(current) = self.current(core) {
            let wake = self.ticks + ticks;
            if let Some(t) = self.thread_mut(current) {
                if t.state() != ThreadState::Terminated {
                    t.set_wake_tick(wake);
                }
            }
        }
        self.block_current(core, pmm, mapper, BlockReason::Sleeping)
    }

    /// Timer interrupt entry for the boot core: advances the global
    /// tick, wakes due sleepers, and preempts the interrupted thread.
    pub fn timer_tick<M: PhysMapper>(
        &mut self,
        core: usize,
        pmm: &mut FrameAllocator,
        mapper: &M,
    ) -> Switch {
        self.ticks += 1;
        self.wake_sleepers();
        self.reschedule(core, pmm, mapper, Trigger::Timer)
    }

    /// Timer interrupt entry for secondary cores: preemption only, the
    /// global tick is owned by the boot core.
    pub fn preempt<M: PhysMapper>(
        &mut self,
        core: usize,
        pmm: &mut FrameAllocator,
        mapper: &M,
    ) -> Switch {
        self.reschedule(core, pmm, mapper, Trigger::Timer)
    }

    /// The single scheduling entry point: retires or requeues the
    /// outgoing thread according to its state, then rotates the core's
    /// queue to the next ready thread.
    ///
    /// This is the only place a thread that was terminated from another
    /// core while running here is let go of; its stack, whose free was
    /// deferred to keep the frames alive under the executing thread,
    /// goes back to the pool at that point.
    pub fn reschedule<M: PhysMapper>(
        &mut self,
        core: usize,
        pmm: &mut FrameAllocator,
        mapper: &M,
        trigger: Trigger,
    ) -> Switch {
        log::trace!("reschedule core {core} ({trigger:?})");
        let previous = self.cores[core].current.take();

        if let Some(prev) = previous {
            match self.thread(prev).map(Thread::state) {
                Some(ThreadState::Running) => {
                    // preempted mid-run; back in line
                    if let Some(t) = self.thread_mut(prev) {
                        t.transition(ThreadState::Ready);
                    }
                    self.cores[core].run_queue.push_back(prev);
                }
                Some(ThreadState::Blocked) => {
                    // stays in line, skipped until woken
                    self.cores[core].run_queue.push_back(prev);
                }
                Some(ThreadState::Terminated) => {
                    // terminated remotely while current here; release
                    // the stack now that this core no longer runs on it
                    if let Some(stack) = self.thread_mut(prev).and_then(Thread::take_stack) {
                        let (pa, pages) = stack.into_frames();
                        pmm.free(mapper, pa, pages);
                    }
                }
                _ => {}
            }
        }

        let slots = self.cores[core].run_queue.len();
        for _ in 0..slots {
            let Some(candidate) = self.cores[core].run_queue.pop_front() else {
                break;
            };
            match self.thread(candidate).map(Thread::state) {
                Some(ThreadState::Ready) => {
                    if let Some(t) = self.thread_mut(candidate) {
                        t.transition(ThreadState::Running);
                    }
                    self.cores[core].current = Some(candidate);
                    return Switch::To {
                        previous,
                        next: candidate,
                    };
                }
                Some(ThreadState::Blocked) => {
                    self.cores[core].run_queue.push_back(candidate);
                }
                // terminated entries fall out of the rotation here
                _ => {}
            }
        }

        Switch::Idle { previous }
    }

    /// Unblocks every thread waiting on `exited`.
    fn wake_waiters_of(&mut self, exited: ThreadId) {
        for proc in &mut self.processes {
            for t in proc.threads_mut() {
                if t.state() == ThreadState::Blocked
                    && t.block_reason() == BlockReason::Waiting(exited)
                {
                    t.set_block_reason(BlockReason::Nothing);
                    t.transition(ThreadState::Ready);
                }
            }
        }
    }

    /// Makes every sleeper whose wake tick has been reached runnable.
    fn wake_sleepers(&mut self) {
        let now = self.ticks;
        for proc in &mut self.processes {
            for t in proc.threads_mut() {
                if t.state() == ThreadState::Blocked
                    && t.block_reason() == BlockReason::Sleeping
                    && t.wake_tick() <= now
                {
                    t.set_block_reason(BlockReason::Nothing);
                    t.transition(ThreadState::Ready);
                }
            }
        }
    }
}
