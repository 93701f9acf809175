use crate::context::Context;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{PhysAddr, VirtAddr};

/// Globally unique thread identifier; never reused within a boot
/// session, strictly increasing in issuance order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ThreadId(u64);

impl ThreadId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread lifecycle. `Terminated` is absorbing.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Control block exists but the thread is not yet schedulable.
    Initial,
    /// Waiting in line for a core.
    Ready,
    /// Currently on a core.
    Running,
    /// Waiting for an event; see [`BlockReason`].
    Blocked,
    /// Done. Nothing leaves this state.
    Terminated,
}

impl ThreadState {
    /// Legal transitions of the lifecycle machine.
    pub(crate) const fn may_become(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Initial, Self::Ready)
                | (Self::Ready, Self::Running)
                | (Self::Running, Self::Ready | Self::Blocked)
                | (Self::Blocked, Self::Ready)
                // teardown may terminate a thread in any live state
                | (
                    Self::Initial | Self::Ready | Self::Running | Self::Blocked,
                    Self::Terminated
                )
        )
    }
}

/// Why a blocked thread is blocked.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BlockReason {
    /// Not blocked (or block cause already consumed).
    Nothing,
    /// Sleeping until the thread's wake tick.
    Sleeping,
    /// Waiting for the given thread to exit.
    Waiting(ThreadId),
}

/// Owned handle to a thread's mapped stack.
///
/// Deliberately not `Copy`/`Clone`: the region is consumed exactly once
/// at thread exit, when its frames transfer back to the allocator's
/// free pool. A second free is therefore unrepresentable through this
/// handle.
#[derive(Debug)]
pub struct StackRegion {
    virt: VirtAddr,
    phys: PhysAddr,
    pages: usize,
}

impl StackRegion {
    pub(crate) const fn new(virt: VirtAddr, phys: PhysAddr, pages: usize) -> Self {
        Self { virt, phys, pages }
    }

    /// Lowest mapped virtual address of the stack.
    #[must_use]
    pub const fn virt(&self) -> VirtAddr {
        self.virt
    }

    /// First physical frame backing the stack.
    #[must_use]
    pub const fn phys(&self) -> PhysAddr {
        self.phys
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// One past the highest mapped byte; the initial stack pointer.
    #[must_use]
    pub const fn top(&self) -> VirtAddr {
        VirtAddr::new(self.virt.as_u64() + self.pages as u64 * PAGE_SIZE)
    }

    /// Consumes the handle, yielding the frame range for the free pool.
    pub(crate) fn into_frames(self) -> (PhysAddr, usize) {
        (self.phys, self.pages)
    }
}

/// Thread control block.
pub struct Thread {
    id: ThreadId,
    state: ThreadState,
    block_reason: BlockReason,
    /// Advisory cancellation flag, observed at cooperative checkpoints.
    killed: bool,
    /// Global tick at which a sleeping thread becomes runnable again.
    wake_tick: u64,
    return_value: u64,
    context: Context,
    /// Present while the thread is live; taken exactly once at exit.
    stack: Option<StackRegion>,
}

impl Thread {
    pub(crate) const fn new(id: ThreadId, context: Context, stack: StackRegion) -> Self {
        Self {
            id,
            state: ThreadState::Initial,
            block_reason: BlockReason::Nothing,
            killed: false,
            wake_tick: 0,
            return_value: 0,
            context,
            stack: Some(stack),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ThreadId {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> ThreadState {
        self.state
    }

    #[must_use]
    pub const fn block_reason(&self) -> BlockReason {
        self.block_reason
    }

    #[must_use]
    pub const fn killed(&self) -> bool {
        self.killed
    }

    #[must_use]
    pub const fn wake_tick(&self) -> u64 {
        self.wake_tick
    }

    #[must_use]
    pub const fn return_value(&self) -> u64 {
        self.return_value
    }

    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    pub const fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Live stack region, if the thread has not exited yet.
    #[must_use]
    pub const fn stack(&self) -> Option<&StackRegion> {
        self.stack.as_ref()
    }

    /// Central transition point; the lifecycle machine is enforced in
    /// debug builds.
    pub(crate) fn transition(&mut self, to: ThreadState) {
        debug_assert!(
            self.state.may_become(to),
            "illegal thread state transition {:?} -> {:?}",
            self.state,
            to
        );
        self.state = to;
    }

    pub(crate) const fn set_block_reason(&mut self, reason: BlockReason) {
        self.block_reason = reason;
    }

    pub(crate) const fn set_wake_tick(&mut self, tick: u64) {
        self.wake_tick = tick;
    }

    pub(crate) const fn set_return_value(&mut self, value: u64) {
        self.return_value = value;
    }

    pub(crate) const fn mark_killed(&mut self) {
        self.killed = true;
    }

    pub(crate) fn take_stack(&mut self) -> Option<StackRegion> {
        self.stack.take()
    }
}
