use crate::thread::Thread;
use alloc::vec::Vec;
use kernel_info::memory::{THREAD_STACK_BASE, THREAD_STACK_GUARD, THREAD_STACK_SIZE};
use kernel_vmem::{AddressSpace, VirtAddr};

/// Process control block.
///
/// Owns its address space and its threads by value, in creation order:
/// index 0 is the *main* thread for the process's whole lifetime, and
/// its exit ends the process.
pub struct Process {
    space: AddressSpace,
    threads: Vec<Thread>,
    /// Next free virtual address for a new thread's stack. Advances
    /// monotonically, so stack ranges can never collide.
    stack_cursor: VirtAddr,
    /// Low 8 bits of the main thread's return value, set on exit.
    return_code: Option<u8>,
}

impl Process {
    pub(crate) const fn new(space: AddressSpace) -> Self {
        Self {
            space,
            threads: Vec::new(),
            stack_cursor: VirtAddr::new(THREAD_STACK_BASE),
            return_code: None,
        }
    }

    #[must_use]
    pub const fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub(crate) const fn space_mut(&mut self) -> &mut AddressSpace {
        &mut self.space
    }

    #[must_use]
    pub fn thread(&self, index: usize) -> Option<&Thread> {
        self.threads.get(index)
    }

    pub(crate) fn thread_mut(&mut self, index: usize) -> Option<&mut Thread> {
        self.threads.get_mut(index)
    }

    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub(crate) fn threads_mut(&mut self) -> &mut [Thread] {
        &mut self.threads
    }

    /// The thread whose exit ends the process.
    #[must_use]
    pub fn main_thread(&self) -> Option<&Thread> {
        self.threads.first()
    }

    /// Set once the main thread has exited.
    #[must_use]
    pub const fn return_code(&self) -> Option<u8> {
        self.return_code
    }

    pub(crate) const fn set_return_code(&mut self, code: u8) {
        self.return_code = Some(code);
    }

    /// Whether the main thread has exited.
    #[must_use]
    pub const fn exited(&self) -> bool {
        self.return_code.is_some()
    }

    pub(crate) fn push_thread(&mut self, thread: Thread) -> usize {
        self.threads.push(thread);
        self.threads.len() - 1
    }

    /// Reserves the virtual range for the next thread stack and moves
    /// the cursor past it plus an unmapped guard gap.
    pub(crate) const fn reserve_stack_range(&mut self) -> VirtAddr {
        let base = self.stack_cursor;
        self.stack_cursor = VirtAddr::new(base.as_u64() + THREAD_STACK_SIZE + THREAD_STACK_GUARD);
        base
    }
}
