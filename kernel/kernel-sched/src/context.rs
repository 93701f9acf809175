use kernel_vmem::VirtAddr;

/// Initial RFLAGS image for a new thread: interrupts enabled (IF),
/// reserved bit 1 set.
const DEFAULT_RFLAGS: u64 = 0x202;

/// Saved register snapshot of a suspended thread.
///
/// Layout is fixed (`repr(C)`) because the context-switch stub in the
/// architecture layer loads and stores it field by field.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    /// First argument register of the SysV calling convention.
    pub rdi: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

impl Context {
    /// Fabricates the state of a thread that has "just been called":
    /// execution starts at `entry` with `arg` in RDI and an empty stack.
    #[must_use]
    pub fn first_call(entry: VirtAddr, arg: u64, stack_top: VirtAddr) -> Self {
        Self {
            rdi: arg,
            rip: entry.as_u64(),
            rsp: stack_top.as_u64(),
            rflags: DEFAULT_RFLAGS,
            ..Self::default()
        }
    }
}
