//! # Memory Layout

/// Size of one physical frame and one virtual page, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel access
/// physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Base of the per-process thread stack area. Stacks are laid out
/// upwards from here by a per-process cursor.
pub const THREAD_STACK_BASE: u64 = 0xffff_9000_0000_0000;

/// The size of each thread's kernel stack.
pub const THREAD_STACK_SIZE: u64 = 32 * 1024;

/// Unmapped gap left between consecutive thread stacks so that an
/// overflow of one stack faults instead of corrupting the next.
pub const THREAD_STACK_GUARD: u64 = PAGE_SIZE;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(THREAD_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(THREAD_STACK_GUARD.is_multiple_of(PAGE_SIZE));
    assert!(THREAD_STACK_BASE > HHDM_BASE);
    assert!(THREAD_STACK_BASE.is_multiple_of(PAGE_SIZE));
};
