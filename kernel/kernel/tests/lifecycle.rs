//! End-to-end exercise of the kernel state object against simulated
//! physical memory: boot, direct map, frame service, and the full
//! thread lifecycle from spawn to process exit.

use kernel::Kernel;
use kernel_info::memory::{HHDM_BASE, PAGE_SIZE, THREAD_STACK_SIZE};
use kernel_sched::{BlockReason, Switch, ThreadRef, ThreadState};
use kernel_simphys::SimPhys;
use kernel_vmem::{MapFlags, PageSize, VirtAddr};

const ENTRY: VirtAddr = VirtAddr::new(0x40_0000);
const STACK_PAGES: usize = (THREAD_STACK_SIZE / PAGE_SIZE) as usize;

fn next_of(switch: Switch) -> ThreadRef {
    match switch {
        Switch::To { next, .. } => next,
        Switch::Idle { .. } => panic!("expected a thread to run, core went idle"),
    }
}

#[test]
fn boot_builds_the_direct_map() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    // physical 0x1000 is reachable at HHDM_BASE + 0x1000
    let pa = k
        .translate_kernel(VirtAddr::new(HHDM_BASE + 0x1000))
        .unwrap();
    assert_eq!(pa.as_u64(), 0x1000);
    // and nothing below the direct map is mapped
    assert!(k.translate_kernel(VirtAddr::new(0x1000)).is_none());
}

#[test]
fn frame_service_allocates_zeroed_and_reclaims() {
    let sim = SimPhys::new(128);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    let free = k.free_frames();
    let pa = k.frame_allocz(4).unwrap();
    assert_eq!(k.free_frames(), free - 4);
    for off in 0..4 * PAGE_SIZE {
        assert_eq!(sim.byte(pa.as_u64() + off), 0);
    }
    k.frame_free(pa, 4);
    assert_eq!(k.free_frames(), free);
}

#[test]
fn kernel_pages_can_be_mapped_and_unmapped() {
    let sim = SimPhys::new(128);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    let pa = k.frame_alloc(1).unwrap();
    let va = VirtAddr::new(0xffff_a000_0000_0000);
    k.map_kernel_page(va, pa, PageSize::Size4K, MapFlags::WRITABLE | MapFlags::NO_EXECUTE)
        .unwrap();
    assert_eq!(k.translate_kernel(va), Some(pa));

    let got = k.unmap_kernel_page(va).unwrap();
    assert_eq!(got, pa);
    assert!(k.translate_kernel(va).is_none());
    k.frame_free(pa, 1);
}

#[test]
fn threads_share_a_core_round_robin() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    let a = k.spawn_process(ENTRY, 0).unwrap();
    assert_eq!(next_of(k.timer_tick(0)), a);
    let b = k.spawn_thread(0, ENTRY, 1).unwrap();
    let c = k.spawn_thread(0, ENTRY, 2).unwrap();

    let picks: Vec<ThreadRef> = (0..6).map(|_| next_of(k.timer_tick(0))).collect();
    assert_eq!(picks, [b, c, a, b, c, a]);
}

#[test]
fn sleep_suspends_for_at_least_the_requested_ticks() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    let a = k.spawn_process(ENTRY, 0).unwrap();
    assert_eq!(next_of(k.timer_tick(0)), a);

    assert!(matches!(k.sleep_current(0, 2), Switch::Idle { .. }));
    assert!(matches!(k.timer_tick(0), Switch::Idle { .. }));
    assert_eq!(next_of(k.timer_tick(0)), a);
}

#[test]
fn waiting_thread_wakes_when_its_target_exits() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    let a = k.spawn_process(ENTRY, 0).unwrap();
    assert_eq!(next_of(k.timer_tick(0)), a);
    let b = k.spawn_thread(0, ENTRY, 0).unwrap();
    let id_b = k.with_scheduler(|s| s.thread(b).unwrap().id());

    assert_eq!(next_of(k.block_current(0, BlockReason::Waiting(id_b))), b);
    assert_eq!(next_of(k.exit_current(0, 9)), a);
    k.with_scheduler(|s| {
        assert_eq!(s.thread(b).unwrap().state(), ThreadState::Terminated);
        assert_eq!(s.thread(b).unwrap().return_value(), 9);
    });
}

#[test]
fn main_exit_ends_the_process_and_returns_the_stacks() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    let a = k.spawn_process(ENTRY, 0).unwrap();
    assert_eq!(next_of(k.timer_tick(0)), a);
    let b = k.spawn_thread(0, ENTRY, 0).unwrap();
    let free_before_exit = k.free_frames();

    assert!(matches!(k.exit_current(0, 300), Switch::Idle { .. }));

    assert_eq!(k.process_return_code(0), Some(44));
    k.with_scheduler(|s| {
        assert_eq!(s.thread(a).unwrap().state(), ThreadState::Terminated);
        assert_eq!(s.thread(b).unwrap().state(), ThreadState::Terminated);
    });
    // both stacks come back; page tables stay with the address space
    assert_eq!(k.free_frames(), free_before_exit + 2 * STACK_PAGES);
}

#[test]
fn killed_thread_never_runs_past_its_checkpoint() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 1, &map, &[]).unwrap();

    let a = k.spawn_process(ENTRY, 0).unwrap();
    assert_eq!(next_of(k.timer_tick(0)), a);
    let b = k.spawn_thread(0, ENTRY, 0).unwrap();

    k.kill(b);
    // a blocks; b is picked, then exits at its own sleep checkpoint
    let id_b = k.with_scheduler(|s| s.thread(b).unwrap().id());
    assert_eq!(next_of(k.block_current(0, BlockReason::Waiting(id_b))), b);
    let sw = k.sleep_current(0, 5);
    // b's exit woke a
    assert_eq!(next_of(sw), a);
    k.with_scheduler(|s| {
        assert_eq!(s.thread(b).unwrap().state(), ThreadState::Terminated);
    });
}

#[test]
fn two_cores_run_independent_processes() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 2, &map, &[]).unwrap();

    let a = k.spawn_process(ENTRY, 0).unwrap();
    let b = k.spawn_process(ENTRY, 0).unwrap();

    assert_eq!(next_of(k.timer_tick(0)), a);
    assert_eq!(next_of(k.preempt(1)), b);
    assert_eq!(k.current(0), Some(a));
    assert_eq!(k.current(1), Some(b));
    // the global tick is owned by the boot core
    assert_eq!(k.ticks(), 1);
}

#[test]
fn teardown_from_another_core_keeps_terminated_absorbing() {
    let sim = SimPhys::new(256);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, 2, &map, &[]).unwrap();

    let a = k.spawn_process(ENTRY, 0).unwrap();
    assert_eq!(next_of(k.timer_tick(0)), a);
    let b = k.spawn_thread(0, ENTRY, 0).unwrap();
    assert_eq!(next_of(k.preempt(1)), b);

    // main exits on core 0 while the sibling still runs on core 1
    assert!(matches!(k.exit_current(0, 300), Switch::Idle { .. }));
    assert_eq!(k.process_return_code(0), Some(44));

    // the sibling's next checkpoint on core 1 retires it and frees its
    // stack there; the state never leaves Terminated
    assert!(matches!(
        k.block_current(1, BlockReason::Sleeping),
        Switch::Idle { .. }
    ));
    k.with_scheduler(|s| {
        assert_eq!(s.thread(b).unwrap().state(), ThreadState::Terminated);
        assert!(s.thread(b).unwrap().stack().is_none());
    });
    k.unblock(b);
    k.with_scheduler(|s| {
        assert_eq!(s.thread(b).unwrap().state(), ThreadState::Terminated);
    });
}

#[test]
fn concurrent_spawns_issue_unique_ids() {
    const WORKERS: usize = 4;
    const SPAWNS: usize = 8;

    let sim = SimPhys::new(1024);
    let map = sim.usable_map();
    let k = Kernel::init(&sim, WORKERS, &map, &[]).unwrap();
    let barrier = std::sync::Barrier::new(WORKERS);

    std::thread::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..SPAWNS {
                    k.spawn_process(ENTRY, 0).unwrap();
                }
            });
        }
    });

    let mut ids: Vec<u64> = k.with_scheduler(|s| {
        (0..WORKERS * SPAWNS)
            .map(|p| s.process(p).unwrap().main_thread().unwrap().id().as_u64())
            .collect()
    });
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), WORKERS * SPAWNS);
}
