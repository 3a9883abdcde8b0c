//! Donation through joins.

mod common;

use common::init_test_logging;
use keos_sched::{
    interrupt::InterruptGuard,
    thread::{
        ThreadBuilder,
        scheduler::{LotteryScheduler, PriorityScheduler},
    },
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc,
};

fn wait_until(cond: impl Fn() -> bool) {
    while !cond() {
        std::thread::yield_now();
    }
}

/// Tests that a joiner lends its priority to the thread it joins.
///
/// This test ensures that:
/// - A priority 1 thread runs at 7 while a priority 7 thread joins it.
/// - The joiner wakes up with the exit code once the thread is done.
/// - The exited thread is forgotten by the scheduler.
#[test]
fn joiner_donates_to_child() {
    init_test_logging();

    let scheduler = PriorityScheduler::new();
    let release = Arc::new(AtomicBool::new(false));

    let child = ThreadBuilder::new("child");
    let child_tid = child.get_tid();
    {
        let _guard = InterruptGuard::new();
        scheduler.set_priority(child_tid, 3);
    }
    let child = {
        let release = release.clone();
        child.spawn_joinable(&scheduler, move || {
            wait_until(|| release.load(Ordering::SeqCst));
        })
    };

    let joiner = ThreadBuilder::new("joiner");
    let joiner_tid = joiner.get_tid();
    {
        let _guard = InterruptGuard::new();
        scheduler.set_priority(joiner_tid, 7);
    }
    let joiner = joiner.spawn(move || assert_eq!(child.join(), 0));
    wait_until(|| !scheduler.waiting_in(joiner_tid).is_empty());

    {
        let _guard = InterruptGuard::new();
        assert_eq!(scheduler.get_priority(child_tid), 3);
        assert_eq!(scheduler.get_effective_priority(child_tid), 7);
    }

    release.store(true, Ordering::SeqCst);
    assert_eq!(joiner.join(), 0);

    let _guard = InterruptGuard::new();
    assert!(scheduler.waiting_in(joiner_tid).is_empty());
    assert!(scheduler.owned_by(joiner_tid).is_empty());
    assert!(scheduler.owned_by(child_tid).is_empty());
    assert_eq!(scheduler.get_priority(child_tid), 1);
}

/// Tests that joins donate transitively across a lock.
///
/// The joined thread waits for a queue owned by a third thread; the joiner's
/// tickets must reach that owner too.
#[test]
fn join_donation_travels_on() {
    init_test_logging();

    let scheduler = LotteryScheduler::new();
    let lock = scheduler.new_queue(true);
    let holder = keos_sched::thread::ThreadHandle::fresh();
    let (tx, rx) = mpsc::channel::<()>();

    let child = ThreadBuilder::new("child");
    let child_tid = child.get_tid();
    {
        let _guard = InterruptGuard::new();
        lock.acquire(holder);
        lock.wait_for_access(child_tid);
    }
    let child = child.spawn_joinable(&scheduler, move || {
        let _ = rx.recv();
    });

    let joiner = ThreadBuilder::new("joiner");
    let joiner_tid = joiner.get_tid();
    {
        let _guard = InterruptGuard::new();
        scheduler.set_priority(joiner_tid, 50);
    }
    let joiner = joiner.spawn(move || assert_eq!(child.join(), 0));
    wait_until(|| !scheduler.waiting_in(joiner_tid).is_empty());

    {
        let _guard = InterruptGuard::new();
        assert_eq!(scheduler.get_effective_priority(child_tid), 51);
        assert_eq!(scheduler.get_effective_priority(holder), 52);
    }

    drop(tx);
    assert_eq!(joiner.join(), 0);

    // Exiting cancelled the child's wait on the lock.
    assert!(lock.waiters().is_empty());
    let _guard = InterruptGuard::new();
    assert_eq!(scheduler.get_effective_priority(holder), 1);
}

/// Tests joining a thread that is already gone, and one that panicked.
#[test]
fn join_after_exit_and_panic() {
    init_test_logging();

    let scheduler = PriorityScheduler::new();

    let quick = ThreadBuilder::new("quick");
    let quick_tid = quick.get_tid();
    let quick = quick.spawn_joinable(&scheduler, || {});
    wait_until(|| scheduler.owned_by(quick_tid).is_empty());
    assert_eq!(quick.join(), 0);

    let boom = ThreadBuilder::new("boom").spawn_joinable(&scheduler, || panic!("boom"));
    assert_eq!(boom.join(), -1);
    assert!(scheduler.owned_by(keos_sched::thread::current()).is_empty());
}
