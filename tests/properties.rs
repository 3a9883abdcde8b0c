//! Randomized operation sequences checked against a from-scratch model.

mod common;

use common::scheduler;
use keos_sched::{
    config::Propagation,
    interrupt::InterruptGuard,
    thread::{
        ThreadHandle,
        scheduler::{LotteryPolicy, Policy, PriorityPolicy, QueueId, Scheduler, WaitQueue},
    },
};
use proptest::prelude::*;
use std::{collections::BTreeSet, ops::RangeInclusive};

const THREADS: usize = 5;
const QUEUES: usize = 3;

#[derive(Clone, Debug)]
enum Op {
    Wait(usize, usize),
    Acquire(usize, usize),
    Next(usize),
    Cancel(usize, usize),
    Release(usize, usize),
    SetPriority(usize, u32),
    Remove(usize),
}

fn op(priorities: RangeInclusive<u32>) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..THREADS, 0..QUEUES).prop_map(|(t, q)| Op::Wait(t, q)),
        2 => (0..THREADS, 0..QUEUES).prop_map(|(t, q)| Op::Acquire(t, q)),
        3 => (0..QUEUES).prop_map(Op::Next),
        1 => (0..THREADS, 0..QUEUES).prop_map(|(t, q)| Op::Cancel(t, q)),
        1 => (0..THREADS, 0..QUEUES).prop_map(|(t, q)| Op::Release(t, q)),
        3 => (0..THREADS, priorities).prop_map(|(t, p)| Op::SetPriority(t, p)),
        1 => (0..THREADS).prop_map(Op::Remove),
    ]
}

/// How the model folds waiter values into an owner.
#[derive(Clone, Copy)]
enum Fold {
    Max,
    Sum,
}

struct World<P: Policy> {
    scheduler: Scheduler<P>,
    queues: Vec<WaitQueue<P>>,
    threads: [ThreadHandle; THREADS],
}

impl<P: Policy> World<P> {
    fn new(propagation: Propagation, donation: [bool; QUEUES]) -> Self {
        let scheduler = scheduler::<P>(propagation);
        let queues = donation
            .iter()
            .map(|donation| scheduler.new_queue(*donation))
            .collect();
        Self {
            scheduler,
            queues,
            threads: [(); THREADS].map(|_| ThreadHandle::fresh()),
        }
    }

    fn queue(&self, id: QueueId) -> &WaitQueue<P> {
        self.queues
            .iter()
            .find(|queue| queue.id() == id)
            .expect("queue of the world")
    }

    /// Owners `thread` donates to directly.
    fn donates_to(&self, thread: ThreadHandle) -> Vec<ThreadHandle> {
        self.scheduler
            .waiting_in(thread)
            .into_iter()
            .map(|id| self.queue(id))
            .filter(|queue| queue.donation_enabled())
            .flat_map(|queue| queue.owners())
            .collect()
    }

    fn reaches(&self, from: ThreadHandle, to: ThreadHandle) -> bool {
        let mut seen = BTreeSet::new();
        let mut pending = vec![from];
        while let Some(thread) = pending.pop() {
            if thread == to {
                return true;
            }
            if seen.insert(thread) {
                pending.extend(self.donates_to(thread));
            }
        }
        false
    }

    /// Apply `op` unless it is invalid or would close a donation cycle.
    fn apply(&self, op: &Op) {
        match *op {
            Op::Wait(t, q) => {
                let (thread, queue) = (self.threads[t], &self.queues[q]);
                if queue.waiters().contains(&thread) || queue.owners().contains(&thread) {
                    return;
                }
                if queue.donation_enabled()
                    && queue.owners().iter().any(|owner| self.reaches(*owner, thread))
                {
                    return;
                }
                queue.wait_for_access(thread);
            }
            Op::Acquire(t, q) => {
                let (thread, queue) = (self.threads[t], &self.queues[q]);
                if queue.waiters().contains(&thread) {
                    return;
                }
                if queue.donation_enabled()
                    && queue.waiters().iter().any(|waiter| self.reaches(thread, *waiter))
                {
                    return;
                }
                queue.acquire(thread);
            }
            Op::Next(q) => {
                let queue = &self.queues[q];
                let waiters = queue.waiters();
                if queue.donation_enabled()
                    && waiters
                        .iter()
                        .any(|w| waiters.iter().any(|v| v != w && self.reaches(*w, *v)))
                {
                    return;
                }
                let winner = queue.next_thread();
                assert_eq!(winner.is_some(), !waiters.is_empty());
                if let Some(winner) = winner {
                    assert!(waiters.contains(&winner));
                    assert_eq!(queue.owners(), vec![winner]);
                }
            }
            Op::Cancel(t, q) => {
                let thread = self.threads[t];
                let queue = &self.queues[q];
                let waiting = queue.waiters().contains(&thread);
                assert_eq!(queue.cancel(thread), waiting);
            }
            Op::Release(t, q) => {
                let thread = self.threads[t];
                let queue = &self.queues[q];
                let owning = queue.owners().contains(&thread);
                assert_eq!(queue.release(thread), owning);
            }
            Op::SetPriority(t, p) => self.scheduler.set_priority(self.threads[t], p),
            Op::Remove(t) => self.scheduler.remove_thread(self.threads[t]),
        }
    }

    /// Effective value of `thread` recomputed from base priorities only.
    fn model(&self, thread: ThreadHandle, fold: Fold) -> u64 {
        let base = self.scheduler.get_priority(thread);
        let mut value = match fold {
            Fold::Max => u64::from(base),
            Fold::Sum => u64::from(base.max(1)),
        };
        for id in self.scheduler.owned_by(thread) {
            let queue = self.queue(id);
            if !queue.donation_enabled() {
                continue;
            }
            let waiters = queue.waiters().into_iter().map(|w| self.model(w, fold));
            value = match fold {
                Fold::Max => waiters.fold(value, u64::max),
                Fold::Sum => waiters.fold(value, |sum, w| sum + w),
            };
        }
        value
    }

    /// Both sides of every waiter and owner relation agree.
    fn check_links(&self) {
        for queue in self.queues.iter() {
            for waiter in queue.waiters() {
                assert!(self.scheduler.waiting_in(waiter).contains(&queue.id()));
            }
            for owner in queue.owners() {
                assert!(self.scheduler.owned_by(owner).contains(&queue.id()));
                assert!(!queue.waiters().contains(&owner));
            }
        }
        for thread in self.threads {
            for id in self.scheduler.waiting_in(thread) {
                assert!(self.queue(id).waiters().contains(&thread));
            }
            for id in self.scheduler.owned_by(thread) {
                assert!(self.queue(id).owners().contains(&thread));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn eager_priority_matches_model(
        donation in prop::array::uniform3(any::<bool>()),
        ops in prop::collection::vec(op(0..=7), 1..48),
    ) {
        let world = World::<PriorityPolicy>::new(Propagation::Eager, donation);
        let _guard = InterruptGuard::new();
        for op in ops.iter() {
            world.apply(op);
            world.check_links();
            for thread in world.threads {
                let effective = world.scheduler.get_effective_priority(thread);
                prop_assert_eq!(effective, world.model(thread, Fold::Max));
                prop_assert!(effective >= u64::from(world.scheduler.get_priority(thread)));
            }
        }
    }

    #[test]
    fn lazy_priority_never_below_model(
        donation in prop::array::uniform3(any::<bool>()),
        ops in prop::collection::vec(op(0..=7), 1..48),
    ) {
        let world = World::<PriorityPolicy>::new(Propagation::Lazy, donation);
        let _guard = InterruptGuard::new();
        for op in ops.iter() {
            world.apply(op);
            world.check_links();
            for thread in world.threads {
                let effective = world.scheduler.get_effective_priority(thread);
                prop_assert!(effective >= world.model(thread, Fold::Max));
            }
        }
    }

    #[test]
    fn lottery_conserves_tickets(
        lazy in any::<bool>(),
        donation in prop::array::uniform3(any::<bool>()),
        ops in prop::collection::vec(op(0..=20), 1..48),
    ) {
        let propagation = if lazy { Propagation::Lazy } else { Propagation::Eager };
        let world = World::<LotteryPolicy>::new(propagation, donation);
        let _guard = InterruptGuard::new();
        for op in ops.iter() {
            world.apply(op);
            world.check_links();
            for thread in world.threads {
                prop_assert_eq!(
                    world.scheduler.get_effective_priority(thread),
                    world.model(thread, Fold::Sum)
                );
            }
            for queue in world.queues.iter() {
                let sum: u64 = queue
                    .waiters()
                    .into_iter()
                    .map(|w| world.scheduler.get_effective_priority(w))
                    .sum();
                prop_assert_eq!(queue.ticket_sum(), sum);
            }
        }
    }
}
