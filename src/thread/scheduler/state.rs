//! Scheduler bookkeeping and the donation engine.
//!
//! All scheduler state lives in one [`Inner`] value behind the scheduler's
//! spinlock:
//!
//! - a side table from [`ThreadHandle`] to [`ThreadState`], filled lazily the
//!   first time a thread interacts with the scheduler, and
//! - an arena of [`QueueState`]s indexed by [`QueueId`].
//!
//! The two sides reference each other only by index. A thread records the
//! queues it waits in and the queues it owns; a queue records its waiters
//! (with their arrival number) and its owners. Every operation that changes
//! one side updates the other before it returns.
//!
//! ## Donation
//!
//! A donation edge runs from a waiter of a donation-enabled queue to every
//! owner of that queue. The effective value of a thread is its own value
//! combined with the donation of each donation-enabled queue it owns, where
//! a queue donates the fold of its waiters' effective values. The [`Policy`]
//! decides what "combine" and "fold" mean.
//!
//! A change at one thread can only influence threads downstream of it along
//! donation edges. Two propagation modes are available, see [`Propagation`].

use super::{Candidate, Policy};
use crate::{config::Propagation, thread::ThreadHandle};
use slab::Slab;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};
use tracing::{debug, trace, warn};

/// Index of a queue in the scheduler's queue arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct QueueId(pub(crate) usize);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Per-thread scheduling record.
#[derive(Debug)]
pub(crate) struct ThreadState {
    pub(crate) base: u32,
    /// Cached effective priority, or ticket count under the lottery policy.
    pub(crate) effective: u64,
    pub(crate) waiting_in: BTreeSet<QueueId>,
    pub(crate) owns: BTreeSet<QueueId>,
}

impl ThreadState {
    fn new<P: Policy>() -> Self {
        Self {
            base: P::PRIORITY_DEFAULT,
            effective: P::own(P::PRIORITY_DEFAULT),
            waiting_in: BTreeSet::new(),
            owns: BTreeSet::new(),
        }
    }
}

/// A pending wait of one thread on one queue.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WaitEntry {
    pub(crate) thread: ThreadHandle,
    pub(crate) arrival: u64,
}

#[derive(Debug)]
pub(crate) struct QueueState {
    pub(crate) donation: bool,
    /// Kept in arrival order.
    pub(crate) waiters: Vec<WaitEntry>,
    pub(crate) owners: BTreeSet<ThreadHandle>,
}

impl QueueState {
    fn position(&self, thread: ThreadHandle) -> Option<usize> {
        self.waiters.iter().position(|entry| entry.thread == thread)
    }
}

pub(crate) struct Inner<P: Policy> {
    policy: P,
    propagation: Propagation,
    threads: BTreeMap<ThreadHandle, ThreadState>,
    queues: Slab<QueueState>,
    arrivals: u64,
}

impl<P: Policy> Inner<P> {
    pub(crate) fn new(policy: P, propagation: Propagation) -> Self {
        Self {
            policy,
            propagation,
            threads: BTreeMap::new(),
            queues: Slab::new(),
            arrivals: 0,
        }
    }

    fn state(&mut self, thread: ThreadHandle) -> &mut ThreadState {
        self.threads.entry(thread).or_insert_with(ThreadState::new::<P>)
    }

    fn queue(&self, id: QueueId) -> &QueueState {
        self.queues
            .get(id.0)
            .unwrap_or_else(|| panic!("queue {id} does not exist"))
    }

    fn queue_mut(&mut self, id: QueueId) -> &mut QueueState {
        self.queues
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("queue {id} does not exist"))
    }

    pub(crate) fn base(&self, thread: ThreadHandle) -> u32 {
        self.threads
            .get(&thread)
            .map_or(P::PRIORITY_DEFAULT, |state| state.base)
    }

    pub(crate) fn effective(&self, thread: ThreadHandle) -> u64 {
        self.threads
            .get(&thread)
            .map_or_else(|| P::own(P::PRIORITY_DEFAULT), |state| state.effective)
    }

    /// Fold of the cached effective values of `id`'s waiters.
    pub(crate) fn donation(&self, id: QueueId) -> u64 {
        P::donation(
            self.queue(id)
                .waiters
                .iter()
                .map(|entry| self.effective(entry.thread)),
        )
    }

    pub(crate) fn waiters(&self, id: QueueId) -> Vec<ThreadHandle> {
        self.queue(id).waiters.iter().map(|entry| entry.thread).collect()
    }

    pub(crate) fn owners(&self, id: QueueId) -> Vec<ThreadHandle> {
        self.queue(id).owners.iter().copied().collect()
    }

    pub(crate) fn waiting_in(&self, thread: ThreadHandle) -> Vec<QueueId> {
        self.threads
            .get(&thread)
            .map(|state| state.waiting_in.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn owned_by(&self, thread: ThreadHandle) -> Vec<QueueId> {
        self.threads
            .get(&thread)
            .map(|state| state.owns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn new_queue(&mut self, donation: bool) -> QueueId {
        let id = QueueId(self.queues.insert(QueueState {
            donation,
            waiters: Vec::new(),
            owners: BTreeSet::new(),
        }));
        debug!(queue = %id, donation, policy = P::NAME, "new queue");
        id
    }

    pub(crate) fn set_priority(&mut self, thread: ThreadHandle, priority: u32) {
        let state = self.state(thread);
        if state.base == priority {
            return;
        }
        debug!(%thread, from = state.base, to = priority, "set priority");
        state.base = priority;
        self.refresh([thread]);
    }

    pub(crate) fn wait_for_access(&mut self, id: QueueId, thread: ThreadHandle) {
        let queue = self.queue(id);
        assert!(
            queue.position(thread).is_none(),
            "{thread} is already waiting on {id}"
        );
        assert!(
            !queue.owners.contains(&thread),
            "{thread} waits on {id} which it already owns"
        );

        self.arrivals += 1;
        let arrival = self.arrivals;
        let queue = self.queue_mut(id);
        queue.waiters.push(WaitEntry { thread, arrival });
        let donation = queue.donation;
        self.state(thread).waiting_in.insert(id);
        debug!(queue = %id, %thread, arrival, "wait for access");

        if !donation {
            return;
        }
        let owners = self.owners(id);
        match self.propagation {
            Propagation::Eager => self.refresh_eager(owners),
            Propagation::Lazy => {
                let value = self.effective(thread);
                self.check_owners_lazy(id, value, &mut Vec::new());
            }
        }
    }

    pub(crate) fn acquire(&mut self, id: QueueId, thread: ThreadHandle) {
        let queue = self.queue(id);
        assert!(
            queue.position(thread).is_none(),
            "{thread} acquires {id} while still waiting on it"
        );

        let queue = self.queue_mut(id);
        queue.owners.insert(thread);
        let boosted = queue.donation && !queue.waiters.is_empty();
        self.state(thread).owns.insert(id);
        debug!(queue = %id, %thread, "acquire");

        if boosted {
            self.refresh([thread]);
        }
    }

    pub(crate) fn next_thread(&mut self, id: QueueId) -> Option<ThreadHandle> {
        let candidates = self
            .queue(id)
            .waiters
            .iter()
            .map(|entry| Candidate {
                thread: entry.thread,
                arrival: entry.arrival,
                value: self.effective(entry.thread),
            })
            .collect::<Vec<_>>();

        // The previous owners give up the resource whether or not there is
        // somebody to hand it to.
        let queue = self.queue_mut(id);
        let donation = queue.donation;
        let previous = std::mem::take(&mut queue.owners);
        for owner in previous.iter() {
            self.state(*owner).owns.remove(&id);
        }

        if candidates.is_empty() {
            debug!(queue = %id, released = previous.len(), "next thread: queue is empty");
            if donation {
                self.refresh(previous);
            }
            return None;
        }

        let index = self.policy.select(&candidates);
        assert!(
            index < candidates.len(),
            "{} policy selected waiter #{index} out of {}",
            P::NAME,
            candidates.len()
        );
        let winner = self.queue_mut(id).waiters.remove(index).thread;
        self.state(winner).waiting_in.remove(&id);
        debug!(
            queue = %id,
            %winner,
            value = candidates[index].value,
            remaining = candidates.len() - 1,
            "next thread"
        );

        if donation {
            self.refresh(previous);
        }
        self.acquire(id, winner);
        Some(winner)
    }

    pub(crate) fn cancel(&mut self, id: QueueId, thread: ThreadHandle) -> bool {
        let queue = self.queue_mut(id);
        let Some(index) = queue.position(thread) else {
            return false;
        };
        queue.waiters.remove(index);
        let donation = queue.donation;
        self.state(thread).waiting_in.remove(&id);
        debug!(queue = %id, %thread, "cancel wait");

        if donation {
            let owners = self.owners(id);
            self.refresh(owners);
        }
        true
    }

    pub(crate) fn release(&mut self, id: QueueId, thread: ThreadHandle) -> bool {
        let queue = self.queue_mut(id);
        if !queue.owners.remove(&thread) {
            return false;
        }
        let donation = queue.donation;
        self.state(thread).owns.remove(&id);
        debug!(queue = %id, %thread, "release");

        if donation {
            self.refresh([thread]);
        }
        true
    }

    pub(crate) fn remove_thread(&mut self, thread: ThreadHandle) {
        let Some(state) = self.threads.get(&thread) else {
            return;
        };
        let waiting_in = state.waiting_in.iter().copied().collect::<Vec<_>>();
        let owns = state.owns.iter().copied().collect::<Vec<_>>();
        for id in waiting_in {
            self.cancel(id, thread);
        }
        for id in owns {
            self.release(id, thread);
        }
        self.threads.remove(&thread);
        debug!(%thread, "thread removed");
    }

    /// Remove queue `id`, detaching its waiters and owners.
    ///
    /// The owners are only recomputed if `recompute` is set; a queue dropped
    /// while unwinding leaves them as they are.
    pub(crate) fn drop_queue(&mut self, id: QueueId, recompute: bool) {
        let queue = self.queues.remove(id.0);
        if !queue.waiters.is_empty() {
            warn!(queue = %id, waiters = queue.waiters.len(), "queue dropped with waiters");
        }
        for entry in queue.waiters.iter() {
            self.state(entry.thread).waiting_in.remove(&id);
        }
        for owner in queue.owners.iter() {
            self.state(*owner).owns.remove(&id);
        }
        if recompute && queue.donation && !queue.waiters.is_empty() {
            self.refresh(queue.owners);
        }
        debug!(queue = %id, "queue dropped");
    }

    /// Bring the effective values downstream of `seeds` up to date.
    fn refresh(&mut self, seeds: impl IntoIterator<Item = ThreadHandle>) {
        match self.propagation {
            Propagation::Eager => self.refresh_eager(seeds),
            Propagation::Lazy => {
                for thread in seeds {
                    self.refresh_lazy(thread, &mut Vec::new());
                }
            }
        }
    }

    /// Recompute every thread reachable from `seeds` along donation edges.
    fn refresh_eager(&mut self, seeds: impl IntoIterator<Item = ThreadHandle>) {
        let mut affected = BTreeSet::new();
        let mut pending = seeds.into_iter().collect::<Vec<_>>();
        while let Some(thread) = pending.pop() {
            if !affected.insert(thread) {
                continue;
            }
            if let Some(state) = self.threads.get(&thread) {
                for id in state.waiting_in.iter() {
                    let queue = self.queue(*id);
                    if queue.donation {
                        pending.extend(queue.owners.iter().copied());
                    }
                }
            }
        }

        let mut done = BTreeMap::new();
        let mut visiting = BTreeSet::new();
        for thread in affected.iter() {
            self.evaluate(*thread, &affected, &mut done, &mut visiting);
        }
        for (thread, value) in done {
            let state = self.state(thread);
            if state.effective != value {
                trace!(%thread, from = state.effective, to = value, "effective value");
                state.effective = value;
            }
        }
    }

    /// Effective value of `thread`, recomputed from scratch if it is affected.
    fn evaluate(
        &self,
        thread: ThreadHandle,
        affected: &BTreeSet<ThreadHandle>,
        done: &mut BTreeMap<ThreadHandle, u64>,
        visiting: &mut BTreeSet<ThreadHandle>,
    ) -> u64 {
        if !affected.contains(&thread) {
            return self.effective(thread);
        }
        if let Some(value) = done.get(&thread) {
            return *value;
        }
        assert!(visiting.insert(thread), "donation cycle through {thread}");

        let value = match self.threads.get(&thread) {
            Some(state) => {
                let mut value = P::own(state.base);
                for id in state.owns.iter() {
                    let queue = self.queue(*id);
                    if !queue.donation {
                        continue;
                    }
                    let mut waiters = Vec::with_capacity(queue.waiters.len());
                    for entry in queue.waiters.iter() {
                        waiters.push(self.evaluate(entry.thread, affected, done, visiting));
                    }
                    value = P::combine(value, P::donation(waiters.into_iter()));
                }
                value
            }
            None => P::own(P::PRIORITY_DEFAULT),
        };

        visiting.remove(&thread);
        done.insert(thread, value);
        value
    }

    /// Effective value of `thread` from its base and the cached values of the
    /// waiters on the queues it owns.
    fn compute_cached(&self, thread: ThreadHandle) -> u64 {
        let Some(state) = self.threads.get(&thread) else {
            return P::own(P::PRIORITY_DEFAULT);
        };
        state
            .owns
            .iter()
            .filter(|id| self.queue(**id).donation)
            .fold(P::own(state.base), |value, id| {
                P::combine(value, self.donation(*id))
            })
    }

    /// Recompute `thread` and walk on only if the policy says the change
    /// matters to the owners it donates to.
    fn refresh_lazy(&mut self, thread: ThreadHandle, path: &mut Vec<ThreadHandle>) {
        assert!(!path.contains(&thread), "donation cycle through {thread}");
        let previous = self.effective(thread);
        let next = self.compute_cached(thread);
        self.state(thread).effective = next;
        if previous != next {
            trace!(%thread, from = previous, to = next, "effective value");
        }
        if !P::propagates(previous, next) {
            return;
        }

        path.push(thread);
        for id in self.waiting_in(thread) {
            if self.queue(id).donation {
                self.check_owners_lazy(id, next, path);
            }
        }
        path.pop();
    }

    fn check_owners_lazy(&mut self, id: QueueId, value: u64, path: &mut Vec<ThreadHandle>) {
        for owner in self.owners(id) {
            if P::owner_is_stale(value, self.effective(owner)) {
                self.refresh_lazy(owner, path);
            }
        }
    }
}
