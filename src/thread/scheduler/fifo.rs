//! A first-in-first-out thread queue.
//!
//! [`Fifo`] ignores priorities altogether: waiters are served in the order
//! they arrived and nobody donates anything. It is what a [`Lock`] falls back
//! to when no [`Scheduler`] is around, and a baseline to compare the
//! donation queues against.
//!
//! [`Lock`]: crate::sync::Lock
//! [`Scheduler`]: super::Scheduler

use super::{ThreadQueue, assert_guarded};
use crate::{sync::SpinLock, thread::ThreadHandle};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

#[derive(Default)]
struct FifoState {
    waiters: VecDeque<ThreadHandle>,
    owners: BTreeSet<ThreadHandle>,
}

/// A round-robin queue without donation.
#[derive(Default)]
pub struct Fifo {
    state: SpinLock<FifoState>,
}

impl Fifo {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FifoState) -> R) -> R {
        let mut guard = self.state.lock();
        let result = f(&mut *guard);
        guard.unlock();
        result
    }

    /// Waiting threads in arrival order.
    pub fn waiters(&self) -> Vec<ThreadHandle> {
        self.with_state(|state| state.waiters.iter().copied().collect())
    }

    /// Current owners.
    pub fn owners(&self) -> Vec<ThreadHandle> {
        self.with_state(|state| state.owners.iter().copied().collect())
    }
}

impl ThreadQueue for Fifo {
    #[track_caller]
    fn wait_for_access(&self, thread: ThreadHandle) {
        assert_guarded();
        self.with_state(|state| {
            assert!(
                !state.waiters.contains(&thread),
                "{thread} is already waiting"
            );
            state.waiters.push_back(thread);
        });
    }

    #[track_caller]
    fn acquire(&self, thread: ThreadHandle) {
        assert_guarded();
        self.with_state(|state| {
            state.owners.insert(thread);
        });
    }

    #[track_caller]
    fn next_thread(&self) -> Option<ThreadHandle> {
        assert_guarded();
        self.with_state(|state| {
            state.owners.clear();
            let next = state.waiters.pop_front()?;
            state.owners.insert(next);
            debug!(winner = %next, remaining = state.waiters.len(), "fifo next thread");
            Some(next)
        })
    }

    #[track_caller]
    fn release(&self, thread: ThreadHandle) -> bool {
        assert_guarded();
        self.with_state(|state| state.owners.remove(&thread))
    }

    #[track_caller]
    fn cancel(&self, thread: ThreadHandle) -> bool {
        assert_guarded();
        self.with_state(|state| {
            let Some(index) = state.waiters.iter().position(|waiter| *waiter == thread) else {
                return false;
            };
            state.waiters.remove(index);
            true
        })
    }

    fn is_empty(&self) -> bool {
        self.with_state(|state| state.waiters.is_empty())
    }
}
