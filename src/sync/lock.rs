//! # Sleeping lock.
//!
//! A [`Lock`] lets **only one thread at a time** into a critical section.
//! Unlike the [`SpinLock`], a thread that finds the lock taken goes to sleep
//! with [`Current::park_with`] instead of spinning.
//!
//! Who gets the lock next is not decided by the lock itself but by the
//! [`ThreadQueue`] it is built on:
//!
//! - with a [`Fifo`], waiters are served in arrival order;
//! - with a [`WaitQueue`] created with donation enabled, the holder runs with
//!   the priority of its most urgent waiter (or with all of their tickets),
//!   and the lock is handed to the waiter the policy selects.
//!
//! The lock never hands itself to a sleeping thread "later": on
//! [`LockGuard::unlock`], the next owner is picked, recorded as holder and
//! woken up, in this order. A woken thread therefore already holds the lock.
//!
//! The lock state spinlock is always taken before the scheduler's, never the
//! other way around.
//!
//! [`Fifo`]: crate::thread::scheduler::Fifo
//! [`WaitQueue`]: crate::thread::scheduler::WaitQueue

use super::SpinLock;
use crate::thread::{self, Current, ParkHandle, ThreadHandle, scheduler::ThreadQueue};
use std::{collections::BTreeMap, fmt, marker::PhantomData, mem::ManuallyDrop};
use tracing::trace;

#[derive(Default)]
struct LockState {
    holder: Option<ThreadHandle>,
    parked: BTreeMap<ThreadHandle, ParkHandle>,
}

/// A sleeping mutual exclusion lock ordered by a [`ThreadQueue`].
///
/// # Examples
///
/// ```
/// use keos_sched::sync::Lock;
/// use keos_sched::thread::scheduler::PriorityScheduler;
///
/// let scheduler = PriorityScheduler::new();
/// let lock = Lock::new(scheduler.new_queue(true));
///
/// let guard = lock.lock();
/// assert_eq!(lock.holder(), Some(keos_sched::thread::current()));
/// // the lock must be "explicitly" unlocked.
/// guard.unlock();
/// assert_eq!(lock.holder(), None);
/// ```
pub struct Lock<Q: ThreadQueue> {
    queue: Q,
    state: SpinLock<LockState>,
}

impl<Q: ThreadQueue> Lock<Q> {
    /// Creates a new lock in an unlocked state, ordered by `queue`.
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            state: SpinLock::new(LockState::default()),
        }
    }

    /// The queue ordering the waiters.
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// The thread holding the lock, if any.
    pub fn holder(&self) -> Option<ThreadHandle> {
        let state = self.state.lock();
        let holder = state.holder;
        state.unlock();
        holder
    }

    /// Acquires the lock, sleeping until it is available.
    ///
    /// # Panics
    /// Panics if the calling thread already holds the lock, or if it holds any
    /// spinlock (a thread cannot sleep with interrupts disabled).
    pub fn lock(&self) -> LockGuard<'_, Q> {
        let me = thread::current();
        let mut state = self.state.lock();
        let holder = state.holder;
        match holder {
            None => {
                self.queue.acquire(me);
                state.holder = Some(me);
                state.unlock();
            }
            Some(holder) => {
                assert_ne!(holder, me, "{me} locks a lock it already holds");
                trace!(thread = %me, %holder, "lock contended");
                Current::park_with(|handle| {
                    self.queue.wait_for_access(me);
                    state.parked.insert(me, handle);
                    state.unlock();
                });
            }
        }
        LockGuard {
            lock: self,
            holder: me,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire the lock without sleeping.
    ///
    /// Returns `None` if another thread holds it.
    pub fn try_lock(&self) -> Option<LockGuard<'_, Q>> {
        let me = thread::current();
        let mut state = self.state.lock();
        if state.holder.is_some() {
            state.unlock();
            return None;
        }
        self.queue.acquire(me);
        state.holder = Some(me);
        state.unlock();
        Some(LockGuard {
            lock: self,
            holder: me,
            _not_send: PhantomData,
        })
    }

    fn hand_off(&self, holder: ThreadHandle) {
        let mut state = self.state.lock();
        assert_eq!(
            state.holder,
            Some(holder),
            "{holder} unlocks a lock it does not hold"
        );
        match self.queue.next_thread() {
            Some(next) => {
                state.holder = Some(next);
                let handle = state
                    .parked
                    .remove(&next)
                    .unwrap_or_else(|| panic!("{next} was handed the lock without sleeping on it"));
                state.unlock();
                trace!(from = %holder, to = %next, "lock handed off");
                handle.unpark();
            }
            None => {
                state.holder = None;
                state.unlock();
            }
        }
    }
}

impl<Q: ThreadQueue + Default> Default for Lock<Q> {
    fn default() -> Self {
        Self::new(Q::default())
    }
}

impl<Q: ThreadQueue> fmt::Debug for Lock<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("holder", &self.holder())
            .finish_non_exhaustive()
    }
}

/// Proof of holding a [`Lock`].
///
/// The lock must be explicitly unlocked by [`unlock`]. Dropping the guard
/// otherwise panics, except while unwinding, where the lock is handed on so
/// the waiters are not stranded.
///
/// [`unlock`]: Self::unlock
pub struct LockGuard<'a, Q: ThreadQueue> {
    lock: &'a Lock<Q>,
    holder: ThreadHandle,
    _not_send: PhantomData<*const ()>,
}

impl<Q: ThreadQueue> LockGuard<'_, Q> {
    /// Releases the lock, waking up the waiter the queue picks next.
    pub fn unlock(self) {
        let this = ManuallyDrop::new(self);
        this.lock.hand_off(this.holder);
    }
}

impl<Q: ThreadQueue> Drop for LockGuard<'_, Q> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lock.hand_off(self.holder);
            return;
        }
        panic!("`.unlock()` must be explicitly called for LockGuard.");
    }
}
