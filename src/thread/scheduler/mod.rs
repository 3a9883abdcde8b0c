//! Thread scheduler.
//!
//! A scheduler decides which of the threads waiting for a resource gets it
//! next. Every such decision goes through a *thread queue*: every [`Lock`]
//! has one, and so does every thread started with
//! [`ThreadBuilder::spawn_joinable`], for its joiners. A ready list is a queue
//! created without donation. A queue offers three operations, captured by
//! the [`ThreadQueue`] trait:
//!
//! - [`ThreadQueue::wait_for_access`] registers a thread that wants the
//!   resource. It never blocks; the caller parks afterwards.
//! - [`ThreadQueue::acquire`] records a thread as owner of the resource
//!   without waiting, e.g. because the resource was free.
//! - [`ThreadQueue::next_thread`] drops the current owners and hands the
//!   resource to the next waiter, which becomes the new owner.
//!
//! ## Priority donation
//!
//! Priority scheduling alone suffers from *priority inversion*: a low
//! priority thread holding a lock keeps a high priority thread waiting while
//! medium priority threads run. A queue created with donation enabled lends
//! the priority of its waiters to its owners, transitively: if the owner is
//! itself waiting on another donation queue, the boost travels on to that
//! queue's owners.
//!
//! How waiters are ordered and how their priorities are combined is the job
//! of a [`Policy`]. Two policies exist:
//!
//! | Policy             | Owner's value                                   | Next thread                          |
//! |--------------------|-------------------------------------------------|--------------------------------------|
//! | [`PriorityPolicy`] | max of its base and every waiter's priority     | highest priority, FIFO among equals  |
//! | [`LotteryPolicy`]  | its tickets plus the sum of all waiters' tickets | random draw weighted by tickets      |
//!
//! [`Scheduler<P>`] is the entry point: it creates [`WaitQueue<P>`]s and
//! reads or changes the base priority of threads.
//!
//! ## Exclusion
//!
//! Every scheduler operation must be called with interrupts disabled, i.e.
//! while holding an [`InterruptGuard`]. Violations panic.
//!
//! ```
//! use keos_sched::{interrupt::InterruptGuard, thread::ThreadHandle};
//! use keos_sched::thread::scheduler::PriorityScheduler;
//!
//! let scheduler = PriorityScheduler::new();
//! let lock = scheduler.new_queue(true);
//! let (holder, high) = (ThreadHandle::fresh(), ThreadHandle::fresh());
//!
//! let _guard = InterruptGuard::new();
//! scheduler.set_priority(high, 7);
//! lock.acquire(holder);
//! lock.wait_for_access(high);
//! assert_eq!(scheduler.get_effective_priority(holder), 7);
//! assert_eq!(lock.next_thread(), Some(high));
//! assert_eq!(scheduler.get_effective_priority(holder), 1);
//! ```
//!
//! [`InterruptGuard`]: crate::interrupt::InterruptGuard
//! [`Lock`]: crate::sync::Lock
//! [`ThreadBuilder::spawn_joinable`]: crate::thread::ThreadBuilder::spawn_joinable

mod fifo;
mod lottery;
mod priority;
mod state;

pub use fifo::Fifo;
pub use lottery::LotteryPolicy;
pub use priority::PriorityPolicy;
pub use state::QueueId;

use crate::{
    config::SchedulerConfig,
    error::SchedError,
    interrupt::InterruptGuard,
    sync::SpinLock,
    thread::{self, ThreadHandle},
};
use state::Inner;
use std::{fmt, sync::Arc};

/// Scheduler ordering threads by priority with max-based donation.
pub type PriorityScheduler = Scheduler<PriorityPolicy>;
/// Scheduler holding a lottery among tickets with additive donation.
pub type LotteryScheduler = Scheduler<LotteryPolicy>;

/// A trait for a queue of threads waiting for a resource.
///
/// Implementations must not block: registering a waiter only records it, and
/// suspending the waiter is the caller's business.
pub trait ThreadQueue: Send + Sync {
    /// Register `thread` as waiting for the resource guarded by this queue.
    fn wait_for_access(&self, thread: ThreadHandle);

    /// Record `thread` as an owner of the resource without waiting.
    fn acquire(&self, thread: ThreadHandle);

    /// Drop the current owners and hand the resource to the next waiter.
    ///
    /// # Returns
    ///
    /// The new owner, or `None` if nobody is waiting.
    fn next_thread(&self) -> Option<ThreadHandle>;

    /// Drop `thread` from the owners without handing the resource on.
    ///
    /// Returns `false` if `thread` did not own the resource.
    fn release(&self, thread: ThreadHandle) -> bool;

    /// Withdraw the pending wait of `thread`.
    ///
    /// Returns `false` if `thread` was not waiting.
    fn cancel(&self, thread: ThreadHandle) -> bool;

    /// Returns `true` if no thread is waiting.
    fn is_empty(&self) -> bool;
}

/// A waiter as seen by [`Policy::select`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// The waiting thread.
    pub thread: ThreadHandle,
    /// Scheduler-wide arrival number of the wait; smaller is earlier.
    pub arrival: u64,
    /// Effective priority (or ticket count) of the thread.
    pub value: u64,
}

/// Selection strategy and donation combinator of a [`WaitQueue`].
///
/// The donation side is a pair of folds. A queue *donates*
/// [`donation`](Self::donation) of its waiters' effective values, and a
/// thread's effective value is [`own`](Self::own) of its base priority
/// [`combine`](Self::combine)d with the donation of every donation-enabled
/// queue it owns.
pub trait Policy: Send + 'static {
    /// Name used in log records.
    const NAME: &'static str;
    /// The lowest base priority a thread can have.
    const PRIORITY_MIN: u32;
    /// The highest base priority a thread can have.
    const PRIORITY_MAX: u32;
    /// Base priority of a thread the scheduler has not seen before.
    const PRIORITY_DEFAULT: u32;

    /// Build the policy state from a configuration.
    fn from_config(config: &SchedulerConfig) -> Self;

    /// The value a thread with base priority `base` holds on its own.
    fn own(base: u32) -> u64;

    /// What a queue whose waiters hold `values` donates to its owners.
    fn donation(values: impl Iterator<Item = u64>) -> u64;

    /// Add the donation of one owned queue to a thread's value.
    fn combine(value: u64, donation: u64) -> u64;

    /// Under lazy propagation, whether a thread whose value went from
    /// `previous` to `next` must notify the owners it donates to.
    fn propagates(previous: u64, next: u64) -> bool;

    /// Under lazy propagation, whether an owner caching `owner` must be
    /// recomputed after one of its waiters reached `waiter`.
    fn owner_is_stale(waiter: u64, owner: u64) -> bool;

    /// Pick the next thread among `candidates`, given in arrival order.
    ///
    /// `candidates` is never empty. Returns an index into it.
    fn select(&mut self, candidates: &[Candidate]) -> usize;
}

#[track_caller]
fn assert_guarded() {
    assert!(
        InterruptGuard::is_guarded(),
        "scheduler called with interrupts enabled"
    );
}

/// The scheduler facade.
///
/// Cloning a scheduler yields another handle to the same state.
pub struct Scheduler<P: Policy> {
    inner: Arc<SpinLock<Inner<P>>>,
}

impl<P: Policy> Clone for Scheduler<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Policy> Default for Scheduler<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Policy> fmt::Debug for Scheduler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("policy", &P::NAME).finish()
    }
}

impl<P: Policy> Scheduler<P> {
    /// Create a scheduler with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler from `config`.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SpinLock::new(Inner::new(
                P::from_config(&config),
                config.propagation(),
            ))),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<P>) -> R) -> R {
        let mut guard = self.inner.lock();
        let result = f(&mut *guard);
        guard.unlock();
        result
    }

    /// Allocate a new, empty queue.
    ///
    /// If `donation` is `true`, waiters of the queue lend their priority (or
    /// tickets) to its owners.
    pub fn new_queue(&self, donation: bool) -> WaitQueue<P> {
        let id = self.with_inner(|inner| inner.new_queue(donation));
        WaitQueue {
            id,
            donation,
            inner: self.inner.clone(),
        }
    }

    /// Base priority of `thread`.
    #[track_caller]
    pub fn get_priority(&self, thread: ThreadHandle) -> u32 {
        assert_guarded();
        self.with_inner(|inner| inner.base(thread))
    }

    /// Effective priority of `thread`, including donations.
    ///
    /// Under the lottery policy this is the thread's ticket count.
    #[track_caller]
    pub fn get_effective_priority(&self, thread: ThreadHandle) -> u64 {
        assert_guarded();
        self.with_inner(|inner| inner.effective(thread))
    }

    /// Set the base priority of `thread` and propagate the change.
    ///
    /// # Panics
    /// Panics if `priority` lies outside
    /// [`PRIORITY_MIN`](Policy::PRIORITY_MIN)..=[`PRIORITY_MAX`](Policy::PRIORITY_MAX).
    #[track_caller]
    pub fn set_priority(&self, thread: ThreadHandle, priority: u32) {
        assert_guarded();
        assert!(
            (P::PRIORITY_MIN..=P::PRIORITY_MAX).contains(&priority),
            "priority {priority} is outside of [{}, {}]",
            P::PRIORITY_MIN,
            P::PRIORITY_MAX
        );
        self.with_inner(|inner| inner.set_priority(thread, priority));
    }

    /// Same as [`set_priority`](Self::set_priority), but reports an out of
    /// range priority as an error instead of panicking.
    #[track_caller]
    pub fn try_set_priority(&self, thread: ThreadHandle, priority: u32) -> Result<(), SchedError> {
        if !(P::PRIORITY_MIN..=P::PRIORITY_MAX).contains(&priority) {
            return Err(SchedError::PriorityOutOfRange {
                priority,
                min: P::PRIORITY_MIN,
                max: P::PRIORITY_MAX,
            });
        }
        self.set_priority(thread, priority);
        Ok(())
    }

    /// Raise the base priority of the calling thread by one.
    ///
    /// The read and the write happen in one critical section, so a concurrent
    /// [`set_priority`](Self::set_priority) is never lost.
    ///
    /// Returns `false` without doing anything if the priority is already at
    /// its maximum.
    pub fn increase_priority(&self) -> bool {
        let _guard = InterruptGuard::new();
        let thread = thread::current();
        self.with_inner(|inner| {
            let priority = inner.base(thread);
            if priority == P::PRIORITY_MAX {
                return false;
            }
            inner.set_priority(thread, priority + 1);
            true
        })
    }

    /// Lower the base priority of the calling thread by one.
    ///
    /// Returns `false` without doing anything if the priority is already at
    /// its minimum.
    pub fn decrease_priority(&self) -> bool {
        let _guard = InterruptGuard::new();
        let thread = thread::current();
        self.with_inner(|inner| {
            let priority = inner.base(thread);
            if priority == P::PRIORITY_MIN {
                return false;
            }
            inner.set_priority(thread, priority - 1);
            true
        })
    }

    /// Forget `thread`, e.g. because it exited.
    ///
    /// All of its pending waits are cancelled and all of the resources it owns
    /// are released, with the affected owners recomputed.
    #[track_caller]
    pub fn remove_thread(&self, thread: ThreadHandle) {
        assert_guarded();
        self.with_inner(|inner| inner.remove_thread(thread));
    }

    /// Queues `thread` currently waits on.
    pub fn waiting_in(&self, thread: ThreadHandle) -> Vec<QueueId> {
        self.with_inner(|inner| inner.waiting_in(thread))
    }

    /// Queues `thread` currently owns.
    pub fn owned_by(&self, thread: ThreadHandle) -> Vec<QueueId> {
        self.with_inner(|inner| inner.owned_by(thread))
    }
}

/// A queue of threads created by [`Scheduler::new_queue`].
///
/// The queue lives as long as the resource it guards. Dropping it cancels
/// the remaining waits and releases the remaining owners.
pub struct WaitQueue<P: Policy> {
    id: QueueId,
    donation: bool,
    inner: Arc<SpinLock<Inner<P>>>,
}

impl<P: Policy> WaitQueue<P> {
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<P>) -> R) -> R {
        let mut guard = self.inner.lock();
        let result = f(&mut *guard);
        guard.unlock();
        result
    }

    /// Identity of this queue in the scheduler.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Whether waiters donate to the owners.
    pub fn donation_enabled(&self) -> bool {
        self.donation
    }

    /// Register `thread` as waiting for this queue.
    ///
    /// With donation enabled, the owners are recomputed before this returns,
    /// so a boost is visible right away.
    ///
    /// # Panics
    /// Panics if `thread` already waits on or owns this queue.
    #[track_caller]
    pub fn wait_for_access(&self, thread: ThreadHandle) {
        assert_guarded();
        self.with_inner(|inner| inner.wait_for_access(self.id, thread));
    }

    /// Record `thread` as an owner of this queue.
    ///
    /// # Panics
    /// Panics if `thread` is waiting on this queue.
    #[track_caller]
    pub fn acquire(&self, thread: ThreadHandle) {
        assert_guarded();
        self.with_inner(|inner| inner.acquire(self.id, thread));
    }

    /// Drop the current owners and hand this queue to the next waiter.
    ///
    /// # Returns
    ///
    /// The new owner, or `None` if the queue is empty.
    #[track_caller]
    pub fn next_thread(&self) -> Option<ThreadHandle> {
        assert_guarded();
        self.with_inner(|inner| inner.next_thread(self.id))
    }

    /// Withdraw the pending wait of `thread`, recomputing the owners.
    #[track_caller]
    pub fn cancel(&self, thread: ThreadHandle) -> bool {
        assert_guarded();
        self.with_inner(|inner| inner.cancel(self.id, thread))
    }

    /// Drop `thread` from the owners, recomputing it.
    #[track_caller]
    pub fn release(&self, thread: ThreadHandle) -> bool {
        assert_guarded();
        self.with_inner(|inner| inner.release(self.id, thread))
    }

    /// What this queue donates to its owners right now.
    #[track_caller]
    pub fn donation(&self) -> u64 {
        assert_guarded();
        self.with_inner(|inner| inner.donation(self.id))
    }

    /// Waiting threads in arrival order.
    pub fn waiters(&self) -> Vec<ThreadHandle> {
        self.with_inner(|inner| inner.waiters(self.id))
    }

    /// Current owners.
    pub fn owners(&self) -> Vec<ThreadHandle> {
        self.with_inner(|inner| inner.owners(self.id))
    }

    /// Number of waiting threads.
    pub fn len(&self) -> usize {
        self.waiters().len()
    }

    /// Returns `true` if no thread is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl WaitQueue<PriorityPolicy> {
    /// Highest effective priority among the waiters, or
    /// [`PRIORITY_MIN`](PriorityPolicy::PRIORITY_MIN) if there are none.
    #[track_caller]
    pub fn max_waiter_priority(&self) -> u64 {
        self.donation()
    }
}

impl WaitQueue<LotteryPolicy> {
    /// Sum of the waiters' tickets.
    #[track_caller]
    pub fn ticket_sum(&self) -> u64 {
        self.donation()
    }
}

impl<P: Policy> fmt::Debug for WaitQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("id", &self.id)
            .field("policy", &P::NAME)
            .field("donation", &self.donation)
            .finish()
    }
}

impl<P: Policy> Drop for WaitQueue<P> {
    fn drop(&mut self) {
        let _guard = InterruptGuard::new();
        let recompute = !std::thread::panicking();
        self.with_inner(|inner| inner.drop_queue(self.id, recompute));
    }
}

impl<P: Policy> ThreadQueue for WaitQueue<P> {
    fn wait_for_access(&self, thread: ThreadHandle) {
        WaitQueue::wait_for_access(self, thread)
    }

    fn acquire(&self, thread: ThreadHandle) {
        WaitQueue::acquire(self, thread)
    }

    fn next_thread(&self) -> Option<ThreadHandle> {
        WaitQueue::next_thread(self)
    }

    fn release(&self, thread: ThreadHandle) -> bool {
        WaitQueue::release(self, thread)
    }

    fn cancel(&self, thread: ThreadHandle) -> bool {
        WaitQueue::cancel(self, thread)
    }

    fn is_empty(&self) -> bool {
        WaitQueue::is_empty(self)
    }
}
