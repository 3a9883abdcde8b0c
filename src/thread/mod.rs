//! Thread abstraction.
//!
//! ## Model
//!
//! The scheduler never owns a thread. It only sees a [`ThreadHandle`], an
//! opaque, copyable identity handed out by this module, and keeps its own
//! per-thread bookkeeping in a side table keyed by that handle.
//!
//! This module is the thread-management collaborator the scheduler is built
//! against. It runs on top of host threads and offers the three primitives
//! the synchronization code needs:
//!
//! - [`current`]: the handle of the calling thread,
//! - [`Current::park_with`]: hand a [`ParkHandle`] to a closure and then
//!   sleep until somebody calls [`ParkHandle::unpark`],
//! - [`ThreadBuilder`]: create a new thread whose handle is known before it
//!   starts running, so that its priority can be set up front.
//!
//! ## Joins
//!
//! A thread started with [`ThreadBuilder::spawn_joinable`] owns a
//! donation-enabled join queue of a [`Scheduler`] for its whole life. A
//! joiner waits on that queue, so it lends its priority to the thread it
//! joins exactly like a lock waiter lends it to the lock holder. On exit the
//! queue is handed to the joiner and the thread is removed from the
//! scheduler, which also drops its bookkeeping.
//!
//! Threads started with [`ThreadBuilder::spawn`] are unknown to any
//! scheduler; whoever registered them must call
//! [`Scheduler::remove_thread`] once they are gone.
//!
//! A scheduler call never sleeps. Code that must wait first registers itself
//! on a queue while interrupts are disabled, re-enables interrupts, and only
//! then parks.
pub mod scheduler;

use crate::{
    interrupt::{InterruptGuard, InterruptState},
    sync::SpinLock,
};
use scheduler::{Policy, Scheduler, ThreadQueue};
use std::{
    cell::Cell,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tracing::debug;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: Cell<Option<ThreadHandle>> = const { Cell::new(None) };
}

/// Opaque identity of a schedulable thread.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ThreadHandle(u64);

impl ThreadHandle {
    /// Allocate a handle that was never handed out before.
    pub fn fresh() -> Self {
        Self(NEXT_TID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric thread id.
    pub fn tid(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Handle of the calling thread.
///
/// Host threads that were not started by a [`ThreadBuilder`] get a handle on
/// their first call.
pub fn current() -> ThreadHandle {
    CURRENT.with(|current| match current.get() {
        Some(handle) => handle,
        None => {
            let handle = ThreadHandle::fresh();
            current.set(Some(handle));
            handle
        }
    })
}

/// Operations on the calling thread.
pub struct Current {
    _p: (),
}

impl Current {
    /// Hands a [`ParkHandle`] for the calling thread to `f`, then sleeps until
    /// that handle is unparked.
    ///
    /// `f` typically stores the handle where a waker will find it. An unpark
    /// that happens before the thread actually went to sleep is not lost.
    ///
    /// # Panics
    /// Panics if interrupts are disabled when the thread is about to sleep.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let token = Arc::new(AtomicBool::new(false));
        f(ParkHandle {
            tid: current(),
            thread: std::thread::current(),
            token: token.clone(),
        });
        assert!(
            InterruptState::current() == InterruptState::On,
            "Try to park a thread while holding a lock."
        );
        while !token.load(Ordering::Acquire) {
            std::thread::park();
        }
    }

    /// Numeric id of the calling thread.
    pub fn get_tid() -> u64 {
        current().tid()
    }
}

/// Wakes up one sleeping thread, once.
pub struct ParkHandle {
    tid: ThreadHandle,
    thread: std::thread::Thread,
    token: Arc<AtomicBool>,
}

impl ParkHandle {
    /// Handle of the parked thread.
    pub fn tid(&self) -> ThreadHandle {
        self.tid
    }

    /// Wake the thread up.
    pub fn unpark(self) {
        self.token.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

impl fmt::Debug for ParkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkHandle").field("tid", &self.tid).finish()
    }
}

/// Spawns a named thread whose handle is known in advance.
pub struct ThreadBuilder {
    name: String,
    tid: ThreadHandle,
}

impl ThreadBuilder {
    /// Reserve a handle for a thread called `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            tid: ThreadHandle::fresh(),
        }
    }

    /// Get the handle the thread will run with.
    pub fn get_tid(&self) -> ThreadHandle {
        self.tid
    }

    /// Start the thread running `thread_fn`.
    ///
    /// Joining the returned handle does not donate anything; use
    /// [`spawn_joinable`](Self::spawn_joinable) for that.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        self.start(None, thread_fn)
    }

    /// Start the thread running `thread_fn`, joinable through `scheduler`.
    ///
    /// The new thread owns a donation-enabled queue of `scheduler` until it
    /// exits, and [`JoinHandle::join`] waits on that queue. When the thread
    /// exits, normally or by panicking, it is removed from `scheduler`.
    pub fn spawn_joinable<P, F>(self, scheduler: &Scheduler<P>, thread_fn: F) -> JoinHandle
    where
        P: Policy,
        F: FnOnce() + Send + 'static,
    {
        let queue = scheduler.new_queue(true);
        {
            let _guard = InterruptGuard::new();
            queue.acquire(self.tid);
        }
        let scheduler = scheduler.clone();
        let join = Arc::new(JoinQueue {
            queue: Box::new(queue),
            forget: Box::new(move |tid| scheduler.remove_thread(tid)),
            slot: SpinLock::new(JoinSlot::default()),
        });
        self.start(Some(join), thread_fn)
    }

    fn start<F: FnOnce() + Send + 'static>(
        self,
        join: Option<Arc<JoinQueue>>,
        thread_fn: F,
    ) -> JoinHandle {
        let Self { name, tid } = self;
        let on_exit = join.clone();
        let inner = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                CURRENT.with(|current| current.set(Some(tid)));
                let _exit = on_exit.map(|join| ExitHook { join, tid });
                thread_fn()
            })
            .unwrap_or_else(|e| panic!("failed to spawn thread `{name}`: {e}"));
        JoinHandle { tid, inner, join }
    }
}

#[derive(Default)]
struct JoinSlot {
    exited: bool,
    joiner: Option<ParkHandle>,
}

/// The queue a joiner sleeps on until the joined thread exits.
struct JoinQueue {
    queue: Box<dyn ThreadQueue>,
    forget: Box<dyn Fn(ThreadHandle) + Send + Sync>,
    slot: SpinLock<JoinSlot>,
}

impl JoinQueue {
    fn wait(&self, me: ThreadHandle) {
        let mut slot = self.slot.lock();
        if slot.exited {
            slot.unlock();
            return;
        }
        Current::park_with(|handle| {
            self.queue.wait_for_access(me);
            slot.joiner = Some(handle);
            slot.unlock();
        });
        let _guard = InterruptGuard::new();
        self.queue.release(me);
    }

    fn exit(&self, tid: ThreadHandle) {
        let mut slot = self.slot.lock();
        slot.exited = true;
        let next = self.queue.next_thread();
        (self.forget)(tid);
        let joiner = slot.joiner.take();
        slot.unlock();
        debug!(thread = %tid, joiner = ?next, "thread exited");
        if let Some(joiner) = joiner {
            joiner.unpark();
        }
    }
}

struct ExitHook {
    join: Arc<JoinQueue>,
    tid: ThreadHandle,
}

impl Drop for ExitHook {
    fn drop(&mut self) {
        self.join.exit(self.tid);
    }
}

/// Handle to wait for a spawned thread.
pub struct JoinHandle {
    /// Handle of the spawned thread.
    pub tid: ThreadHandle,
    inner: std::thread::JoinHandle<()>,
    join: Option<Arc<JoinQueue>>,
}

impl JoinHandle {
    /// Wait for the thread to finish and return its exit code.
    ///
    /// A thread that returns normally exits with 0; one that panicked exits
    /// with -1. If the thread was started with
    /// [`ThreadBuilder::spawn_joinable`], the caller donates its priority to
    /// it while waiting.
    ///
    /// # Panics
    /// Panics if the caller holds an [`InterruptGuard`] and has to wait.
    pub fn join(self) -> i32 {
        if let Some(join) = &self.join {
            join.wait(current());
        }
        match self.inner.join() {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn builder_tid_is_current_inside() {
        let builder = ThreadBuilder::new("child");
        let tid = builder.get_tid();
        let (tx, rx) = mpsc::channel();
        let handle = builder.spawn(move || tx.send(current()).unwrap());
        assert_eq!(handle.join(), 0);
        assert_eq!(rx.recv().unwrap(), tid);
        assert_ne!(current(), tid);
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        Current::park_with(|handle| handle.unpark());
    }

    #[test]
    fn panicking_thread_exits_with_minus_one() {
        let handle = ThreadBuilder::new("boom").spawn(|| panic!("boom"));
        assert_eq!(handle.join(), -1);
    }
}
