//! Spinlock protecting the scheduler state.
//!
//! Disabling interrupts is enough to protect shared state on a single core,
//! but hosted threads run truly in parallel. The lock word is therefore set
//! with an atomic read-modify-write, and a waiter polls it until it is
//! released. Acquiring the lock also disables interrupts on the acquiring
//! thread for as long as the guard lives, exactly like the kernel spinlock.

use crate::interrupt::InterruptGuard;
use crossbeam_utils::{Backoff, CachePadded};
use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicBool, Ordering},
};

/// Returned by [`SpinLock::try_lock`] when another thread holds the lock.
#[derive(Debug, PartialEq, Eq)]
pub struct WouldBlock;

/// A busy-waiting lock owning the value `T` it protects.
///
/// `T` is reachable only through a [`SpinLockGuard`], obtained from
/// [`lock`](Self::lock) or [`try_lock`](Self::try_lock), so it is never
/// touched without the lock held. Contending threads spin with exponential
/// backoff instead of sleeping; keep critical sections short.
///
/// # Examples
///
/// ```
/// use keos_sched::sync::SpinLock;
/// use std::sync::Arc;
///
/// let data = Arc::new(SpinLock::new(0));
/// let handles = (0..4)
///     .map(|_| {
///         let data = Arc::clone(&data);
///         std::thread::spawn(move || {
///             let mut guard = data.lock();
///             *guard += 1;
///             // the lock must be "explicitly" unlocked.
///             guard.unlock();
///         })
///     })
///     .collect::<Vec<_>>();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// let guard = data.lock();
/// assert_eq!(*guard, 4);
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: CachePadded<AtomicBool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wraps `t` in an unlocked spinlock.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(t),
        }
    }

    /// Unwraps the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spins until the lock is free and takes it.
    ///
    /// Interrupts stay disabled on the calling thread until
    /// [`SpinLockGuard::unlock`] is called.
    ///
    /// Locking a spinlock from the thread that already holds it deadlocks.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        let guard = loop {
            let guard = InterruptGuard::new();
            if !self.locked.swap(true, Ordering::Acquire) {
                break guard;
            }
            drop(guard);
            backoff.snooze();
        };

        SpinLockGuard {
            caller: Location::caller(),
            lock: self,
            guard: Some(guard),
        }
    }

    /// Takes the lock if it is free, without spinning.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if !self.locked.swap(true, Ordering::Acquire) {
            Ok(SpinLockGuard {
                caller: Location::caller(),
                lock: self,
                guard: Some(guard),
            })
        } else {
            Err(WouldBlock)
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// Access to the value of a locked [`SpinLock`].
///
/// Call [`unlock`](Self::unlock) to release it; dropping the guard panics and
/// reports where the lock was taken. A guard dropped while the thread is
/// already unwinding releases the lock silently so the original panic
/// surfaces.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static Location<'static>,
    lock: &'a SpinLock<T>,
    guard: Option<InterruptGuard>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the lock and re-enables interrupts if this was the outermost
    /// guard.
    pub fn unlock(mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.guard.take();
        std::mem::forget(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lock.locked.store(false, Ordering::Release);
            return;
        }
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
            self.caller
        );
    }
}
