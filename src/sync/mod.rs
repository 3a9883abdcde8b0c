//! Synchronization primitives.
//!
//! |                | [`SpinLock`]              | [`Lock`]                          |
//! |----------------|---------------------------|-----------------------------------|
//! | Waiting thread | Spins (busy-waits)        | Sleeps                            |
//! | Who goes next  | Whoever wins the race     | Chosen by the lock's thread queue |
//! | Guards         | Scheduler state           | Long critical sections            |
//!
//! Both guards must be released explicitly with `.unlock()`.

pub mod lock;
pub mod spinlock;

pub use lock::{Lock, LockGuard};
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
