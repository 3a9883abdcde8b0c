//! Scheduler exclusion.
//!
//! On a uniprocessor kernel, the scheduler protects its own state by turning
//! interrupts off: while they are off, no context switch can happen, so no
//! other thread can observe a half-updated run queue. Every mutating
//! operation of the [`Scheduler`] therefore requires that the caller has
//! *already* disabled interrupts.
//!
//! This crate runs hosted, so "interrupts off" is modelled as a per-OS-thread
//! nesting counter. An [`InterruptGuard`] increments the counter on creation
//! and decrements it on drop; [`InterruptGuard::is_guarded`] reports whether
//! the calling thread currently holds at least one guard. The guards nest the
//! same way `cli`/`sti` pairs nest in KeOS: only dropping the outermost guard
//! turns the state back to [`InterruptState::On`].
//!
//! [`Scheduler`]: crate::thread::scheduler::Scheduler

use std::{cell::Cell, marker::PhantomData};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread may be preempted.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// No guard is alive.
    On,
    /// At least one guard is alive.
    Off,
}

impl InterruptState {
    /// State of the calling thread.
    pub fn current() -> Self {
        if DEPTH.with(Cell::get) == 0 {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Keeps interrupts disabled on the calling thread while alive.
///
/// Guards nest; the state goes back to [`InterruptState::On`] when the last
/// one is dropped. A guard cannot leave the thread that created it.
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Disable interrupts until the returned guard is dropped.
    #[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
    pub fn new() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    /// Returns `true` if the calling thread holds at least one guard.
    pub fn is_guarded() -> bool {
        InterruptState::current() == InterruptState::Off
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| {
            let prev = depth.get();
            assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");
            depth.set(prev - 1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest() {
        assert_eq!(InterruptState::current(), InterruptState::On);
        let outer = InterruptGuard::new();
        {
            let _inner = InterruptGuard::new();
            assert!(InterruptGuard::is_guarded());
        }
        assert!(InterruptGuard::is_guarded());
        drop(outer);
        assert_eq!(InterruptState::current(), InterruptState::On);
    }

    #[test]
    fn state_is_per_thread() {
        let _guard = InterruptGuard::new();
        let other = std::thread::spawn(InterruptGuard::is_guarded)
            .join()
            .unwrap();
        assert!(!other);
        assert!(InterruptGuard::is_guarded());
    }
}
