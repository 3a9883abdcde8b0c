//! # keos-sched: thread queues with priority donation
//!
//! This crate implements the part of a KeOS-style kernel that decides which
//! thread gets a contended resource next. Locks and joins are both built on
//! the same abstraction, a *thread queue* owned by a [`Scheduler`], and the
//! scheduler comes with two policies:
//!
//! - **priority** scheduling, where the most urgent waiter always wins and a
//!   lock holder inherits the highest priority of its waiters;
//! - **lottery** scheduling, where each waiter wins with a probability
//!   proportional to its tickets and a lock holder is funded with the tickets
//!   of everybody waiting for it.
//!
//! Both policies donate transitively: if a lock holder is itself waiting for
//! another lock, the donation travels on to that lock's holder. A thread
//! joining another one donates to it the same way.
//!
//! ## Crate layout
//!
//! | Module                   | Contents                                               |
//! |--------------------------|--------------------------------------------------------|
//! | [`thread::scheduler`]    | [`Scheduler`], [`WaitQueue`], the policies, [`Fifo`]   |
//! | [`thread`]               | thread handles, parking, spawning                      |
//! | [`sync`]                 | [`SpinLock`] and the sleeping [`Lock`]                 |
//! | [`interrupt`]            | [`InterruptGuard`], the scheduler's exclusion          |
//! | [`config`]               | [`SchedulerConfig`]                                    |
//! | [`error`]                | [`SchedError`]                                         |
//!
//! ## Calling convention
//!
//! Scheduler operations never sleep and must be called with interrupts
//! disabled, i.e. while an [`InterruptGuard`] is alive on the calling thread.
//! A thread that has to wait registers itself with
//! [`WaitQueue::wait_for_access`], lets go of the guard, and only then parks.
//! [`Lock`] packages this dance.
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events: queue lifecycle and hand-offs at
//! `debug`, effective priority changes and lottery draws at `trace`, and
//! suspicious teardown at `warn`. Install any subscriber to see them.
//!
//! [`Scheduler`]: thread::scheduler::Scheduler
//! [`WaitQueue`]: thread::scheduler::WaitQueue
//! [`WaitQueue::wait_for_access`]: thread::scheduler::WaitQueue::wait_for_access
//! [`Fifo`]: thread::scheduler::Fifo
//! [`SpinLock`]: sync::SpinLock
//! [`Lock`]: sync::Lock
//! [`InterruptGuard`]: interrupt::InterruptGuard
//! [`SchedulerConfig`]: config::SchedulerConfig

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod interrupt;
pub mod sync;
pub mod thread;

pub use error::SchedError;
