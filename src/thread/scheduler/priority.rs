//! Priority scheduling with max-based donation.
//!
//! The next thread is always a waiter whose effective priority is no lower
//! than any other waiter's. Among waiters of that priority, the one that has
//! waited longest wins, which gives round-robin access among equals and
//! ignores everybody else. Low priority threads can starve; that is the
//! expected behavior of a strict priority scheduler.
//!
//! A donation-enabled queue lends the *highest* waiter priority to its
//! owners. It is not additive: ten waiters at priority 5 boost an owner to 5,
//! exactly like a single one.

use super::{Candidate, Policy};
use crate::config::SchedulerConfig;

/// Strict priority with FIFO tie-break and max donation.
#[derive(Clone, Copy, Debug, Default)]
pub struct PriorityPolicy;

impl Policy for PriorityPolicy {
    const NAME: &'static str = "priority";
    const PRIORITY_MIN: u32 = 0;
    const PRIORITY_MAX: u32 = 7;
    const PRIORITY_DEFAULT: u32 = 1;

    fn from_config(_config: &SchedulerConfig) -> Self {
        Self
    }

    fn own(base: u32) -> u64 {
        u64::from(base)
    }

    fn donation(values: impl Iterator<Item = u64>) -> u64 {
        values.max().unwrap_or(u64::from(Self::PRIORITY_MIN))
    }

    fn combine(value: u64, donation: u64) -> u64 {
        value.max(donation)
    }

    fn propagates(previous: u64, next: u64) -> bool {
        next > previous
    }

    fn owner_is_stale(waiter: u64, owner: u64) -> bool {
        waiter > owner
    }

    fn select(&mut self, candidates: &[Candidate]) -> usize {
        let mut best = 0;
        for (index, candidate) in candidates.iter().enumerate().skip(1) {
            let current = &candidates[best];
            if candidate.value > current.value
                || (candidate.value == current.value && candidate.arrival < current.arrival)
            {
                best = index;
            }
        }
        best
    }
}
