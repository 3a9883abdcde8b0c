//! Lottery scheduling with additive donation.
//!
//! Every thread holds a number of tickets. To pick the next thread, the
//! scheduler draws one ticket uniformly among all tickets held by the
//! waiters; the holder of that ticket wins. A thread holding `k` out of `n`
//! tickets therefore wins with probability `k / n`, and no thread with at
//! least one ticket starves forever.
//!
//! Only ticket *counts* are stored, never individual tickets, so a draw costs
//! one pass over the waiters regardless of how many tickets are in play:
//!
//! 1. draw `r` uniformly in `1..=n`,
//! 2. walk the waiters in arrival order, subtracting each one's tickets
//!    from `r`,
//! 3. the waiter that brings `r` to zero or below wins.
//!
//! A base priority of 0 is legal and still holds one ticket, so a thread can
//! never drop out of a draw entirely.
//!
//! Donation adds up. An owner holds its own tickets plus every ticket of
//! every waiter of the donation-enabled queues it owns, since each waiter's
//! chance of running now depends on the owner running.
//!
//! The generator is a [`Pcg64Mcg`]. Fix its seed through
//! [`SchedulerConfigBuilder::seed`] to make draws reproducible.
//!
//! [`SchedulerConfigBuilder::seed`]: crate::config::SchedulerConfigBuilder::seed

use super::{Candidate, Policy};
use crate::config::SchedulerConfig;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use tracing::{debug, trace};

/// Ticket-weighted random selection with additive donation.
#[derive(Clone, Debug)]
pub struct LotteryPolicy {
    rng: Pcg64Mcg,
}

impl LotteryPolicy {
    /// A lottery whose draws are determined by `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Pcg64Mcg::seed_from_u64(seed),
        }
    }
}

impl Policy for LotteryPolicy {
    const NAME: &'static str = "lottery";
    const PRIORITY_MIN: u32 = 0;
    const PRIORITY_MAX: u32 = u32::MAX;
    const PRIORITY_DEFAULT: u32 = 1;

    fn from_config(config: &SchedulerConfig) -> Self {
        let seed = config.seed().unwrap_or_else(rand::random);
        debug!(seed, "lottery seeded");
        Self::with_seed(seed)
    }

    fn own(base: u32) -> u64 {
        u64::from(base.max(1))
    }

    fn donation(values: impl Iterator<Item = u64>) -> u64 {
        values.fold(0, u64::saturating_add)
    }

    fn combine(value: u64, donation: u64) -> u64 {
        value.saturating_add(donation)
    }

    fn propagates(previous: u64, next: u64) -> bool {
        next != previous
    }

    fn owner_is_stale(_waiter: u64, _owner: u64) -> bool {
        true
    }

    fn select(&mut self, candidates: &[Candidate]) -> usize {
        let total = Self::donation(candidates.iter().map(|candidate| candidate.value));
        let mut remaining = self.rng.gen_range(1..=total);
        trace!(total, draw = remaining, "lottery draw");
        for (index, candidate) in candidates.iter().enumerate() {
            if remaining <= candidate.value {
                return index;
            }
            remaining -= candidate.value;
        }
        unreachable!("lottery draw {remaining} exceeds {total} tickets")
    }
}
