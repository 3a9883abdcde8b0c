//! Scheduler configuration.
//!
//! A [`SchedulerConfig`] is assembled with a [`SchedulerConfigBuilder`] and
//! handed to [`Scheduler::with_config`]. Two knobs exist:
//!
//! - the seed of the lottery random number generator, so that a lottery run
//!   can be replayed exactly, and
//! - the [`Propagation`] mode used to keep effective priorities up to date.
//!
//! Both can also be taken from the environment with
//! [`SchedulerConfig::from_env`]:
//!
//! | Variable                 | Values          | Default          |
//! |--------------------------|-----------------|------------------|
//! | `KEOS_SCHED_SEED`        | any `u64`       | fresh entropy    |
//! | `KEOS_SCHED_PROPAGATION` | `eager`, `lazy` | `eager`          |
//!
//! [`Scheduler::with_config`]: crate::thread::scheduler::Scheduler::with_config

use crate::error::SchedError;
use std::{fmt, str::FromStr};

/// Environment variable holding the lottery seed.
pub const SEED_VAR: &str = "KEOS_SCHED_SEED";
/// Environment variable holding the propagation mode.
pub const PROPAGATION_VAR: &str = "KEOS_SCHED_PROPAGATION";

/// How a change of priority is pushed through the donation graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Recompute every thread downstream of the change from scratch.
    ///
    /// Effective priorities are exact after every operation, including when
    /// a donation is withdrawn deep inside a chain.
    #[default]
    Eager,
    /// Recompute the changed thread from cached inputs and keep walking only
    /// while the value rises (priority) or changes (lottery).
    ///
    /// This is the textbook walk. A thread further down a chain is
    /// not lowered again when a donation upstream disappears, so it may keep
    /// a stale, too high, effective priority until it is recomputed for
    /// another reason.
    Lazy,
}

impl FromStr for Propagation {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(Self::Eager),
            "lazy" => Ok(Self::Lazy),
            _ => Err(SchedError::InvalidConfig {
                key: PROPAGATION_VAR,
                value: s.into(),
            }),
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eager => f.write_str("eager"),
            Self::Lazy => f.write_str("lazy"),
        }
    }
}

/// Configuration of a [`Scheduler`].
///
/// [`Scheduler`]: crate::thread::scheduler::Scheduler
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerConfig {
    seed: Option<u64>,
    propagation: Propagation,
}

impl SchedulerConfig {
    /// Start building a configuration.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }

    /// Build a configuration from [`SEED_VAR`] and [`PROPAGATION_VAR`].
    ///
    /// Unset variables keep their default. A variable that is set but cannot
    /// be parsed is reported as [`SchedError::InvalidConfig`].
    pub fn from_env() -> Result<Self, SchedError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SchedError> {
        let mut builder = Self::builder();
        if let Some(raw) = lookup(SEED_VAR) {
            let seed = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| SchedError::InvalidConfig {
                    key: SEED_VAR,
                    value: raw.clone(),
                })?;
            builder = builder.seed(seed);
        }
        if let Some(raw) = lookup(PROPAGATION_VAR) {
            builder = builder.propagation(raw.parse()?);
        }
        Ok(builder.build())
    }

    /// Seed of the lottery generator, if one was fixed.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Selected propagation mode.
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Fix the seed of the lottery generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Select the propagation mode.
    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.config.propagation = propagation;
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}
