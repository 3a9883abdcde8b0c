//! Recoverable scheduler errors.
//!
//! Misusing the scheduler (priority out of range, calling it without
//! disabling interrupts, creating a donation cycle) is a kernel bug and
//! panics. [`SchedError`] only covers the few entry points that accept values
//! from outside the kernel: [`Scheduler::try_set_priority`] and
//! [`SchedulerConfig::from_env`].
//!
//! [`Scheduler::try_set_priority`]: crate::thread::scheduler::Scheduler::try_set_priority
//! [`SchedulerConfig::from_env`]: crate::config::SchedulerConfig::from_env

/// Errors reported by the fallible scheduler entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    /// Requested priority lies outside the policy range. (EINVAL)
    #[error("priority {priority} is outside of [{min}, {max}]")]
    PriorityOutOfRange {
        /// The rejected priority.
        priority: u32,
        /// Lowest priority accepted by the policy.
        min: u32,
        /// Highest priority accepted by the policy.
        max: u32,
    },
    /// A configuration value could not be parsed.
    #[error("invalid value {value:?} for configuration key `{key}`")]
    InvalidConfig {
        /// Name of the offending key.
        key: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
}
