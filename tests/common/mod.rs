#![allow(dead_code)]

use keos_sched::{
    config::{Propagation, SchedulerConfig},
    thread::{ThreadHandle, scheduler::{Policy, Scheduler}},
};
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Route scheduler logs to the test harness.
///
/// Lottery tests draw tens of thousands of times, so per-draw records stay
/// off by default.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::INFO);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

pub fn scheduler<P: Policy>(propagation: Propagation) -> Scheduler<P> {
    init_test_logging();
    Scheduler::with_config(
        SchedulerConfig::builder()
            .seed(0x5eed)
            .propagation(propagation)
            .build(),
    )
}

pub fn threads<const N: usize>() -> [ThreadHandle; N] {
    [(); N].map(|_| ThreadHandle::fresh())
}
