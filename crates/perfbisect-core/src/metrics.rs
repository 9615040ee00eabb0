//! Global atomic counters for bisection observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a job finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    tasks_scheduled: AtomicU64,
    no_resource_retries: AtomicU64,
    poll_failures: AtomicU64,
    midpoints_resolved: AtomicU64,
    comparisons: AtomicU64,
    jobs_finished: AtomicU64,
    steps_replayed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tasks_scheduled: AtomicU64::new(0),
            no_resource_retries: AtomicU64::new(0),
            poll_failures: AtomicU64::new(0),
            midpoints_resolved: AtomicU64::new(0),
            comparisons: AtomicU64::new(0),
            jobs_finished: AtomicU64::new(0),
            steps_replayed: AtomicU64::new(0),
        }
    }

    counter!(inc_tasks_scheduled, tasks_scheduled, tasks_scheduled);
    counter!(inc_no_resource_retries, no_resource_retries, no_resource_retries);
    counter!(inc_poll_failures, poll_failures, poll_failures);
    counter!(inc_midpoints_resolved, midpoints_resolved, midpoints_resolved);
    counter!(inc_comparisons, comparisons, comparisons);
    counter!(inc_jobs_finished, jobs_finished, jobs_finished);
    counter!(inc_steps_replayed, steps_replayed, steps_replayed);

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            tasks_scheduled = self.tasks_scheduled(),
            no_resource_retries = self.no_resource_retries(),
            poll_failures = self.poll_failures(),
            midpoints_resolved = self.midpoints_resolved(),
            comparisons = self.comparisons(),
            jobs_finished = self.jobs_finished(),
            steps_replayed = self.steps_replayed(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.tasks_scheduled,
            &self.no_resource_retries,
            &self.poll_failures,
            &self.midpoints_resolved,
            &self.comparisons,
            &self.jobs_finished,
            &self.steps_replayed,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.tasks_scheduled(), 0);
        m.inc_tasks_scheduled();
        m.inc_tasks_scheduled();
        assert_eq!(m.tasks_scheduled(), 2);

        m.inc_no_resource_retries();
        assert_eq!(m.no_resource_retries(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_poll_failures();
        m.inc_comparisons();
        m.inc_steps_replayed();
        m.reset();
        assert_eq!(m.poll_failures(), 0);
        assert_eq!(m.comparisons(), 0);
        assert_eq!(m.steps_replayed(), 0);
    }
}
