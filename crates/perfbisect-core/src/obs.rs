//! Structured observability hooks for bisection lifecycle events.
//!
//! This module provides:
//! - Job-scoped tracing spans via the `JobSpan` RAII guard
//! - Emission functions for job, midpoint, comparison and task events
//! - The [`Heartbeat`] liveness callback used while polling tasks
//!
//! Events are emitted at `info!` level; filter with `RUST_LOG`.

use tracing::{debug, info, warn};

use crate::compare::Verdict;

/// RAII guard that enters a job-scoped tracing span.
///
/// ```ignore
/// let _span = JobSpan::enter("job-12345");
/// // every event below carries job_id = "job-12345"
/// ```
pub struct JobSpan {
    _span: tracing::span::EnteredSpan,
}

impl JobSpan {
    /// Create and enter a span tagged with the job_id.
    pub fn enter(job_id: &str) -> Self {
        let span = tracing::info_span!("perfbisect.job", job_id = %job_id);
        Self {
            _span: span.entered(),
        }
    }

    /// The span a spawned job future should be instrumented with.
    pub fn span(job_id: &str) -> tracing::Span {
        tracing::info_span!("perfbisect.job", job_id = %job_id)
    }
}

/// Emit event: job accepted.
pub fn emit_job_scheduled(job_id: &str, benchmark: &str, start: &str, end: &str) {
    info!(
        event = "job.scheduled",
        job_id = %job_id,
        benchmark = %benchmark,
        start = %start,
        end = %end,
    );
}

/// Emit event: job finished, with the culprit if one was found.
pub fn emit_job_finished(job_id: &str, culprit: Option<&str>, duration_ms: u64, steps: u64) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        culprit = culprit.unwrap_or(""),
        found = culprit.is_some(),
        duration_ms = duration_ms,
        steps = steps,
    );
}

pub fn emit_job_failed(job_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.failed", job_id = %job_id, error = %error);
}

pub fn emit_job_cancelled(job_id: &str) {
    info!(event = "job.cancelled", job_id = %job_id);
}

pub fn emit_job_resumed(job_id: &str, journaled_steps: usize) {
    info!(event = "job.resumed", job_id = %job_id, journaled_steps = journaled_steps);
}

/// Emit event: the next candidate in the bracket was resolved.
pub fn emit_midpoint_resolved(low: &str, high: &str, mid: &str) {
    info!(event = "midpoint.resolved", low = %low, high = %high, mid = %mid);
}

/// Emit event: adjacent commits differ in a pinned dependency.
pub fn emit_dependency_roll(repository_url: &str, left: &str, right: &str) {
    info!(
        event = "midpoint.dependency_roll",
        dependency = %repository_url,
        left = %left,
        right = %right,
    );
}

/// Emit event: two commit runs were compared.
///
/// An `Unknown` verdict is treated as "no difference" by the control loop;
/// it is logged at warn so the silent continuation stays visible.
pub fn emit_comparison(a: &str, b: &str, verdict: Verdict, p_value: f64) {
    if verdict == Verdict::Unknown {
        warn!(
            event = "compare.evaluated",
            a = %a,
            b = %b,
            verdict = %verdict,
            p_value = p_value,
            "inconclusive comparison treated as no difference"
        );
    } else {
        info!(event = "compare.evaluated", a = %a, b = %b, verdict = %verdict, p_value = p_value);
    }
}

pub fn emit_step_replayed(job_id: &str, seq: u64, kind: &str) {
    debug!(event = "journal.replayed", job_id = %job_id, seq = seq, kind = %kind);
}

pub fn emit_task_scheduled(task_id: &str, commit: &str, attempt: u32) {
    info!(event = "task.scheduled", task_id = %task_id, commit = %commit, attempt = attempt);
}

pub fn emit_task_state(task_id: &str, state: &str) {
    debug!(event = "task.state", task_id = %task_id, state = %state);
}

pub fn emit_no_resource_retry(commit: &str, attempt: u32) {
    warn!(event = "task.no_resource", commit = %commit, attempt = attempt);
}

pub fn emit_poll_failure(task_id: &str, remaining: u32, error: &dyn std::fmt::Display) {
    warn!(event = "task.poll_failed", task_id = %task_id, remaining = remaining, error = %error);
}

pub fn emit_task_cleanup(task_id: &str, error: Option<&dyn std::fmt::Display>) {
    match error {
        None => info!(event = "task.cleanup", task_id = %task_id),
        Some(e) => warn!(event = "task.cleanup_failed", task_id = %task_id, error = %e),
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Liveness callback invoked on every poll iteration of a running task.
pub trait Heartbeat: Send + Sync {
    fn beat(&self, task_id: &str, detail: &str);
}

/// Heartbeat that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHeartbeat;

impl Heartbeat for TracingHeartbeat {
    fn beat(&self, task_id: &str, detail: &str) {
        tracing::trace!(event = "task.heartbeat", task_id = %task_id, detail = %detail);
    }
}
