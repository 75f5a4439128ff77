//! Job definitions for the queue.
//!
//! This module defines the core types stored in Redis:
//!
//! - `Job`: a unit of work with payload and scheduling options
//! - `JobOptions`: per-job scheduling and retry configuration
//! - `JobStatus`: the persistent lifecycle state
//! - `Backoff`: retry delay policy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of execution attempts for a job.
const DEFAULT_ATTEMPTS: u32 = 1;

/// Retry delay policy applied between failed attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// How the delay grows across attempts.
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay: u64,
}

impl Backoff {
    /// A constant delay between every retry.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    /// A delay that doubles with each failed attempt.
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }
}

/// Growth curve for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Every retry waits the base delay.
    Fixed,
    /// Retry `n` waits `delay * 2^(n-1)`.
    Exponential,
}

/// Scheduling and retry options, frozen at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum total execution attempts.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Retry delay policy; `None` retries immediately.
    #[serde(default)]
    pub backoff: Option<Backoff>,
    /// Initial delay in milliseconds; > 0 enqueues the job as delayed.
    #[serde(default)]
    pub delay: u64,
    /// Per-attempt wall-clock cap in milliseconds; 0 means no cap.
    #[serde(default)]
    pub timeout: u64,
    /// Delete the record once the job completes successfully.
    #[serde(default)]
    pub remove_on_complete: bool,
    /// Delete the record once the job fails terminally.
    #[serde(default)]
    pub remove_on_fail: bool,
    /// Reserved for future use; recognized but not acted upon.
    #[serde(default)]
    pub priority: i32,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: None,
            delay: 0,
            timeout: 0,
            remove_on_complete: false,
            remove_on_fail: false,
            priority: 0,
        }
    }
}

impl JobOptions {
    /// Sets the maximum number of execution attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Sets the retry backoff policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Sets the initial delay in milliseconds.
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = delay_ms;
        self
    }

    /// Sets the per-attempt timeout in milliseconds.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    /// Deletes the record on successful completion.
    pub fn remove_on_complete(mut self) -> Self {
        self.remove_on_complete = true;
        self
    }

    /// Deletes the record on terminal failure.
    pub fn remove_on_fail(mut self) -> Self {
        self.remove_on_fail = true;
        self
    }
}

/// Persistent lifecycle state of a job.
///
/// `Waiting`, `Active` and `Delayed` correspond to membership in the
/// waiting list, active list and delayed sorted set respectively.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobStatus {
    /// Returns whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Delayed => write!(f, "delayed"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work stored in Redis and executed by workers.
///
/// The record is serialized as a single JSON blob into the job hash;
/// collection membership (waiting/active/delayed) is tracked separately
/// by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at enqueue and never reused.
    pub id: Uuid,
    /// Handler discriminator and telemetry label.
    pub name: String,
    /// Opaque user payload.
    pub data: serde_json::Value,
    /// Options frozen at enqueue, except for the retry counters.
    pub opts: JobOptions,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Number of failed executions so far.
    pub attempts_made: u32,
    /// Message of the most recent failure.
    #[serde(default)]
    pub failed_reason: Option<String>,
    /// One entry per failed execution, oldest first.
    #[serde(default)]
    pub stacktrace: Vec<String>,
    /// Handler result, recorded on success unless the record is removed.
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,
}

impl Job {
    /// Creates a new job in its initial state.
    ///
    /// Status is `Delayed` when `opts.delay > 0`, `Waiting` otherwise.
    pub fn new(name: impl Into<String>, data: serde_json::Value, opts: JobOptions) -> Self {
        let status = if opts.delay > 0 {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };

        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data,
            opts,
            created_at: Utc::now(),
            status,
            attempts_made: 0,
            failed_reason: None,
            stacktrace: Vec::new(),
            return_value: None,
        }
    }

    /// Returns whether another attempt is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts_made < self.opts.attempts
    }

    /// Records one failed execution.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.attempts_made += 1;
        self.stacktrace.push(reason.clone());
        self.failed_reason = Some(reason);
    }
}

/// Computes the delay in milliseconds before the next retry.
///
/// `attempts_made` is the counter after incrementing for the failure
/// that triggered the retry, so it is at least 1.
pub fn backoff_delay(attempts_made: u32, opts: &JobOptions) -> u64 {
    match &opts.backoff {
        Some(b) => match b.kind {
            BackoffKind::Fixed => b.delay,
            BackoffKind::Exponential => {
                let shift = attempts_made.saturating_sub(1).min(63);
                b.delay.saturating_mul(1u64 << shift)
            }
        },
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_options_default() {
        let opts = JobOptions::default();

        assert_eq!(opts.attempts, 1);
        assert!(opts.backoff.is_none());
        assert_eq!(opts.delay, 0);
        assert_eq!(opts.timeout, 0);
        assert!(!opts.remove_on_complete);
        assert!(!opts.remove_on_fail);
        assert_eq!(opts.priority, 0);
    }

    #[test]
    fn test_job_options_builder() {
        let opts = JobOptions::default()
            .with_attempts(3)
            .with_backoff(Backoff::exponential(50))
            .with_delay(1000)
            .with_timeout(5000)
            .remove_on_complete();

        assert_eq!(opts.attempts, 3);
        assert_eq!(opts.backoff, Some(Backoff::exponential(50)));
        assert_eq!(opts.delay, 1000);
        assert_eq!(opts.timeout, 5000);
        assert!(opts.remove_on_complete);
        assert!(!opts.remove_on_fail);
    }

    #[test]
    fn test_job_options_attempts_floor() {
        let opts = JobOptions::default().with_attempts(0);
        assert_eq!(opts.attempts, 1);
    }

    #[test]
    fn test_job_new_waiting() {
        let job = Job::new("email", json!({"to": "a@b.c"}), JobOptions::default());

        assert!(!job.id.is_nil());
        assert_eq!(job.name, "email");
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(job.failed_reason.is_none());
        assert!(job.stacktrace.is_empty());
        assert!(job.return_value.is_none());
    }

    #[test]
    fn test_job_new_delayed() {
        let opts = JobOptions::default().with_delay(500);
        let job = Job::new("email", json!({}), opts);

        assert_eq!(job.status, JobStatus::Delayed);
    }

    #[test]
    fn test_job_record_failure() {
        let opts = JobOptions::default().with_attempts(2);
        let mut job = Job::new("t", json!({}), opts);

        assert!(job.should_retry());

        job.record_failure("boom");
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
        assert_eq!(job.stacktrace, vec!["boom".to_string()]);
        assert!(job.should_retry());

        job.record_failure("boom again");
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.stacktrace.len(), 2);
        assert!(!job.should_retry());
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let opts = JobOptions::default()
            .with_attempts(3)
            .with_backoff(Backoff::fixed(100));
        let job = Job::new("report", json!({"pages": 3}), opts);

        let blob = serde_json::to_string(&job).expect("serialize");
        let parsed: Job = serde_json::from_str(&blob).expect("deserialize");

        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.name, job.name);
        assert_eq!(parsed.data, job.data);
        assert_eq!(parsed.opts, job.opts);
        assert_eq!(parsed.status, job.status);
        assert_eq!(parsed.created_at, job.created_at);
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Waiting.to_string(), "waiting");
        assert_eq!(JobStatus::Active.to_string(), "active");
        assert_eq!(JobStatus::Delayed.to_string(), "delayed");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(!JobStatus::Delayed.is_terminal());
    }

    #[test]
    fn test_backoff_none() {
        let opts = JobOptions::default();
        assert_eq!(backoff_delay(1, &opts), 0);
        assert_eq!(backoff_delay(5, &opts), 0);
    }

    #[test]
    fn test_backoff_fixed() {
        let opts = JobOptions::default().with_backoff(Backoff::fixed(250));
        assert_eq!(backoff_delay(1, &opts), 250);
        assert_eq!(backoff_delay(2, &opts), 250);
        assert_eq!(backoff_delay(7, &opts), 250);
    }

    #[test]
    fn test_backoff_exponential() {
        let opts = JobOptions::default().with_backoff(Backoff::exponential(10));
        assert_eq!(backoff_delay(1, &opts), 10);
        assert_eq!(backoff_delay(2, &opts), 20);
        assert_eq!(backoff_delay(3, &opts), 40);
        assert_eq!(backoff_delay(4, &opts), 80);
    }

    #[test]
    fn test_backoff_exponential_saturates() {
        let opts = JobOptions::default().with_backoff(Backoff::exponential(u64::MAX / 2));
        assert_eq!(backoff_delay(10, &opts), u64::MAX);
    }

    #[test]
    fn test_backoff_serde_wire_format() {
        let backoff: Backoff =
            serde_json::from_str(r#"{"type":"exponential","delay":50}"#).expect("parse");
        assert_eq!(backoff, Backoff::exponential(50));
    }
}
