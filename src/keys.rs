//! Redis key-space layout for a named queue.
//!
//! For queue `Q` under prefix `P` the queue owns five keys:
//!
//! - `P:Q:waiting` — list of ids awaiting dispatch
//! - `P:Q:active` — list of ids currently executing
//! - `P:Q:delayed` — sorted set of id -> earliest processing epoch-ms
//! - `P:Q:paused` — presence flag (unset = running)
//! - `P:Q:job:<id>` — hash holding the serialized job record
//!
//! Operators running Redis Cluster must colocate a queue's keys on one
//! slot (hash-tag the queue name).

use uuid::Uuid;

/// Precomputed key names for one queue.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    waiting: String,
    active: String,
    delayed: String,
    paused: String,
    job_prefix: String,
}

impl QueueKeys {
    /// Builds the key set for `queue` under `prefix`.
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            waiting: format!("{prefix}:{queue}:waiting"),
            active: format!("{prefix}:{queue}:active"),
            delayed: format!("{prefix}:{queue}:delayed"),
            paused: format!("{prefix}:{queue}:paused"),
            job_prefix: format!("{prefix}:{queue}:job:"),
        }
    }

    /// The waiting list.
    pub fn waiting(&self) -> &str {
        &self.waiting
    }

    /// The active list.
    pub fn active(&self) -> &str {
        &self.active
    }

    /// The delayed sorted set.
    pub fn delayed(&self) -> &str {
        &self.delayed
    }

    /// The pause flag.
    pub fn paused(&self) -> &str {
        &self.paused
    }

    /// The hash key for one job record.
    pub fn job(&self, id: Uuid) -> String {
        format!("{}{id}", self.job_prefix)
    }

    /// The shared prefix of all job hash keys, as passed to the dispatch
    /// script which appends the popped id server-side.
    pub fn job_prefix(&self) -> &str {
        &self.job_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("jet", "emails");

        assert_eq!(keys.waiting(), "jet:emails:waiting");
        assert_eq!(keys.active(), "jet:emails:active");
        assert_eq!(keys.delayed(), "jet:emails:delayed");
        assert_eq!(keys.paused(), "jet:emails:paused");
        assert_eq!(keys.job_prefix(), "jet:emails:job:");
    }

    #[test]
    fn test_job_key_includes_id() {
        let keys = QueueKeys::new("jet", "emails");
        let id = Uuid::new_v4();

        assert_eq!(keys.job(id), format!("jet:emails:job:{id}"));
    }
}
