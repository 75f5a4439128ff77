//! Producer side of the queue.
//!
//! A `Queue` enqueues jobs, inspects and removes records, and toggles
//! the queue-wide pause flag. It shares its Redis client with every
//! other queue and worker in the process pointed at the same endpoint.
//!
//! All multi-key writes go through MULTI/EXEC so a job record and its
//! collection membership never diverge.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::{self, RedisSettings};
use crate::error::{JobError, QueueError};
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, JobOptions};
use crate::keys::QueueKeys;

/// Configuration for a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis endpoint shared through the connection registry.
    pub connection: RedisSettings,
    /// Key prefix namespacing this deployment.
    pub prefix: String,
    /// Options applied to jobs enqueued without explicit options.
    pub default_job_options: JobOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            connection: RedisSettings::default(),
            prefix: "jet".to_string(),
            default_job_options: JobOptions::default(),
        }
    }
}

impl QueueConfig {
    /// Sets the Redis connection settings.
    pub fn with_connection(mut self, connection: RedisSettings) -> Self {
        self.connection = connection;
        self
    }

    /// Sets the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the default job options.
    pub fn with_default_job_options(mut self, opts: JobOptions) -> Self {
        self.default_job_options = opts;
        self
    }
}

/// Per-state snapshot of a queue's backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Ids awaiting dispatch.
    pub waiting: u64,
    /// Ids currently executing.
    pub active: u64,
    /// Ids scheduled for a future epoch.
    pub delayed: u64,
}

impl QueueCounts {
    /// Total ids across all non-terminal collections.
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

/// Producer handle for a named queue.
pub struct Queue {
    name: String,
    keys: QueueKeys,
    conn: ConnectionManager,
    default_job_options: JobOptions,
    events: EventBus,
    is_ready: AtomicBool,
}

impl Queue {
    /// Connects the queue through the shared connection registry.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` when the endpoint is not
    /// reachable.
    pub async fn new(name: impl Into<String>, config: QueueConfig) -> Result<Self, QueueError> {
        let name = name.into();
        let conn = connection::get_client(&config.connection).await?;

        let queue = Self {
            keys: QueueKeys::new(&config.prefix, &name),
            name,
            conn,
            default_job_options: config.default_job_options,
            events: EventBus::default(),
            is_ready: AtomicBool::new(true),
        };

        info!(queue = %queue.name, "Queue ready");
        queue.events.emit(QueueEvent::Ready);
        Ok(queue)
    }

    /// The queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens a subscription to this queue's events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Enqueues a new job.
    ///
    /// `opts` replaces the queue's default job options when provided.
    /// The job lands in the waiting list, or in the delayed set when
    /// `opts.delay > 0`. The record hash and the collection insert are
    /// one transaction.
    pub async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: Option<JobOptions>,
    ) -> Result<Job, QueueError> {
        self.ensure_ready()?;

        let opts = opts.unwrap_or_else(|| self.default_job_options.clone());
        let job = Job::new(name, data, opts);
        let blob = serde_json::to_string(&job)?;
        let id = job.id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic().hset(self.keys.job(job.id), "data", &blob);
        if job.opts.delay > 0 {
            let due = Utc::now().timestamp_millis() + job.opts.delay as i64;
            pipe.zadd(self.keys.delayed(), &id, due);
        } else {
            pipe.lpush(self.keys.waiting(), &id);
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(queue = %self.name, job_id = %job.id, job_name = %job.name, status = %job.status, "Job added");
        self.events.emit(QueueEvent::Added(Box::new(job.clone())));
        Ok(job)
    }

    /// Enqueues several jobs sharing one set of options in one pipeline.
    ///
    /// More efficient than calling [`Queue::add`] per job; emits one
    /// `added` event per job.
    pub async fn add_bulk(
        &self,
        entries: Vec<(String, serde_json::Value)>,
        opts: Option<JobOptions>,
    ) -> Result<Vec<Job>, QueueError> {
        self.ensure_ready()?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let opts = opts.unwrap_or_else(|| self.default_job_options.clone());
        let mut jobs = Vec::with_capacity(entries.len());
        let mut pipe = redis::pipe();
        pipe.atomic();

        for (name, data) in entries {
            let job = Job::new(name, data, opts.clone());
            let blob = serde_json::to_string(&job)?;
            let id = job.id.to_string();

            pipe.hset(self.keys.job(job.id), "data", &blob);
            if job.opts.delay > 0 {
                let due = Utc::now().timestamp_millis() + job.opts.delay as i64;
                pipe.zadd(self.keys.delayed(), &id, due);
            } else {
                pipe.lpush(self.keys.waiting(), &id);
            }
            jobs.push(job);
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(queue = %self.name, count = jobs.len(), "Jobs added in bulk");
        for job in &jobs {
            self.events.emit(QueueEvent::Added(Box::new(job.clone())));
        }
        Ok(jobs)
    }

    /// Reads one job record.
    ///
    /// Returns `None` when the record does not exist; a present but
    /// unparseable record is a `JobError::Malformed`.
    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        let mut conn = self.conn.clone();
        let blob: Option<String> = conn.hget(self.keys.job(id), "data").await?;

        match blob {
            Some(blob) => serde_json::from_str(&blob)
                .map(Some)
                .map_err(|source| JobError::Malformed { id, source }),
            None => Ok(None),
        }
    }

    /// Removes a job from every collection and deletes its record.
    ///
    /// Idempotent: removing an unknown id is a no-op.
    pub async fn remove_job(&self, id: Uuid) -> Result<(), QueueError> {
        let id_str = id.to_string();

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(self.keys.waiting(), 0, &id_str)
            .lrem(self.keys.active(), 0, &id_str)
            .zrem(self.keys.delayed(), &id_str)
            .del(self.keys.job(id))
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(queue = %self.name, job_id = %id, "Job removed");
        self.events.emit(QueueEvent::Removed(id));
        Ok(())
    }

    /// Sets the pause flag.
    ///
    /// A paused queue still accepts `add`; the flag gates worker
    /// dispatch only.
    pub async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.keys.paused(), 1).await?;

        info!(queue = %self.name, "Queue paused");
        self.events.emit(QueueEvent::Paused);
        Ok(())
    }

    /// Clears the pause flag.
    pub async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.keys.paused()).await?;

        info!(queue = %self.name, "Queue resumed");
        self.events.emit(QueueEvent::Resumed);
        Ok(())
    }

    /// Reads the pause flag.
    pub async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(self.keys.paused()).await?)
    }

    /// Per-state backlog counts in one pipeline.
    ///
    /// The three reads are not a single atomic snapshot: exact in
    /// quiescence, approximate under load.
    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed): (u64, u64, u64) = redis::pipe()
            .llen(self.keys.waiting())
            .llen(self.keys.active())
            .zcard(self.keys.delayed())
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            waiting,
            active,
            delayed,
        })
    }

    /// Total backlog across waiting, active and delayed.
    pub async fn count(&self) -> Result<u64, QueueError> {
        Ok(self.counts().await?.total())
    }

    /// Deletes every key owned by this queue.
    ///
    /// **Warning**: permanently removes all job records and collection
    /// state, including the pause flag.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let waiting_ids: Vec<String> = conn.lrange(self.keys.waiting(), 0, -1).await?;
        let active_ids: Vec<String> = conn.lrange(self.keys.active(), 0, -1).await?;
        let delayed_ids: Vec<String> = conn.zrange(self.keys.delayed(), 0, -1).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in waiting_ids.iter().chain(&active_ids).chain(&delayed_ids) {
            pipe.del(format!("{}{id}", self.keys.job_prefix()));
        }
        pipe.del(self.keys.waiting())
            .del(self.keys.active())
            .del(self.keys.delayed())
            .del(self.keys.paused());
        pipe.query_async::<_, ()>(&mut conn).await?;

        info!(queue = %self.name, "Queue cleared");
        Ok(())
    }

    /// Marks the producer closed.
    ///
    /// Further operations fail with `QueueError::NotReady`. The shared
    /// client stays with the connection registry.
    pub fn close(&self) {
        if self.is_ready.swap(false, Ordering::SeqCst) {
            info!(queue = %self.name, "Queue closed");
            self.events.emit(QueueEvent::Closed);
        }
    }

    fn ensure_ready(&self) -> Result<(), QueueError> {
        if self.is_ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::NotReady(self.name.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();

        assert_eq!(config.connection, RedisSettings::default());
        assert_eq!(config.prefix, "jet");
        assert_eq!(config.default_job_options, JobOptions::default());
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::default()
            .with_connection(RedisSettings::new("cache.internal", 6380))
            .with_prefix("app")
            .with_default_job_options(JobOptions::default().with_attempts(5));

        assert_eq!(config.connection.host, "cache.internal");
        assert_eq!(config.prefix, "app");
        assert_eq!(config.default_job_options.attempts, 5);
    }

    #[test]
    fn test_queue_counts_total() {
        let counts = QueueCounts {
            waiting: 3,
            active: 2,
            delayed: 1,
        };

        assert_eq!(counts.total(), 6);
        assert_eq!(QueueCounts::default().total(), 0);
    }
}
