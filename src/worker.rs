//! Worker runtime: bounded parallel job execution.
//!
//! A `Worker` owns two cooperative loops sharing one running flag:
//!
//! - the **dispatcher** atomically claims waiting ids and executes the
//!   installed handler with up to `concurrency` jobs in flight
//! - the **promoter** moves due delayed ids back into the waiting list
//!   once per tick
//!
//! Handler failures feed the retry path and never terminate the loops;
//! Redis errors are reported on the event bus and the loops continue
//! after a short sleep. Workers on different hosts coordinate only
//! through Redis.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{self, RedisSettings};
use crate::error::WorkerError;
use crate::events::{Completion, EventBus, QueueEvent};
use crate::job::{backoff_delay, Job, JobStatus};
use crate::keys::QueueKeys;
use crate::scripts::Scripts;

/// Dispatcher sleep when the waiting list is empty or the queue paused.
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Promoter tick, also its backoff after an error.
const PROMOTE_INTERVAL: Duration = Duration::from_millis(1000);

/// Drain window between signalling shutdown and returning from close.
const QUIESCE_DELAY: Duration = Duration::from_millis(50);

/// Job handler installed via [`Worker::process`].
type Handler =
    Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Redis endpoint shared through the connection registry.
    pub connection: RedisSettings,
    /// Key prefix; must match the producer's.
    pub prefix: String,
    /// Maximum number of jobs executing simultaneously.
    pub concurrency: usize,
    /// Job budget after which the worker shuts itself down;
    /// `None` means unbounded.
    pub max_jobs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            connection: RedisSettings::default(),
            prefix: "jet".to_string(),
            concurrency: 1,
            max_jobs: None,
        }
    }
}

impl WorkerConfig {
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

    /// Sets the number of jobs allowed in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the job budget.
    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }
}

/// Snapshot of a worker's terminal outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs that reached `completed`.
    pub jobs_completed: u64,
    /// Jobs that reached terminal `failed`.
    pub jobs_failed: u64,
}

impl WorkerStats {
    /// Total terminal outcomes observed by this worker.
    pub fn total(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }
}

/// State shared between the worker handle and its spawned loops.
struct Shared {
    is_running: AtomicBool,
    closed: AtomicBool,
    budget_hit: AtomicBool,
    /// Bumped on resume so stale loops from a previous run exit.
    epoch: AtomicU64,
    /// Dispatched jobs plus promoted ids, measured against `max_jobs`.
    processed: AtomicU64,
    handler: OnceLock<Handler>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            is_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            budget_hit: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            handler: OnceLock::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Counts `n` units against the job budget. On reaching the budget
    /// the running flag is cleared so both loops wind down; returns
    /// whether this call crossed the line.
    fn note_processed(&self, n: u64, max_jobs: Option<u64>) -> bool {
        if n == 0 {
            return false;
        }
        let total = self.processed.fetch_add(n, Ordering::SeqCst) + n;
        if let Some(max) = max_jobs {
            if total >= max && !self.budget_hit.swap(true, Ordering::SeqCst) {
                self.is_running.store(false, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    fn running_at(&self, epoch: u64) -> bool {
        self.is_running.load(Ordering::SeqCst) && self.epoch.load(Ordering::SeqCst) == epoch
    }
}

/// Everything a loop needs, cheap to clone into spawned tasks.
#[derive(Clone)]
struct LoopCtx {
    queue_name: String,
    keys: QueueKeys,
    conn: ConnectionManager,
    scripts: Scripts,
    events: EventBus,
    shared: Arc<Shared>,
    concurrency: usize,
    max_jobs: Option<u64>,
}

/// Consumer handle for a named queue.
pub struct Worker {
    queue_name: String,
    config: WorkerConfig,
    conn: ConnectionManager,
    scripts: Scripts,
    keys: QueueKeys,
    events: EventBus,
    shared: Arc<Shared>,
}

impl Worker {
    /// Connects the worker through the shared connection registry.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::InitFailed` when the endpoint is not
    /// reachable.
    pub async fn new(
        queue_name: impl Into<String>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let queue_name = queue_name.into();
        let conn = connection::get_client(&config.connection)
            .await
            .map_err(|e| WorkerError::InitFailed(e.to_string()))?;

        let worker = Self {
            keys: QueueKeys::new(&config.prefix, &queue_name),
            queue_name,
            config,
            conn,
            scripts: Scripts::new(),
            events: EventBus::default(),
            shared: Arc::new(Shared::new()),
        };

        info!(queue = %worker.queue_name, concurrency = worker.config.concurrency, "Worker ready");
        worker.events.emit(QueueEvent::Ready);
        Ok(worker)
    }

    /// The queue this worker consumes.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Opens a subscription to this worker's events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Whether the loops are currently accepting work.
    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    /// Terminal outcome counters.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            jobs_completed: self.shared.completed.load(Ordering::SeqCst),
            jobs_failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }

    /// Installs the job handler and starts the dispatcher and promoter
    /// loops.
    ///
    /// The handler runs at-least-once per enqueued job and must be
    /// idempotent. A handler that exceeds `opts.timeout` is abandoned
    /// (its task keeps running detached) and the attempt is failed with
    /// `"Job timeout"`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::HandlerAlreadyRegistered` on a second
    /// install.
    pub fn process<F, Fut>(&self, handler: F) -> Result<(), WorkerError>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |job| Box::pin(handler(job)));
        self.shared
            .handler
            .set(handler)
            .map_err(|_| WorkerError::HandlerAlreadyRegistered)?;

        self.shared.is_running.store(true, Ordering::SeqCst);
        self.spawn_loops();
        Ok(())
    }

    /// Stops claiming new work; in-flight jobs run to completion.
    pub fn pause(&self) {
        if self.shared.is_running.swap(false, Ordering::SeqCst) {
            info!(queue = %self.queue_name, "Worker paused");
            self.events.emit(QueueEvent::Paused);
        }
    }

    /// Restarts the loops after a pause.
    ///
    /// A no-op when already running or when no handler is installed.
    pub fn resume(&self) {
        if self.shared.handler.get().is_none() {
            return;
        }
        if !self.shared.is_running.swap(true, Ordering::SeqCst) {
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            info!(queue = %self.queue_name, "Worker resumed");
            self.events.emit(QueueEvent::Resumed);
            self.spawn_loops();
        }
    }

    /// Shuts the worker down.
    ///
    /// Clears the running flag, emits `closed` on the first call and
    /// waits a short quiesce window. The shared Redis client stays with
    /// the connection registry. Safe to call multiple times.
    pub async fn close(&self) {
        self.shared.is_running.store(false, Ordering::SeqCst);
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.queue_name, "Worker closed");
            self.events.emit(QueueEvent::Closed);
        }
        tokio::time::sleep(QUIESCE_DELAY).await;
    }

    fn spawn_loops(&self) {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let ctx = LoopCtx {
            queue_name: self.queue_name.clone(),
            keys: self.keys.clone(),
            conn: self.conn.clone(),
            scripts: self.scripts.clone(),
            events: self.events.clone(),
            shared: Arc::clone(&self.shared),
            concurrency: self.config.concurrency,
            max_jobs: self.config.max_jobs,
        };

        tokio::spawn(dispatcher_loop(ctx.clone(), epoch));
        tokio::spawn(promoter_loop(ctx, epoch));
    }
}

/// Claims waiting ids and executes them with bounded parallelism.
async fn dispatcher_loop(ctx: LoopCtx, epoch: u64) {
    let Some(handler) = ctx.shared.handler.get().cloned() else {
        return;
    };

    info!(queue = %ctx.queue_name, "Dispatcher started");
    let mut conn = ctx.conn.clone();
    let mut in_flight: JoinSet<()> = JoinSet::new();

    while ctx.shared.running_at(epoch) {
        while in_flight.len() >= ctx.concurrency {
            if let Some(Err(e)) = in_flight.join_next().await {
                error!(queue = %ctx.queue_name, error = %e, "Job task panicked");
            }
        }
        if !ctx.shared.running_at(epoch) {
            break;
        }

        match conn.exists::<_, bool>(ctx.keys.paused()).await {
            Ok(true) => {
                tokio::time::sleep(IDLE_INTERVAL).await;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                ctx.events.emit(QueueEvent::Error(e.to_string()));
                tokio::time::sleep(IDLE_INTERVAL).await;
                continue;
            }
        }

        let now = Utc::now().timestamp_millis();
        match ctx.scripts.move_to_active(&mut conn, &ctx.keys, now).await {
            Ok(Some(id)) => {
                ctx.shared.note_processed(1, ctx.max_jobs);
                let job_ctx = ctx.clone();
                let job_handler = handler.clone();
                in_flight.spawn(async move {
                    execute_job(job_ctx, job_handler, id).await;
                });
            }
            Ok(None) => tokio::time::sleep(IDLE_INTERVAL).await,
            Err(e) => {
                error!(queue = %ctx.queue_name, error = %e, "Dispatch failed");
                ctx.events.emit(QueueEvent::Error(e.to_string()));
                tokio::time::sleep(IDLE_INTERVAL).await;
            }
        }
    }

    // In-flight jobs always drain; JoinSet would abort them on drop.
    while let Some(res) = in_flight.join_next().await {
        if let Err(e) = res {
            error!(queue = %ctx.queue_name, error = %e, "Job task panicked");
        }
    }

    if ctx.shared.budget_hit.load(Ordering::SeqCst) {
        let processed = ctx.shared.processed.load(Ordering::SeqCst);
        let message = format!("Job budget reached after {processed} jobs");
        info!(queue = %ctx.queue_name, processed, "Worker reached its job budget");
        ctx.events
            .emit(QueueEvent::Completed(Completion::Summary(message)));
        if !ctx.shared.closed.swap(true, Ordering::SeqCst) {
            ctx.events.emit(QueueEvent::Closed);
        }
    }

    info!(queue = %ctx.queue_name, "Dispatcher stopped");
}

/// Promotes due delayed ids into the waiting list once per tick.
async fn promoter_loop(ctx: LoopCtx, epoch: u64) {
    info!(queue = %ctx.queue_name, "Promoter started");
    let mut conn = ctx.conn.clone();

    while ctx.shared.running_at(epoch) {
        let now = Utc::now().timestamp_millis();
        match ctx
            .scripts
            .promote_delayed(&mut conn, &ctx.keys, now)
            .await
        {
            Ok(ids) => {
                if !ids.is_empty() {
                    debug!(queue = %ctx.queue_name, count = ids.len(), "Promoted delayed jobs");
                    ctx.shared.note_processed(ids.len() as u64, ctx.max_jobs);
                }
            }
            Err(e) => {
                error!(queue = %ctx.queue_name, error = %e, "Promotion failed");
                ctx.events.emit(QueueEvent::Error(e.to_string()));
            }
        }
        tokio::time::sleep(PROMOTE_INTERVAL).await;
    }

    info!(queue = %ctx.queue_name, "Promoter stopped");
}

/// Runs one claimed job through handler execution and the terminal
/// write.
async fn execute_job(ctx: LoopCtx, handler: Handler, id: Uuid) {
    let mut conn = ctx.conn.clone();
    let job_key = ctx.keys.job(id);

    let blob: Option<String> = match conn.hget(&job_key, "data").await {
        Ok(blob) => blob,
        Err(e) => {
            ctx.events.emit(QueueEvent::Error(e.to_string()));
            return;
        }
    };

    // Removed while in flight: the caller asked for deletion, drop it.
    let Some(blob) = blob else {
        debug!(queue = %ctx.queue_name, job_id = %id, "Job record gone; dropping");
        return;
    };

    let mut job: Job = match serde_json::from_str(&blob) {
        Ok(job) => job,
        Err(e) => {
            warn!(queue = %ctx.queue_name, job_id = %id, error = %e, "Dropping malformed job record");
            ctx.events
                .emit(QueueEvent::Error(format!("malformed job record {id}: {e}")));
            let _ = conn
                .lrem::<_, _, ()>(ctx.keys.active(), 0, id.to_string())
                .await;
            return;
        }
    };

    job.status = JobStatus::Active;
    info!(
        queue = %ctx.queue_name,
        job_id = %job.id,
        job_name = %job.name,
        attempt = job.attempts_made + 1,
        "Processing job"
    );
    ctx.events
        .emit(QueueEvent::Processing(Box::new(job.clone())));

    // The handler runs on its own task so a timeout abandons it instead
    // of cancelling it; handlers must watch their own deadline to stop
    // early.
    let mut handle = tokio::spawn(handler(job.clone()));
    let outcome = if job.opts.timeout > 0 {
        match tokio::time::timeout(Duration::from_millis(job.opts.timeout), &mut handle).await {
            Ok(joined) => flatten_handler_result(joined),
            Err(_) => Err(WorkerError::JobTimeout.to_string()),
        }
    } else {
        flatten_handler_result(handle.await)
    };

    match outcome {
        Ok(value) => complete_job(&ctx, &mut conn, job, value).await,
        Err(reason) => fail_job(&ctx, &mut conn, job, reason).await,
    }
}

fn flatten_handler_result(
    joined: Result<anyhow::Result<serde_json::Value>, tokio::task::JoinError>,
) -> Result<serde_json::Value, String> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("handler panicked: {e}")),
    }
}

/// Returns whether the record still exists; a record removed mid-flight
/// must not be resurrected by a terminal write, nor reported on.
async fn record_still_exists(
    ctx: &LoopCtx,
    conn: &mut ConnectionManager,
    job: &Job,
    job_key: &str,
) -> bool {
    match conn.exists::<_, bool>(job_key).await {
        Ok(true) => true,
        Ok(false) => {
            debug!(queue = %ctx.queue_name, job_id = %job.id, "Job removed mid-flight; dropping outcome");
            false
        }
        Err(e) => {
            ctx.events.emit(QueueEvent::Error(e.to_string()));
            false
        }
    }
}

/// Terminal success: record the result and leave the active list.
async fn complete_job(
    ctx: &LoopCtx,
    conn: &mut ConnectionManager,
    mut job: Job,
    value: serde_json::Value,
) {
    job.status = JobStatus::Completed;
    job.return_value = Some(value.clone());

    let id_str = job.id.to_string();
    let job_key = ctx.keys.job(job.id);
    if !record_still_exists(ctx, conn, &job, &job_key).await {
        return;
    }
    let mut pipe = redis::pipe();
    pipe.atomic().lrem(ctx.keys.active(), 0, &id_str);
    if job.opts.remove_on_complete {
        pipe.del(&job_key);
    } else {
        match serde_json::to_string(&job) {
            Ok(blob) => {
                pipe.hset(&job_key, "data", blob);
            }
            Err(e) => {
                ctx.events.emit(QueueEvent::Error(e.to_string()));
                return;
            }
        }
    }

    if let Err(e) = pipe.query_async::<_, ()>(conn).await {
        error!(queue = %ctx.queue_name, job_id = %job.id, error = %e, "Failed to finalize job");
        ctx.events.emit(QueueEvent::Error(e.to_string()));
        return;
    }

    ctx.shared.completed.fetch_add(1, Ordering::SeqCst);
    info!(queue = %ctx.queue_name, job_id = %job.id, "Job completed");
    ctx.events.emit(QueueEvent::Completed(Completion::Job {
        job: Box::new(job),
        result: value,
    }));
}

/// Failure path: reschedule with backoff while attempts remain,
/// otherwise finish as failed.
async fn fail_job(ctx: &LoopCtx, conn: &mut ConnectionManager, mut job: Job, reason: String) {
    job.record_failure(reason.clone());

    let id_str = job.id.to_string();
    let job_key = ctx.keys.job(job.id);
    if !record_still_exists(ctx, conn, &job, &job_key).await {
        return;
    }

    if job.should_retry() {
        let delay = backoff_delay(job.attempts_made, &job.opts);
        let due = Utc::now().timestamp_millis() + delay as i64;
        job.status = JobStatus::Delayed;

        let blob = match serde_json::to_string(&job) {
            Ok(blob) => blob,
            Err(e) => {
                ctx.events.emit(QueueEvent::Error(e.to_string()));
                return;
            }
        };

        let result = redis::pipe()
            .atomic()
            .zadd(ctx.keys.delayed(), &id_str, due)
            .hset(&job_key, "data", blob)
            .lrem(ctx.keys.active(), 0, &id_str)
            .query_async::<_, ()>(conn)
            .await;
        if let Err(e) = result {
            error!(queue = %ctx.queue_name, job_id = %job.id, error = %e, "Failed to schedule retry");
            ctx.events.emit(QueueEvent::Error(e.to_string()));
            return;
        }

        warn!(
            queue = %ctx.queue_name,
            job_id = %job.id,
            attempt = job.attempts_made,
            retry_in_ms = delay,
            error = %reason,
            "Job failed, retrying"
        );
        ctx.events.emit(QueueEvent::Failed {
            job: Box::new(job.clone()),
            error: reason,
        });
        ctx.events.emit(QueueEvent::Retrying(Box::new(job)));
        return;
    }

    job.status = JobStatus::Failed;
    let mut pipe = redis::pipe();
    pipe.atomic().lrem(ctx.keys.active(), 0, &id_str);
    if job.opts.remove_on_fail {
        pipe.del(&job_key);
    } else {
        match serde_json::to_string(&job) {
            Ok(blob) => {
                pipe.hset(&job_key, "data", blob);
            }
            Err(e) => {
                ctx.events.emit(QueueEvent::Error(e.to_string()));
                return;
            }
        }
    }

    if let Err(e) = pipe.query_async::<_, ()>(conn).await {
        error!(queue = %ctx.queue_name, job_id = %job.id, error = %e, "Failed to finalize job");
        ctx.events.emit(QueueEvent::Error(e.to_string()));
        return;
    }

    ctx.shared.failed.fetch_add(1, Ordering::SeqCst);
    error!(
        queue = %ctx.queue_name,
        job_id = %job.id,
        attempts = job.attempts_made,
        error = %reason,
        "Job failed terminally"
    );
    ctx.events.emit(QueueEvent::Failed {
        job: Box::new(job),
        error: reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();

        assert_eq!(config.connection, RedisSettings::default());
        assert_eq!(config.prefix, "jet");
        assert_eq!(config.concurrency, 1);
        assert!(config.max_jobs.is_none());
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_connection(RedisSettings::new("cache.internal", 6380))
            .with_prefix("app")
            .with_concurrency(8)
            .with_max_jobs(100);

        assert_eq!(config.connection.port, 6380);
        assert_eq!(config.prefix, "app");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_jobs, Some(100));
    }

    #[test]
    fn test_worker_config_concurrency_floor() {
        let config = WorkerConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn test_worker_stats_total() {
        let stats = WorkerStats {
            jobs_completed: 8,
            jobs_failed: 2,
        };
        assert_eq!(stats.total(), 10);
    }

    #[test]
    fn test_note_processed_without_budget() {
        let shared = Shared::new();
        shared.is_running.store(true, Ordering::SeqCst);

        assert!(!shared.note_processed(10, None));
        assert!(shared.is_running.load(Ordering::SeqCst));
        assert!(!shared.budget_hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_note_processed_budget_trips_once() {
        let shared = Shared::new();
        shared.is_running.store(true, Ordering::SeqCst);

        assert!(!shared.note_processed(2, Some(5)));
        assert!(shared.is_running.load(Ordering::SeqCst));

        assert!(shared.note_processed(3, Some(5)));
        assert!(!shared.is_running.load(Ordering::SeqCst));
        assert!(shared.budget_hit.load(Ordering::SeqCst));

        // Already tripped: further counting does not re-trigger.
        assert!(!shared.note_processed(1, Some(5)));
    }

    #[test]
    fn test_note_processed_zero_is_noop() {
        let shared = Shared::new();
        shared.is_running.store(true, Ordering::SeqCst);

        assert!(!shared.note_processed(0, Some(0)));
        assert!(shared.is_running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_running_at_respects_epoch() {
        let shared = Shared::new();
        shared.is_running.store(true, Ordering::SeqCst);

        assert!(shared.running_at(0));
        shared.epoch.fetch_add(1, Ordering::SeqCst);
        assert!(!shared.running_at(0));
        assert!(shared.running_at(1));
    }
}
