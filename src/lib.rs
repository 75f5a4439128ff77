//! jetq: durable Redis-backed job queue and worker runtime.
//!
//! Producers enqueue typed work items; workers dequeue them, execute a
//! user-supplied handler and drive each item through a persistent
//! lifecycle (waiting -> active -> completed/failed, with delayed and
//! retry re-entry). Redis is both the shared message log and the source
//! of truth for job state, so independent producer and worker processes
//! cooperate without any peer-to-peer coordination.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────┐  add            ┌──────────────────────────┐
//!   │ Producer │ ───────────────▶│ Redis                    │
//!   │ (Queue)  │                 │  waiting / active /      │
//!   └──────────┘                 │  delayed / job hashes    │
//!                                └───────────┬──────────────┘
//!                 move_to_active / promote   │
//!                ┌───────────────────────────┤
//!                ▼                           ▼
//!          ┌──────────┐               ┌──────────┐
//!          │ Worker 1 │      ...      │ Worker N │
//!          └──────────┘               └──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jetq::{Queue, QueueConfig, Worker, WorkerConfig, JobOptions, Backoff};
//! use serde_json::json;
//!
//! let queue = Queue::new("emails", QueueConfig::default()).await?;
//! queue
//!     .add(
//!         "welcome",
//!         json!({"to": "user@example.com"}),
//!         Some(JobOptions::default()
//!             .with_attempts(3)
//!             .with_backoff(Backoff::exponential(500))),
//!     )
//!     .await?;
//!
//! let worker = Worker::new("emails", WorkerConfig::default().with_concurrency(4)).await?;
//! worker.process(|job| async move {
//!     send_email(&job.data).await?;
//!     Ok(json!({"sent": true}))
//! })?;
//! ```
//!
//! # Delivery semantics
//!
//! At-least-once: a handler may observe the same logical job more than
//! once and must be idempotent. Dispatch and delayed promotion are
//! single-script atomic, so no two workers ever claim the same id.

pub mod connection;
pub mod error;
pub mod events;
pub mod job;
pub mod keys;
pub mod queue;
pub mod scripts;
pub mod worker;

pub use connection::{close_all, RedisSettings};
pub use error::{JobError, QueueError, WorkerError};
pub use events::{Completion, EventBus, QueueEvent};
pub use job::{backoff_delay, Backoff, BackoffKind, Job, JobOptions, JobStatus};
pub use queue::{Queue, QueueConfig, QueueCounts};
pub use worker::{Worker, WorkerConfig, WorkerStats};
