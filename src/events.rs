//! Observable event surface for queues and workers.
//!
//! Events are fanned out over an in-process broadcast channel. Only
//! `subscribe` is exposed; the underlying transport is an
//! implementation detail. Receivers see events emitted after they
//! subscribe; emission with no subscribers is a no-op.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::Job;

/// Default buffer size for event subscribers.
const DEFAULT_CAPACITY: usize = 256;

/// Payload of a `completed` event.
#[derive(Debug, Clone)]
pub enum Completion {
    /// A job finished successfully.
    Job {
        job: Box<Job>,
        result: serde_json::Value,
    },
    /// A worker reached its job budget and is shutting down.
    Summary(String),
}

/// Named signals observable on a queue or worker.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The component connected and is accepting work.
    Ready,
    /// A job was enqueued.
    Added(Box<Job>),
    /// A job record was removed.
    Removed(Uuid),
    /// The pause flag was set, or the worker stopped dispatching.
    Paused,
    /// Dispatching resumed.
    Resumed,
    /// The component shut down.
    Closed,
    /// A background loop hit an error and will continue.
    Error(String),
    /// A handler started executing a job.
    Processing(Box<Job>),
    /// An execution attempt failed.
    Failed { job: Box<Job>, error: String },
    /// A failed job was rescheduled for another attempt.
    Retrying(Box<Job>),
    /// A job completed, or a worker finished its budget.
    Completed(Completion),
}

/// Broadcast bus carrying [`QueueEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Opens a new subscription starting at the next emitted event.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Emits an event to all current subscribers.
    pub(crate) fn emit(&self, event: QueueEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let job = Job::new("t", json!({}), JobOptions::default());
        bus.emit(QueueEvent::Added(Box::new(job.clone())));

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.expect("event") {
                QueueEvent::Added(received) => assert_eq!(received.id, job.id),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.emit(QueueEvent::Ready);

        // A late subscriber only sees later events.
        let mut rx = bus.subscribe();
        bus.emit(QueueEvent::Paused);

        assert!(matches!(rx.recv().await, Ok(QueueEvent::Paused)));
    }
}
