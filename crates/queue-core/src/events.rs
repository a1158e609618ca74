//! Typed replacement for the source's named event-emitter streams. Each
//! variant carries a fixed-shape payload; subscribers register explicitly
//! via [`EventBus::subscribe`] instead of listening on a string-keyed bus.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One of the named signals the manager, worker runtime, supervisor, and
/// timekeeper emit.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A storage or callback error worth surfacing to an operator.
    /// Validation failures never produce this event (see
    /// [`crate::error::QueueError::is_observable`]).
    Error { message: String },
    /// A batch of jobs is currently in flight on a worker.
    Wip { worker_id: Uuid, queue: String, count: usize },
    /// A job transitioned to a terminal state.
    Job { id: Uuid, queue: String, state: String },
    /// A job (or batch) was inserted.
    Insert { ids: Vec<Uuid>, queue: String },
    /// A worker claimed a batch and is about to invoke the callback.
    Work { worker_id: Uuid, queue: String, count: usize },
    /// A worker was asked to stop.
    Stop { worker_id: Uuid },
    /// The maintenance tick completed a pass.
    Maintenance { expired: u64, archived: u64, dropped: u64 },
    /// The monitor tick completed a pass.
    MonitorStates {
        by_queue_state: Vec<(String, String, i64)>,
        by_state: Vec<(String, i64)>,
        total: i64,
    },
    /// A schedule was created or updated.
    Schedule { name: String, cron: String, timezone: String },
    /// Instance-vs-database clock skew crossed the alert threshold.
    ClockSkew { delta: chrono::Duration, measured_at: DateTime<Utc> },
    /// The façade finished graceful shutdown.
    Stopped,
}

/// A broadcast-backed typed event bus. Cloning is cheap (it clones the
/// sender handle); every clone publishes to the same set of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// `capacity` bounds how many unconsumed events a slow subscriber may
    /// lag behind before it starts missing them (at-most-once delivery,
    /// matching the in-memory event guarantees documented for this layer).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    /// Register a new subscriber. Each call returns an independent
    /// receiver; dropping it unsubscribes.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Never fails: with zero subscribers this is a
    /// no-op (the broadcast channel's send error is intentionally
    /// swallowed, matching the source's fire-and-forget emit).
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(QueueEvent::Stopped);
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, QueueEvent::Stopped));
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(QueueEvent::Stopped);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_their_own_copy() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(QueueEvent::Error {
            message: "boom".into(),
        });
        assert!(matches!(a.recv().await.unwrap(), QueueEvent::Error { .. }));
        assert!(matches!(b.recv().await.unwrap(), QueueEvent::Error { .. }));
    }
}
