//! The storage-agnostic operation surface. A concrete backend (the
//! `queue-postgres` crate's `PgJobStore`) implements this trait; everything
//! above this layer — the worker runtime, the supervisor, the timekeeper,
//! demo binaries — talks only to `dyn JobStore`.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueueResult;
use crate::model::{Job, JobId, Queue};
use crate::options::{FetchOptions, QueueOptions, SendOptions};

/// Aggregate counts for a single queue, as returned by `get_queue_size`
/// and surfaced by monitoring tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub created: i64,
    pub retry: i64,
    pub active: i64,
    pub completed: i64,
    pub cancelled: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.created + self.retry + self.active + self.completed + self.cancelled + self.failed
    }
}

/// The queue & job manager's operation surface (§4.1 of the design).
///
/// Implementors own the backing store entirely: every method is a single
/// short, statement-scoped transaction (or a single statement), matching
/// the "no long-held locks" shared-resource policy.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a single job, returning its id, or `None` when a singleton
    /// conflict silently absorbed the send.
    async fn send(&self, queue: &str, data: Option<Value>, opts: SendOptions) -> QueueResult<Option<JobId>>;

    /// Bulk variant of `send`, used for fan-out (e.g. `publish`). Rows
    /// that lose a singleton race are simply omitted from the result.
    async fn insert(&self, queue: &str, jobs: Vec<(Option<Value>, SendOptions)>) -> QueueResult<Vec<JobId>>;

    /// Atomically claim up to `batch_size` fetchable rows and transition
    /// them to `active`. Returns an empty vector, never an error, when the
    /// claim lost a lock-wait race (see [`crate::error::QueueError::ClaimContention`],
    /// which backends catch internally rather than propagate here).
    async fn fetch(&self, queue: &str, opts: FetchOptions) -> QueueResult<Vec<Job>>;

    /// Transition the given jobs to `completed`, recording `output`.
    /// Returns the number of rows actually transitioned.
    async fn complete(&self, ids: &[JobId], output: Option<Value>) -> QueueResult<u64>;

    /// Transition the given jobs to `failed`, recording `output`. Does
    /// not perform retry bookkeeping — callers wanting a retry call
    /// [`JobStore::retry`] instead (or rely on the supervisor's timeout
    /// path, which calls this directly).
    async fn fail(&self, ids: &[JobId], output: Option<Value>) -> QueueResult<u64>;

    /// Transition any non-terminal job to `cancelled`.
    async fn cancel(&self, ids: &[JobId]) -> QueueResult<u64>;

    /// Transition `cancelled` jobs back to `created`, clearing
    /// `started_on`/`completed_on`. No effect on jobs in any other state.
    async fn resume(&self, ids: &[JobId]) -> QueueResult<u64>;

    /// Transition jobs to `retry`, incrementing `retry_count` and
    /// advancing `start_after` by the queue's configured backoff.
    async fn retry(&self, ids: &[JobId]) -> QueueResult<u64>;

    /// Hard-delete job rows.
    async fn delete_job(&self, ids: &[JobId]) -> QueueResult<u64>;

    /// Look up a single job by id, scoped to `queue`. Optionally falls
    /// back to the archive table when not found live.
    async fn get_job_by_id(&self, queue: &str, id: JobId, include_archive: bool) -> QueueResult<Option<Job>>;

    /// Fan out a `send` to every queue subscribed to `event`.
    async fn publish(&self, event: &str, data: Option<Value>, opts: SendOptions) -> QueueResult<Vec<JobId>>;

    /// Bind `queue` to `event`. Idempotent.
    async fn subscribe(&self, event: &str, queue: &str) -> QueueResult<()>;

    /// Unbind `queue` from `event`. Idempotent.
    async fn unsubscribe(&self, event: &str, queue: &str) -> QueueResult<()>;

    async fn create_queue(&self, name: &str, opts: QueueOptions) -> QueueResult<()>;

    async fn update_queue(&self, name: &str, opts: QueueOptions) -> QueueResult<()>;

    /// Delete a queue's metadata row. Cascades to its schedules and
    /// subscriptions, but leaves existing job rows untouched — those are
    /// purged separately via `purge_queue`.
    async fn delete_queue(&self, name: &str) -> QueueResult<()>;

    async fn get_queue(&self, name: &str) -> QueueResult<Option<Queue>>;

    async fn get_queues(&self) -> QueueResult<Vec<Queue>>;

    async fn get_queue_size(&self, name: &str) -> QueueResult<QueueStats>;

    /// Delete every job row belonging to `queue`. Queue metadata, and any
    /// schedule/subscription referencing it, is left intact.
    async fn purge_queue(&self, name: &str) -> QueueResult<u64>;

    /// Truncate every table: queues, jobs, archive, schedules,
    /// subscriptions.
    async fn clear_storage(&self) -> QueueResult<()>;
}
