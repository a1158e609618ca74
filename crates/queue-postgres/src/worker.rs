//! Worker runtime: a polling loop that fetches a batch, hands each job to
//! a caller-supplied handler, and writes the outcome back through the
//! [`JobStore`]. One [`Worker`] drives exactly one queue.
//!
//! State machine: `created → active → stopping → stopped`. `stop()` never
//! aborts an in-flight batch — it flips to `stopping`, lets the current
//! batch finish, and the loop exits on its next iteration.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use queue_core::{EventBus, FetchOptions, Job, JobId, JobStore, QueueEvent};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a handler decided for a single job. Replaces a polymorphic
/// callback return with a closed, two-armed sum: a job either completed
/// with an output, or failed with a reason.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Complete(Option<Value>),
    Fail(Option<Value>),
}

type HandlerFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

/// A per-job handler. Boxed so a `Worker` can be built generically over
/// any closure or async function without an extra type parameter leaking
/// into every other signature in this module.
pub type JobHandler = Arc<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Active = 1,
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Active,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Tunables for a single worker, independent of the store-wide defaults in
/// [`queue_core::QueueManagerConfig`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub fetch: FetchOptions,
    pub poll_interval: StdDuration,
    /// Per-job handler timeout. A handler that doesn't resolve within this
    /// window is treated as a `Fail` with a timeout reason.
    pub job_timeout: StdDuration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            fetch: FetchOptions::default(),
            poll_interval: StdDuration::from_secs(2),
            job_timeout: StdDuration::from_secs(900),
        }
    }
}

/// A live handle to a running worker: wake it early, or ask it to stop.
/// Cloning is cheap; every clone controls the same worker.
#[derive(Clone)]
pub struct WorkerHandle {
    id: Uuid,
    state: Arc<AtomicU8>,
    notify: Arc<Notify>,
}

impl WorkerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    /// Wake the worker immediately instead of waiting out its poll
    /// interval. Used after a `send` targeting the worker's queue.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Request a graceful stop. The current batch (if any) finishes first.
    pub fn stop(&self) {
        self.state.store(WorkerState::Stopping as u8, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Spawns the polling loop and returns a handle plus its [`JoinHandle`].
/// The task exits once `stop()` has been called and the in-flight batch
/// (if any) has finished; callers that need graceful shutdown should
/// `await` the returned `JoinHandle` after calling `stop()`.
pub fn spawn(
    store: Arc<dyn JobStore>,
    events: EventBus,
    queue: impl Into<String>,
    handler: JobHandler,
    opts: WorkerOptions,
) -> (WorkerHandle, JoinHandle<()>) {
    let id = Uuid::new_v4();
    let state = Arc::new(AtomicU8::new(WorkerState::Created as u8));
    let notify = Arc::new(Notify::new());
    let queue = queue.into();

    let handle = WorkerHandle {
        id,
        state: state.clone(),
        notify: notify.clone(),
    };

    let join = tokio::spawn(run_loop(id, store, events, queue, handler, opts, state, notify));

    (handle, join)
}

async fn run_loop(
    id: Uuid,
    store: Arc<dyn JobStore>,
    events: EventBus,
    queue: String,
    handler: JobHandler,
    opts: WorkerOptions,
    state: Arc<AtomicU8>,
    notify: Arc<Notify>,
) {
    state.store(WorkerState::Active as u8, Ordering::Release);

    loop {
        if WorkerState::from(state.load(Ordering::Acquire)) == WorkerState::Stopping {
            break;
        }

        match store.fetch(&queue, opts.fetch.clone()).await {
            Ok(jobs) if jobs.is_empty() => {}
            Ok(jobs) => {
                events.emit(QueueEvent::Wip {
                    worker_id: id,
                    queue: queue.clone(),
                    count: jobs.len(),
                });
                run_batch(&*store, &events, id, &queue, &handler, jobs, opts.job_timeout).await;
            }
            Err(e) => {
                warn!(worker_id = %id, queue = %queue, error = %e, "fetch failed");
                if e.is_observable() {
                    events.emit(QueueEvent::Error { message: e.to_string() });
                }
            }
        }

        if WorkerState::from(state.load(Ordering::Acquire)) == WorkerState::Stopping {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(opts.poll_interval) => {}
            _ = notify.notified() => {}
        }
    }

    state.store(WorkerState::Stopped as u8, Ordering::Release);
    events.emit(QueueEvent::Stop { worker_id: id });
    debug!(worker_id = %id, queue = %queue, "worker stopped");
}

async fn run_batch(
    store: &dyn JobStore,
    events: &EventBus,
    worker_id: Uuid,
    queue: &str,
    handler: &JobHandler,
    jobs: Vec<Job>,
    timeout: StdDuration,
) {
    events.emit(QueueEvent::Work {
        worker_id,
        queue: queue.to_string(),
        count: jobs.len(),
    });

    let mut completed: Vec<(JobId, Option<Value>)> = Vec::new();
    let mut failed: Vec<(Job, Option<Value>)> = Vec::new();

    for job in jobs {
        let id = job.id;
        let outcome = match tokio::time::timeout(timeout, handler(job.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::Fail(Some(Value::String("handler timed out".to_string()))),
        };

        match outcome {
            JobOutcome::Complete(output) => completed.push((id, output)),
            JobOutcome::Fail(output) => failed.push((job, output)),
        }

        events.emit(QueueEvent::Job {
            id,
            queue: queue.to_string(),
            state: "settling".to_string(),
        });
    }

    if !completed.is_empty() {
        // Each completed job may carry a distinct output, so this commits
        // one at a time rather than batching a single UPDATE.
        for (id, output) in completed {
            if let Err(e) = store.complete(&[id], output).await {
                warn!(job_id = %id, error = %e, "failed to mark job completed");
            } else {
                events.emit(QueueEvent::Job {
                    id,
                    queue: queue.to_string(),
                    state: "completed".to_string(),
                });
            }
        }
    }

    for (job, output) in failed {
        settle_failure(store, events, queue, job, output).await;
    }
}

async fn settle_failure(store: &dyn JobStore, events: &EventBus, queue: &str, job: Job, output: Option<Value>) {
    let id = job.id;

    if !job.retries_exhausted() {
        if let Err(e) = store.retry(&[id]).await {
            warn!(job_id = %id, error = %e, "failed to schedule retry");
        } else {
            events.emit(QueueEvent::Job {
                id,
                queue: queue.to_string(),
                state: "retry".to_string(),
            });
        }
        return;
    }

    if let Some(dead_letter) = job.dead_letter.clone() {
        let dlq_data = job.data.clone();
        if let Err(e) = store
            .send(&dead_letter, dlq_data, queue_core::SendOptions::default())
            .await
        {
            warn!(job_id = %id, dead_letter = %dead_letter, error = %e, "failed to route to dead letter queue");
        }
    }

    match store.fail(&[id], output).await {
        Ok(_) => events.emit(QueueEvent::Job {
            id,
            queue: queue.to_string(),
            state: "failed".to_string(),
        }),
        Err(e) => warn!(job_id = %id, error = %e, "failed to mark job failed"),
    }
}

/// Boxes a plain async closure into a [`JobHandler`]. Handlers written as
/// `|job| async move { .. }` need this to satisfy the trait object's
/// pinned-future return type.
pub fn handler_fn<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    Arc::new(move |job| Box::pin(f(job)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_state_round_trips_through_u8() {
        for state in [
            WorkerState::Created,
            WorkerState::Active,
            WorkerState::Stopping,
            WorkerState::Stopped,
        ] {
            assert_eq!(WorkerState::from(state as u8), state);
        }
    }
}
