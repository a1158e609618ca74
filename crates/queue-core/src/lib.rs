//! # queue-core
//!
//! Domain model, admission validation, configuration, error taxonomy, and
//! the storage-agnostic [`JobStore`] trait for a durable,
//! relational-database-backed job queue.
//!
//! The database is the single source of truth for job state; this crate
//! has no opinion about *which* database backs it — that's
//! `queue-postgres`'s job. What lives here is everything a backend, a
//! worker runtime, a supervisor, or a timekeeper needs to agree on:
//!
//! - [`Job`]/[`Queue`]/[`Schedule`]/[`Subscription`]/[`Version`] — the five
//!   logical tables.
//! - [`JobState`]/[`QueuePolicy`] — the enumerations that drive the state
//!   machine and admission policy.
//! - [`validate`] — the admission validator: queue names, durations,
//!   singleton keys, cron expressions.
//! - [`options`] — closed-set configuration structs for every operation
//!   that takes options (`send`, `fetch`, `createQueue`, `schedule`), in
//!   place of free-form option bags.
//! - [`QueueError`] — the error taxonomy every backend maps its native
//!   errors onto.
//! - [`QueueEvent`]/[`EventBus`] — the typed replacement for the source's
//!   named event-emitter streams.
//! - [`JobStore`] — the operation surface: send, fetch-and-claim,
//!   complete, fail, cancel, resume, retry, delete, queue CRUD, pub/sub.
//!
//! ## Architecture
//!
//! ```text
//! Producer                         Worker
//!    │                                │
//!    ▼ send()/insert()                ▼ fetch()
//! ┌─────────────────────────────────────────┐
//! │         validate (this crate)            │
//! └─────────────────────────────────────────┘
//!    │                                │
//!    ▼                                ▼
//! ┌─────────────────────────────────────────┐
//! │     JobStore (this crate's trait)        │
//! │   impl'd by queue-postgres::PgJobStore   │
//! └─────────────────────────────────────────┘
//!    │
//!    ▼
//! Supervisor / Timekeeper (queue-postgres) ──▶ EventBus (this crate)
//! ```
//!
//! ## Key invariants
//!
//! 1. A job may only be `active` if `started_on` is set.
//! 2. `retry_count` never exceeds `retry_limit`.
//! 3. `start_after` strictly precedes any transition into `active`.
//! 4. At most one non-terminal job exists per `(queue, singleton_key,
//!    singleton_on)` triple.

pub mod config;
pub mod error;
pub mod events;
pub mod job_store;
pub mod model;
pub mod options;
pub mod validate;

pub use config::{ConnectionConfig, QueueManagerConfig};
pub use error::{QueueError, QueueResult};
pub use events::{EventBus, QueueEvent};
pub use job_store::{JobStore, QueueStats};
pub use model::{
    singleton_bucket, Job, JobId, JobState, Queue, QueuePolicy, Schedule, Subscription, Version,
    DEFAULT_RETENTION,
};
pub use options::{FetchOptions, QueueOptions, ScheduleOptions, SendOptions};

// Re-exported so downstream `impl JobStore` blocks don't need their own
// `async_trait` dependency just to write the attribute.
pub use async_trait::async_trait;
