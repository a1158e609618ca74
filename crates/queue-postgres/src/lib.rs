//! PostgreSQL-backed runtime for a durable, relational-database-backed job
//! queue: the schema authority, the [`manager::PgJobStore`] implementation
//! of `queue_core::JobStore`, the worker polling runtime, and the
//! supervisor/timekeeper background loops. [`QueueManager`] is the single
//! façade that wires all four together.
//!
//! ```text
//! QueueManager::start()
//!   │
//!   ├─► schema::install()            (idempotent DDL + migration ladder)
//!   ├─► Supervisor::spawn()          (maintenance tick, monitor tick)
//!   ├─► Timekeeper::spawn()          (cron tick, clock-skew tick)
//!   └─► QueueManager::start_worker() (one per queue, spawned on demand)
//! ```
//!
//! Every background loop is self-healing: a failed tick logs, emits
//! `QueueEvent::Error`, and simply tries again next interval. Nothing but
//! an explicit `stop()` terminates the event pump.

mod manager;
mod schema;
mod supervisor;
mod timekeeper;
mod worker;

use std::sync::Arc;

use dashmap::DashMap;
use queue_core::{EventBus, JobStore, QueueError, QueueEvent, QueueManagerConfig, QueueResult, ScheduleOptions};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

pub use manager::PgJobStore;
pub use schema::install as install_schema;
pub use supervisor::{MaintenanceReport, Supervisor};
pub use timekeeper::Timekeeper;
pub use worker::{handler_fn, JobHandler, JobOutcome, WorkerHandle, WorkerOptions, WorkerState};

struct RunningState {
    pool: PgPool,
    store: Arc<PgJobStore>,
    maintenance: tokio::task::JoinHandle<()>,
    monitor: tokio::task::JoinHandle<()>,
    cron: tokio::task::JoinHandle<()>,
    clock: tokio::task::JoinHandle<()>,
    timekeeper: Timekeeper,
}

enum ManagerState {
    NotStarted,
    Starting,
    Running(RunningState),
    Stopped,
}

/// The operation-surface façade. Wraps connection lifecycle, schema
/// install, background loop supervision, and the instance-local registry
/// of running workers.
pub struct QueueManager {
    config: Arc<QueueManagerConfig>,
    events: EventBus,
    state: Arc<AsyncMutex<ManagerState>>,
    workers: Arc<DashMap<Uuid, (WorkerHandle, tokio::task::JoinHandle<()>)>>,
}

impl QueueManager {
    pub fn new(config: QueueManagerConfig) -> Self {
        Self {
            config: Arc::new(config),
            events: EventBus::default(),
            state: Arc::new(AsyncMutex::new(ManagerState::NotStarted)),
            workers: Arc::new(DashMap::new()),
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Opens the pool, installs/migrates the schema, and starts the
    /// supervisor and timekeeper. A no-op when already started or
    /// starting — concurrent callers collapse onto the same attempt,
    /// since the state lock is held for the whole operation.
    pub async fn start(&self) -> QueueResult<()> {
        let mut guard = self.state.lock().await;
        if matches!(&*guard, ManagerState::Starting | ManagerState::Running(_)) {
            return Ok(());
        }
        *guard = ManagerState::Starting;

        let pool = connect(&self.config).await?;
        schema::install(&pool).await.map_err(|e| QueueError::Storage(e.to_string()))?;

        let store = Arc::new(PgJobStore::new(pool.clone()));

        let supervisor = Supervisor::new(pool.clone(), self.events.clone(), self.config.clone());
        let (maintenance, monitor) = supervisor.spawn();

        let timekeeper = Timekeeper::new(pool.clone(), self.events.clone(), self.config.clone());
        let (cron, clock) = timekeeper.clone().spawn();

        info!(schema = %self.config.schema, "queue manager started");

        *guard = ManagerState::Running(RunningState {
            pool,
            store,
            maintenance,
            monitor,
            cron,
            clock,
            timekeeper,
        });

        Ok(())
    }

    /// Stops every running worker (waiting out their in-flight batch, up
    /// to `shutdown_timeout_seconds`), then aborts the background loops.
    pub async fn stop(&self) -> QueueResult<()> {
        let mut guard = self.state.lock().await;
        let running = match std::mem::replace(&mut *guard, ManagerState::Stopped) {
            ManagerState::Running(running) => running,
            other => {
                *guard = other;
                return Ok(());
            }
        };

        let worker_ids: Vec<Uuid> = self.workers.iter().map(|e| *e.key()).collect();
        let mut joins = Vec::with_capacity(worker_ids.len());
        for id in worker_ids {
            if let Some((_, (handle, join))) = self.workers.remove(&id) {
                handle.stop();
                joins.push(join);
            }
        }

        let drain = futures::future::join_all(joins);
        if tokio::time::timeout(
            std::time::Duration::from_secs(self.config.shutdown_timeout_seconds),
            drain,
        )
        .await
        .is_err()
        {
            warn!("shutdown timed out waiting for workers to drain");
        }

        running.maintenance.abort();
        running.monitor.abort();
        running.cron.abort();
        running.clock.abort();
        running.pool.close().await;

        self.events.emit(QueueEvent::Stopped);
        Ok(())
    }

    /// The storage-agnostic operation surface: `send`, `fetch`, `complete`,
    /// queue CRUD, pub/sub, and the rest of `JobStore`.
    pub async fn store(&self) -> QueueResult<Arc<PgJobStore>> {
        match &*self.state.lock().await {
            ManagerState::Running(running) => Ok(running.store.clone()),
            _ => Err(QueueError::Storage("queue manager is not started".to_string())),
        }
    }

    /// Starts a polling worker for `queue`, registering it in the
    /// instance-local registry so `stop()` can drain it.
    pub async fn start_worker(&self, queue: impl Into<String>, handler: JobHandler, opts: WorkerOptions) -> QueueResult<WorkerHandle> {
        let store = self.store().await?;
        let dyn_store: Arc<dyn JobStore> = store;
        let (handle, join) = worker::spawn(dyn_store, self.events.clone(), queue, handler, opts);
        self.workers.insert(handle.id(), (handle.clone(), join));
        Ok(handle)
    }

    /// Stops and deregisters a single worker, without touching the rest.
    pub fn stop_worker(&self, id: Uuid) {
        if let Some((_, (handle, _))) = self.workers.remove(&id) {
            handle.stop();
        }
    }

    pub async fn schedule(&self, name: &str, cron: &str, timezone: &str, opts: ScheduleOptions) -> QueueResult<()> {
        match &*self.state.lock().await {
            ManagerState::Running(running) => running.timekeeper.schedule(name, cron, timezone, opts).await,
            _ => Err(QueueError::Storage("queue manager is not started".to_string())),
        }
    }

    pub async fn unschedule(&self, name: &str) -> QueueResult<()> {
        match &*self.state.lock().await {
            ManagerState::Running(running) => running.timekeeper.unschedule(name).await,
            _ => Err(QueueError::Storage("queue manager is not started".to_string())),
        }
    }

    /// Forces one maintenance pass immediately, bypassing the lease check
    /// and the background loop's cadence. Used by callers (tests, an
    /// operator CLI) that need deterministic expiry/archival rather than
    /// waiting out `maintenance_interval_seconds`.
    pub async fn run_maintenance_once(&self) -> QueueResult<MaintenanceReport> {
        match &*self.state.lock().await {
            ManagerState::Running(running) => {
                let supervisor = Supervisor::new(running.pool.clone(), self.events.clone(), self.config.clone());
                supervisor.run_maintenance_once().await
            }
            _ => Err(QueueError::Storage("queue manager is not started".to_string())),
        }
    }
}

async fn connect(config: &QueueManagerConfig) -> QueueResult<PgPool> {
    let url = config.connection.to_url();
    match PgPoolOptions::new().max_connections(config.max_connections).connect(&url).await {
        Ok(pool) => Ok(pool),
        Err(e) if config.auto_create_database && is_missing_database(&e) => {
            create_database(config).await?;
            PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&url)
                .await
                .map_err(|e| QueueError::Storage(e.to_string()))
        }
        Err(e) => Err(QueueError::Storage(e.to_string())),
    }
}

fn is_missing_database(e: &sqlx::Error) -> bool {
    // Postgres error code 3D000: invalid_catalog_name.
    matches!(e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("3D000"))
}

async fn create_database(config: &QueueManagerConfig) -> QueueResult<()> {
    let queue_core::ConnectionConfig::Parts { host, port, user, password, database } = &config.connection else {
        return Err(QueueError::Storage(
            "auto_create_database requires a Parts connection config to know which database to create".to_string(),
        ));
    };

    let admin_url = format!("postgres://{user}:{password}@{host}:{port}/postgres");
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&admin_url)
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?;

    sqlx::raw_sql(&format!("CREATE DATABASE \"{database}\""))
        .execute(&admin_pool)
        .await
        .map_err(|e| QueueError::Storage(e.to_string()))?;

    Ok(())
}
