//! Background maintenance: expiring stuck `active` jobs, archiving
//! terminal jobs, dropping old archive rows, and periodically publishing
//! per-queue state counts.
//!
//! Every instance in a fleet runs a `Supervisor`, but only one does real
//! work per tick: each pass first tries a conditional `UPDATE` against the
//! `version` singleton row (`maintained_on`/`monitored_on`), and only the
//! instance whose `UPDATE` actually touches a row proceeds — the same
//! compare-and-swap shape as a `SELECT ... FOR UPDATE SKIP LOCKED` leader
//! election, but against a single row instead of a job table.

use std::sync::Arc;

use chrono::Utc;
use queue_core::{EventBus, JobStore, QueueEvent, QueueManagerConfig};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::manager::storage_err;

#[derive(Clone)]
pub struct Supervisor {
    pool: PgPool,
    events: EventBus,
    config: Arc<QueueManagerConfig>,
}

/// Outcome of a single maintenance tick, also the payload of
/// [`QueueEvent::Maintenance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: u64,
    pub archived: u64,
    pub dropped: u64,
}

impl Supervisor {
    pub fn new(pool: PgPool, events: EventBus, config: Arc<QueueManagerConfig>) -> Self {
        Self { pool, events, config }
    }

    /// Spawns the maintenance-tick and monitor-tick loops. Returns their
    /// join handles so callers can await them during shutdown.
    pub fn spawn(self) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let maintenance = {
            let this = self.clone();
            tokio::spawn(async move { this.maintenance_loop().await })
        };
        let monitor = {
            let this = self.clone();
            tokio::spawn(async move { this.monitor_loop().await })
        };
        (maintenance, monitor)
    }

    async fn maintenance_loop(&self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.maintenance_interval_seconds.max(1) as u64));
        loop {
            ticker.tick().await;
            match self.try_maintenance_tick().await {
                Ok(Some(report)) => {
                    info!(expired = report.expired, archived = report.archived, dropped = report.dropped, "maintenance tick");
                    self.events.emit(QueueEvent::Maintenance {
                        expired: report.expired,
                        archived: report.archived,
                        dropped: report.dropped,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "maintenance tick failed");
                    self.events.emit(QueueEvent::Error { message: e.to_string() });
                }
            }
        }
    }

    async fn monitor_loop(&self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.monitor_state_interval_seconds.max(1) as u64));
        loop {
            ticker.tick().await;
            match self.try_monitor_tick().await {
                Ok(Some(_)) => {}
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "monitor tick failed");
                    self.events.emit(QueueEvent::Error { message: e.to_string() });
                }
            }
        }
    }

    /// Runs one maintenance pass unconditionally, bypassing the lease
    /// check. Exposed for callers that want to force expiry/archival
    /// deterministically (e.g. tests exercising the expiration scenario)
    /// without waiting on the background loop's cadence.
    pub async fn run_maintenance_once(&self) -> Result<MaintenanceReport, queue_core::QueueError> {
        let expired = self.expire_stuck_active().await?;
        let archived = self.archive_terminal().await?;
        let dropped = self.drop_old_archive().await?;
        Ok(MaintenanceReport { expired, archived, dropped })
    }

    /// Attempts to claim leadership for this tick via a conditional update
    /// on `version.maintained_on`. Returns `Ok(None)` when another instance
    /// already leads this tick.
    async fn try_maintenance_tick(&self) -> Result<Option<MaintenanceReport>, queue_core::QueueError> {
        let claimed = claim_lease(&self.pool, "maintained_on", self.config.maintenance_interval_seconds).await?;
        if !claimed {
            return Ok(None);
        }

        let expired = self.expire_stuck_active().await?;
        let archived = self.archive_terminal().await?;
        let dropped = self.drop_old_archive().await?;

        Ok(Some(MaintenanceReport { expired, archived, dropped }))
    }

    async fn try_monitor_tick(&self) -> Result<Option<()>, queue_core::QueueError> {
        let claimed = claim_lease(&self.pool, "monitored_on", self.config.monitor_state_interval_seconds).await?;
        if !claimed {
            return Ok(None);
        }

        let by_queue_state: Vec<(String, String, i64)> = sqlx::query(
            "SELECT name, state, count(*) FROM job GROUP BY name, state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?
        .into_iter()
        .map(|r| {
            (
                r.get::<String, _>(0),
                r.get::<String, _>(1),
                r.get::<i64, _>(2),
            )
        })
        .collect();

        let by_state: Vec<(String, i64)> = sqlx::query("SELECT state, count(*) FROM job GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?
            .into_iter()
            .map(|r| (r.get::<String, _>(0), r.get::<i64, _>(1)))
            .collect();

        let total: i64 = by_state.iter().map(|(_, n)| n).sum();

        self.events.emit(QueueEvent::MonitorStates {
            by_queue_state,
            by_state,
            total,
        });

        Ok(Some(()))
    }

    /// Active jobs whose `started_on + expire_in_seconds` has passed are
    /// stuck (the worker that claimed them died or hung, or never got to
    /// report an outcome). Unconditionally failed with a canned timeout
    /// output and routed to the dead letter queue if one is configured —
    /// retry is the worker's `settle_failure` decision on a reported
    /// handler failure, not the expire pass's.
    async fn expire_stuck_active(&self) -> Result<u64, queue_core::QueueError> {
        let rows = sqlx::query(
            "SELECT id, dead_letter, data \
             FROM job \
             WHERE state = 'active' \
               AND started_on IS NOT NULL \
               AND started_on + (expire_in_seconds || ' seconds')::interval < now()",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut expired = 0u64;
        for row in rows {
            let id: uuid::Uuid = row.get("id");
            let dead_letter: Option<String> = row.get("dead_letter");
            let data: Option<serde_json::Value> = row.get("data");

            if let Some(dlq) = &dead_letter {
                // Goes through the full `send` path (not a raw INSERT) so the
                // dead-letter job picks up its own queue's configured
                // defaults instead of hardcoding them here.
                let store = crate::manager::PgJobStore::new(self.pool.clone());
                if let Err(e) = store.send(dlq, data.clone(), queue_core::SendOptions::default()).await {
                    warn!(job_id = %id, dead_letter = %dlq, error = %e, "failed to route expired job to dead letter queue");
                }
            }

            sqlx::query("UPDATE job SET state = 'failed', output = $2, completed_on = now() WHERE id = $1")
                .bind(id)
                .bind(timeout_output())
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
            expired += 1;
        }

        Ok(expired)
    }

    /// Moves terminal jobs older than their queue's archive window into
    /// `archive`, then deletes them from `job`. Failed jobs get their own,
    /// typically longer, window (`archive_failed_interval_seconds`).
    async fn archive_terminal(&self) -> Result<u64, queue_core::QueueError> {
        let completed_cutoff = Utc::now() - chrono::Duration::seconds(self.config.archive_interval_seconds);
        let failed_cutoff = Utc::now() - chrono::Duration::seconds(self.config.archive_failed_interval_seconds);

        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(
            r#"
            INSERT INTO archive (
                id, name, priority, data, state, retry_limit, retry_count, retry_delay, retry_backoff,
                start_after, started_on, singleton_key, singleton_on, expire_in_seconds, created_on,
                completed_on, keep_until, output, dead_letter, policy
            )
            SELECT
                id, name, priority, data, state, retry_limit, retry_count, retry_delay, retry_backoff,
                start_after, started_on, singleton_key, singleton_on, expire_in_seconds, created_on,
                completed_on, keep_until, output, dead_letter, policy
            FROM job
            WHERE (state IN ('completed', 'cancelled') AND completed_on < $1)
               OR (state = 'failed' AND completed_on < $2)
            "#,
        )
        .bind(completed_cutoff)
        .bind(failed_cutoff)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM job
            WHERE (state IN ('completed', 'cancelled') AND completed_on < $1)
               OR (state = 'failed' AND completed_on < $2)
            "#,
        )
        .bind(completed_cutoff)
        .bind(failed_cutoff)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?
        .rows_affected();

        tx.commit().await.map_err(storage_err)?;

        Ok(deleted)
    }

    /// Archive rows older than `delete_after_seconds` are hard-deleted —
    /// this is the final retention boundary, past `keep_until`.
    async fn drop_old_archive(&self) -> Result<u64, queue_core::QueueError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.delete_after_seconds);
        let result = sqlx::query("DELETE FROM archive WHERE archived_on < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }
}

/// The canned payload written to `output` when the expire pass fails a job
/// for exceeding its lease, since there's no handler-reported error to
/// carry instead.
fn timeout_output() -> serde_json::Value {
    serde_json::json!({"error": "timeout", "message": "job exceeded expire_in_seconds without completing"})
}

/// Conditional `UPDATE` on the `version` singleton row: succeeds (returns
/// `true`) only if `column` is null or older than `interval_seconds`,
/// which is exactly the CAS an instance needs to determine it's the one
/// doing this tick's work.
pub(crate) async fn claim_lease(pool: &PgPool, column: &str, interval_seconds: i64) -> Result<bool, queue_core::QueueError> {
    let sql = format!(
        "UPDATE version SET {column} = now() \
         WHERE version = 1 AND ({column} IS NULL OR {column} < now() - ($1 || ' seconds')::interval)"
    );
    let result = sqlx::query(&sql)
        .bind(interval_seconds.to_string())
        .execute(pool)
        .await
        .map_err(storage_err)?;
    Ok(result.rows_affected() > 0)
}
