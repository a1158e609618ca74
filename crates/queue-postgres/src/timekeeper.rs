//! Cron-driven recurring sends, plus the clock-skew check that backs the
//! whole system's assumption that "now" means the same thing on every
//! instance and on the database server.
//!
//! Firing is idempotent the same way a debounced `send` is: every fire
//! carries a singleton key of `cron_<queue>` bucketed to
//! `cron_monitor_interval_seconds` — the same tick window a fire is
//! evaluated against, so each tick gets its own dedup window and a
//! sub-day schedule still fires every time it's due. Leader election on
//! `version.cron_on` is the first line of defense against a double fire
//! across a fleet; the singleton bucket is the second, in case two
//! instances' clocks disagree about which tick owns a given minute.

use std::sync::Arc;

use chrono::Utc;
use queue_core::{validate, EventBus, JobStore, QueueError, QueueEvent, QueueManagerConfig, QueueResult, Schedule, SendOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use crate::manager::storage_err;
use crate::supervisor::claim_lease;

/// Instance clock vs. database clock delta past which a [`QueueEvent::ClockSkew`]
/// is raised. Cron firing windows are minute-granularity, so anything
/// under this is noise.
const CLOCK_SKEW_ALERT_SECONDS: i64 = 60;

#[derive(Clone)]
pub struct Timekeeper {
    pool: PgPool,
    events: EventBus,
    config: Arc<QueueManagerConfig>,
}

impl Timekeeper {
    pub fn new(pool: PgPool, events: EventBus, config: Arc<QueueManagerConfig>) -> Self {
        Self { pool, events, config }
    }

    pub fn spawn(self) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let cron = {
            let this = self.clone();
            tokio::spawn(async move { this.cron_loop().await })
        };
        let clock = {
            let this = self.clone();
            tokio::spawn(async move { this.clock_loop().await })
        };
        (cron, clock)
    }

    /// Upserts a schedule. A queue name that doesn't exist surfaces as
    /// [`QueueError::QueueNotFound`] via the schedule table's foreign key.
    pub async fn schedule(&self, name: &str, cron: &str, timezone: &str, opts: queue_core::ScheduleOptions) -> QueueResult<()> {
        validate::validate_queue_name(name)?;
        let timezone = opts.timezone.clone().unwrap_or_else(|| timezone.to_string());
        validate::validate_cron(cron, &timezone)?;

        let options_json = opts
            .send_options
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| QueueError::Validation(e.to_string()))?;

        sqlx::query(
            "INSERT INTO schedule (name, cron, timezone, data, options) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (name) DO UPDATE SET cron = $2, timezone = $3, data = $4, options = $5",
        )
        .bind(name)
        .bind(cron)
        .bind(&timezone)
        .bind(&opts.data)
        .bind(&options_json)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        self.events.emit(QueueEvent::Schedule {
            name: name.to_string(),
            cron: cron.to_string(),
            timezone,
        });

        Ok(())
    }

    pub async fn unschedule(&self, name: &str) -> QueueResult<()> {
        sqlx::query("DELETE FROM schedule WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn cron_loop(&self) {
        if !self.config.cron_enabled() {
            debug!("cron firing disabled: archive_interval_seconds < 60");
            return;
        }

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.cron_monitor_interval_seconds.max(1) as u64));
        loop {
            ticker.tick().await;
            if let Err(e) = self.try_cron_tick().await {
                warn!(error = %e, "cron tick failed");
                self.events.emit(QueueEvent::Error { message: e.to_string() });
            }
        }
    }

    async fn try_cron_tick(&self) -> QueueResult<()> {
        let claimed = claim_lease(&self.pool, "cron_on", self.config.cron_monitor_interval_seconds).await?;
        if !claimed {
            return Ok(());
        }

        let rows = sqlx::query("SELECT name, cron, timezone, data, options FROM schedule")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let window = chrono::Duration::seconds(self.config.cron_monitor_interval_seconds);
        let now = Utc::now();

        for row in rows {
            let schedule = Schedule {
                name: row.try_get("name").map_err(storage_err)?,
                cron: row.try_get("cron").map_err(storage_err)?,
                timezone: row.try_get("timezone").map_err(storage_err)?,
                data: row.try_get("data").map_err(storage_err)?,
                options: row.try_get("options").map_err(storage_err)?,
            };

            if let Err(e) = self.fire_if_due(&schedule, now, window).await {
                warn!(queue = %schedule.name, error = %e, "scheduled fire failed");
            }
        }

        Ok(())
    }

    async fn fire_if_due(&self, schedule: &Schedule, now: chrono::DateTime<Utc>, window: chrono::Duration) -> QueueResult<()> {
        let (cron_schedule, tz) = validate::validate_cron(&schedule.cron, &schedule.timezone)?;

        let now_tz = now.with_timezone(&tz);
        let lookback_tz = (now - window).with_timezone(&tz);

        let due = cron_schedule
            .after(&lookback_tz)
            .next()
            .map(|next| next <= now_tz)
            .unwrap_or(false);

        if !due {
            return Ok(());
        }

        let mut send_opts: SendOptions = schedule
            .options
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        send_opts.singleton_key = Some(SendOptions::debounce_key(&schedule.name));
        send_opts.singleton_seconds = Some(self.config.cron_monitor_interval_seconds);

        let store = crate::manager::PgJobStore::new(self.pool.clone());
        store.send(&schedule.name, schedule.data.clone(), send_opts).await?;

        Ok(())
    }

    async fn clock_loop(&self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.clock_monitor_interval_seconds.max(1) as u64));
        loop {
            ticker.tick().await;
            if let Err(e) = self.check_clock_skew().await {
                warn!(error = %e, "clock skew check failed");
            }
        }
    }

    async fn check_clock_skew(&self) -> QueueResult<()> {
        let before = Utc::now();
        let row = sqlx::query("SELECT now() AS db_now")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let db_now: chrono::DateTime<Utc> = row.try_get("db_now").map_err(storage_err)?;
        let after = Utc::now();

        let instance_now = before + (after - before) / 2;
        let delta = db_now - instance_now;

        if delta.num_seconds().abs() >= CLOCK_SKEW_ALERT_SECONDS {
            self.events.emit(QueueEvent::ClockSkew {
                delta,
                measured_at: instance_now,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_skew_alert_threshold_is_positive() {
        assert!(CLOCK_SKEW_ALERT_SECONDS > 0);
    }
}
