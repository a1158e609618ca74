//! `PgJobStore`: the Postgres-backed [`JobStore`]. Every method is a single
//! short transaction (or a single statement) — no method here holds a lock
//! across an `await` boundary that depends on caller-supplied work.
//!
//! `fetch` is the one operation worth calling out: rather than the more
//! common `SELECT ... FOR UPDATE SKIP LOCKED`, claims here take a blocking
//! `FOR UPDATE` under a short `lock_timeout` and treat a lock-wait timeout
//! (Postgres error `55P03`) as claim contention rather than a hard failure.
//! Two fetchers racing the same batch therefore resolve by one winning the
//! row and the other getting an empty result, with no skipped rows and no
//! starvation under sustained contention — `SKIP LOCKED` can make that
//! second fetcher skip a row indefinitely if the winner holds it long
//! enough. The cost is that a fetcher occasionally blocks for up to
//! `lock_timeout` before finding out it lost the race.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use queue_core::{
    Job, JobId, JobState, JobStore, Queue, QueuePolicy, QueueError, QueueResult, QueueStats,
    FetchOptions, QueueOptions, SendOptions,
};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

/// Postgres error code for "lock not available", raised when a statement's
/// `lock_timeout` expires while waiting on a row lock.
const LOCK_NOT_AVAILABLE: &str = "55P03";
/// Postgres error code for a foreign-key violation, remapped to
/// [`QueueError::QueueNotFound`] wherever a child row references a queue.
const FOREIGN_KEY_VIOLATION: &str = "23503";
/// Postgres error code for a unique-constraint violation, the signal a
/// singleton/debounce/throttle send lost its admission race.
const UNIQUE_VIOLATION: &str = "23505";

/// How long a `fetch` transaction will block on a contended row before
/// giving up and reporting [`QueueError::ClaimContention`].
const FETCH_LOCK_TIMEOUT_MS: i64 = 1_000;

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn storage_err(e: sqlx::Error) -> QueueError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) {
            return QueueError::QueueNotFound(db_err.message().to_string());
        }
    }
    QueueError::Storage(e.to_string())
}

fn is_lock_timeout(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, sqlx::Error> {
    let state_raw: String = row.try_get("state")?;
    let policy_raw: String = row.try_get("policy")?;
    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        priority: row.try_get("priority")?,
        data: row.try_get("data")?,
        state: JobState::from_str(&state_raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        retry_limit: row.try_get("retry_limit")?,
        retry_count: row.try_get("retry_count")?,
        retry_delay: row.try_get("retry_delay")?,
        retry_backoff: row.try_get("retry_backoff")?,
        start_after: row.try_get("start_after")?,
        started_on: row.try_get("started_on")?,
        singleton_key: row.try_get("singleton_key")?,
        singleton_on: row.try_get("singleton_on")?,
        expire_in_seconds: row.try_get("expire_in_seconds")?,
        created_on: row.try_get("created_on")?,
        completed_on: row.try_get("completed_on")?,
        keep_until: row.try_get("keep_until")?,
        output: row.try_get("output")?,
        dead_letter: row.try_get("dead_letter")?,
        policy: QueuePolicy::from_str(&policy_raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
    })
}

fn queue_from_row(row: &sqlx::postgres::PgRow) -> Result<Queue, sqlx::Error> {
    let policy_raw: String = row.try_get("policy")?;
    Ok(Queue {
        name: row.try_get("name")?,
        policy: QueuePolicy::from_str(&policy_raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        retry_limit: row.try_get("retry_limit")?,
        retry_delay: row.try_get("retry_delay")?,
        retry_backoff: row.try_get("retry_backoff")?,
        expire_seconds: row.try_get("expire_seconds")?,
        retention_minutes: row.try_get("retention_minutes")?,
        dead_letter: row.try_get("dead_letter")?,
    })
}

/// Resolves the admission bucket for a send: `singleton_key`/`singleton_on`
/// are `None` unless the caller set `singleton_key`, in which case
/// `singleton_on` is quantized to `singleton_seconds` (default: immediate,
/// i.e. the bucket is the exact send time and only concurrent sends in the
/// same instant collide).
fn singleton_fields(opts: &SendOptions, now: chrono::DateTime<Utc>) -> (Option<String>, Option<chrono::DateTime<Utc>>) {
    match &opts.singleton_key {
        None => (None, None),
        Some(key) => {
            let bucket = opts
                .singleton_seconds
                .map(|secs| queue_core::singleton_bucket(now, secs))
                .unwrap_or(now);
            (Some(key.clone()), Some(bucket))
        }
    }
}

async fn insert_one(
    tx: &mut Transaction<'_, Postgres>,
    queue: &Queue,
    data: Option<Value>,
    opts: &SendOptions,
) -> QueueResult<Option<JobId>> {
    queue_core::validate::validate_send_options(opts)?;

    let now = Utc::now();
    let id = opts.id.unwrap_or_else(Uuid::new_v4);
    let (singleton_key, singleton_on) = singleton_fields(opts, now);
    let retry_limit = opts.retry_limit.unwrap_or(queue.retry_limit);
    let retry_delay = opts.retry_delay.unwrap_or(queue.retry_delay);
    let retry_backoff = opts.retry_backoff.unwrap_or(queue.retry_backoff);
    let expire_in_seconds = opts.expire_in_seconds.unwrap_or(queue.expire_seconds);
    let keep_until = opts
        .keep_until
        .unwrap_or_else(|| now + chrono::Duration::minutes(queue.retention_minutes));
    let dead_letter = opts.dead_letter.clone().or_else(|| queue.dead_letter.clone());
    let start_after = opts.start_after.unwrap_or(now);

    // A unique violation (singleton collision) aborts the whole transaction
    // in Postgres, not just the one statement — without a savepoint to roll
    // back to, the next insert in a batch would fail with 25P02 and the
    // final commit would discard every row the batch did manage to insert.
    // The savepoint confines that abort to this one row.
    sqlx::query("SAVEPOINT insert_one").execute(&mut **tx).await.map_err(storage_err)?;

    let result = sqlx::query(
        r#"
        INSERT INTO job (
            id, name, priority, data, state, retry_limit, retry_delay, retry_backoff,
            start_after, singleton_key, singleton_on, expire_in_seconds, created_on,
            keep_until, dead_letter, policy
        ) VALUES (
            $1, $2, $3, $4, 'created', $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
        )
        "#,
    )
    .bind(id)
    .bind(&queue.name)
    .bind(opts.priority)
    .bind(&data)
    .bind(retry_limit)
    .bind(retry_delay)
    .bind(retry_backoff)
    .bind(start_after)
    .bind(&singleton_key)
    .bind(singleton_on)
    .bind(expire_in_seconds)
    .bind(now)
    .bind(keep_until)
    .bind(&dead_letter)
    .bind(queue.policy.to_string())
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => {
            sqlx::query("RELEASE SAVEPOINT insert_one").execute(&mut **tx).await.map_err(storage_err)?;
            Ok(Some(id))
        }
        Err(e) if is_unique_violation(&e) => {
            sqlx::query("ROLLBACK TO SAVEPOINT insert_one").execute(&mut **tx).await.map_err(storage_err)?;
            Ok(None)
        }
        Err(e) => Err(storage_err(e)),
    }
}

async fn get_or_default_queue(tx: &mut Transaction<'_, Postgres>, name: &str) -> QueueResult<Queue> {
    let row = sqlx::query("SELECT * FROM queue WHERE name = $1")
        .bind(name)
        .fetch_optional(&mut **tx)
        .await
        .map_err(storage_err)?;

    match row {
        Some(row) => queue_from_row(&row).map_err(storage_err),
        None => Ok(Queue::new(name)),
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn send(&self, queue: &str, data: Option<Value>, opts: SendOptions) -> QueueResult<Option<JobId>> {
        queue_core::validate::validate_queue_name(queue)?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let q = get_or_default_queue(&mut tx, queue).await?;
        let id = insert_one(&mut tx, &q, data, &opts).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(id)
    }

    async fn insert(&self, queue: &str, jobs: Vec<(Option<Value>, SendOptions)>) -> QueueResult<Vec<JobId>> {
        queue_core::validate::validate_queue_name(queue)?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let q = get_or_default_queue(&mut tx, queue).await?;
        let mut ids = Vec::with_capacity(jobs.len());
        for (data, opts) in jobs {
            if let Some(id) = insert_one(&mut tx, &q, data, &opts).await? {
                ids.push(id);
            }
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(ids)
    }

    async fn fetch(&self, queue: &str, opts: FetchOptions) -> QueueResult<Vec<Job>> {
        queue_core::validate::validate_queue_name(queue)?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query(&format!("SET LOCAL lock_timeout = '{FETCH_LOCK_TIMEOUT_MS}ms'"))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        let order_by = if opts.priority {
            "priority DESC, created_on ASC, id ASC"
        } else {
            "created_on ASC, id ASC"
        };

        let select_sql = format!(
            "SELECT id FROM job \
             WHERE name = $1 AND state IN ('created', 'retry') AND start_after <= now() \
             ORDER BY {order_by} LIMIT $2 FOR UPDATE"
        );

        let claimed_rows = match sqlx::query(&select_sql)
            .bind(queue)
            .bind(opts.batch_size)
            .fetch_all(&mut *tx)
            .await
        {
            Ok(rows) => rows,
            Err(e) if is_lock_timeout(&e) => {
                tx.rollback().await.ok();
                return Ok(Vec::new());
            }
            Err(e) => return Err(storage_err(e)),
        };

        if claimed_rows.is_empty() {
            tx.commit().await.map_err(storage_err)?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = claimed_rows
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id"))
            .collect::<Result<_, _>>()
            .map_err(storage_err)?;

        let updated_rows = sqlx::query(
            "UPDATE job SET state = 'active', started_on = now() \
             WHERE id = ANY($1) RETURNING *",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        updated_rows.iter().map(job_from_row).collect::<Result<_, _>>().map_err(storage_err)
    }

    async fn complete(&self, ids: &[JobId], output: Option<Value>) -> QueueResult<u64> {
        let result = sqlx::query(
            "UPDATE job SET state = 'completed', output = $2, completed_on = now() \
             WHERE id = ANY($1) AND state NOT IN ('completed', 'cancelled', 'failed')",
        )
        .bind(ids)
        .bind(&output)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn fail(&self, ids: &[JobId], output: Option<Value>) -> QueueResult<u64> {
        let result = sqlx::query(
            "UPDATE job SET state = 'failed', output = $2, completed_on = now() \
             WHERE id = ANY($1) AND state NOT IN ('completed', 'cancelled', 'failed')",
        )
        .bind(ids)
        .bind(&output)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn cancel(&self, ids: &[JobId]) -> QueueResult<u64> {
        let result = sqlx::query(
            "UPDATE job SET state = 'cancelled', completed_on = now() \
             WHERE id = ANY($1) AND state NOT IN ('completed', 'cancelled', 'failed')",
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn resume(&self, ids: &[JobId]) -> QueueResult<u64> {
        let result = sqlx::query(
            "UPDATE job SET state = 'created', started_on = NULL, completed_on = NULL \
             WHERE id = ANY($1) AND state = 'cancelled'",
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn retry(&self, ids: &[JobId]) -> QueueResult<u64> {
        // Each retry's delay depends on that job's own retry_count/backoff
        // policy, so this loops per-row rather than issuing one UPDATE —
        // the batch is small (a worker's own failed batch) and each row is
        // a single indexed update.
        let mut affected = 0u64;
        for id in ids {
            let row = sqlx::query("SELECT * FROM job WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
            let Some(row) = row else { continue };
            let job = job_from_row(&row).map_err(storage_err)?;
            if job.state.is_terminal() || job.retries_exhausted() {
                continue;
            }
            let delay = job.next_retry_delay();
            let result = sqlx::query(
                "UPDATE job SET state = 'retry', retry_count = retry_count + 1, \
                 start_after = now() + ($2 || ' seconds')::interval, started_on = NULL \
                 WHERE id = $1 AND state NOT IN ('completed', 'cancelled', 'failed')",
            )
            .bind(id)
            .bind(delay.num_seconds().to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    async fn delete_job(&self, ids: &[JobId]) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM job WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn get_job_by_id(&self, queue: &str, id: JobId, include_archive: bool) -> QueueResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM job WHERE id = $1 AND name = $2")
            .bind(id)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        if let Some(row) = row {
            return job_from_row(&row).map(Some).map_err(storage_err);
        }

        if !include_archive {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM archive WHERE id = $1 AND name = $2")
            .bind(id)
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.map(|r| job_from_row(&r)).transpose().map_err(storage_err)
    }

    async fn publish(&self, event: &str, data: Option<Value>, opts: SendOptions) -> QueueResult<Vec<JobId>> {
        let queues: Vec<String> = sqlx::query("SELECT name FROM subscription WHERE event = $1")
            .bind(event)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?
            .iter()
            .map(|r| r.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()
            .map_err(storage_err)?;

        let mut ids = Vec::with_capacity(queues.len());
        for queue in queues {
            if let Some(id) = self.send(&queue, data.clone(), opts.clone()).await? {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn subscribe(&self, event: &str, queue: &str) -> QueueResult<()> {
        sqlx::query("INSERT INTO subscription (event, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(event)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn unsubscribe(&self, event: &str, queue: &str) -> QueueResult<()> {
        sqlx::query("DELETE FROM subscription WHERE event = $1 AND name = $2")
            .bind(event)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn create_queue(&self, name: &str, opts: QueueOptions) -> QueueResult<()> {
        queue_core::validate::validate_queue_name(name)?;
        queue_core::validate::validate_queue_options(&opts)?;
        sqlx::query(
            "INSERT INTO queue (name, policy, retry_limit, retry_delay, retry_backoff, \
             expire_seconds, retention_minutes, dead_letter) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(opts.policy.to_string())
        .bind(opts.retry_limit)
        .bind(opts.retry_delay)
        .bind(opts.retry_backoff)
        .bind(opts.expire_seconds)
        .bind(opts.retention_minutes)
        .bind(&opts.dead_letter)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn update_queue(&self, name: &str, opts: QueueOptions) -> QueueResult<()> {
        queue_core::validate::validate_queue_name(name)?;
        queue_core::validate::validate_queue_options(&opts)?;
        sqlx::query(
            "UPDATE queue SET policy = $2, retry_limit = $3, retry_delay = $4, retry_backoff = $5, \
             expire_seconds = $6, retention_minutes = $7, dead_letter = $8 WHERE name = $1",
        )
        .bind(name)
        .bind(opts.policy.to_string())
        .bind(opts.retry_limit)
        .bind(opts.retry_delay)
        .bind(opts.retry_backoff)
        .bind(opts.expire_seconds)
        .bind(opts.retention_minutes)
        .bind(&opts.dead_letter)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> QueueResult<()> {
        sqlx::query("DELETE FROM queue WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_queue(&self, name: &str) -> QueueResult<Option<Queue>> {
        let row = sqlx::query("SELECT * FROM queue WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|r| queue_from_row(&r)).transpose().map_err(storage_err)
    }

    async fn get_queues(&self) -> QueueResult<Vec<Queue>> {
        let rows = sqlx::query("SELECT * FROM queue ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(queue_from_row).collect::<Result<_, _>>().map_err(storage_err)
    }

    async fn get_queue_size(&self, name: &str) -> QueueResult<QueueStats> {
        let rows = sqlx::query("SELECT state, count(*) AS n FROM job WHERE name = $1 GROUP BY state")
            .bind(name)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state_raw: String = row.try_get("state").map_err(storage_err)?;
            let n: i64 = row.try_get("n").map_err(storage_err)?;
            match JobState::from_str(&state_raw)? {
                JobState::Created => stats.created = n,
                JobState::Retry => stats.retry = n,
                JobState::Active => stats.active = n,
                JobState::Completed => stats.completed = n,
                JobState::Cancelled => stats.cancelled = n,
                JobState::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }

    async fn purge_queue(&self, name: &str) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM job WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn clear_storage(&self) -> QueueResult<()> {
        sqlx::raw_sql("TRUNCATE job, archive, subscription, schedule, queue CASCADE")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
