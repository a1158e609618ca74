//! Schema authority: every SQL fragment used to create or evolve the
//! five logical tables lives here, and nowhere else in the crate. A
//! migration is applied at most once, tracked by the `version` singleton
//! row (the same row the supervisor and timekeeper use as a leader-lease
//! channel once the schema is in place).
//!
//! ```sql
//! CREATE TABLE job (
//!     id UUID PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     priority SMALLINT NOT NULL DEFAULT 0,
//!     data JSONB,
//!     state TEXT NOT NULL DEFAULT 'created' CHECK (state IN (...)),
//!     ...
//! );
//!
//! CREATE UNIQUE INDEX job_singleton_idx ON job (name, singleton_key, singleton_on)
//!     WHERE singleton_key IS NOT NULL AND state NOT IN ('completed', 'cancelled', 'failed');
//! CREATE INDEX job_fetch_idx ON job (name, state, start_after, priority)
//!     WHERE state IN ('created', 'retry');
//! ```
//!
//! `state` and `policy` are plain `TEXT` columns with a `CHECK` constraint
//! rather than native Postgres `ENUM` types: the domain layer
//! (`queue_core::JobState`/`QueuePolicy`) is deliberately storage-agnostic
//! and has no `sqlx::Type` impl, so a native enum column would force every
//! bind and read in `manager.rs` to carry an explicit `::text`/`::job_state`
//! cast. `TEXT` plus `CHECK` gets the same invalid-value rejection with a
//! plain `String` round-trip.

use sqlx::{PgPool, Row};

/// Each entry is one forward migration. The schema authority applies
/// every migration whose index is `>= current_version`, then records the
/// new version. Entries are never edited after release — only appended.
const MIGRATIONS: &[&str] = &[
    // v1: five logical tables + their indexes.
    r#"
    CREATE TABLE IF NOT EXISTS queue (
        name TEXT PRIMARY KEY,
        policy TEXT NOT NULL DEFAULT 'standard'
            CHECK (policy IN ('standard', 'short', 'singleton', 'stately')),
        retry_limit INTEGER NOT NULL DEFAULT 0,
        retry_delay BIGINT NOT NULL DEFAULT 0,
        retry_backoff BOOLEAN NOT NULL DEFAULT false,
        expire_seconds BIGINT NOT NULL DEFAULT 900,
        retention_minutes BIGINT NOT NULL DEFAULT 20160,
        dead_letter TEXT REFERENCES queue(name) ON DELETE SET NULL
    );

    CREATE TABLE IF NOT EXISTS job (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        priority SMALLINT NOT NULL DEFAULT 0,
        data JSONB,
        state TEXT NOT NULL DEFAULT 'created'
            CHECK (state IN ('created', 'retry', 'active', 'completed', 'cancelled', 'failed')),
        retry_limit INTEGER NOT NULL DEFAULT 0,
        retry_count INTEGER NOT NULL DEFAULT 0,
        retry_delay BIGINT NOT NULL DEFAULT 0,
        retry_backoff BOOLEAN NOT NULL DEFAULT false,
        start_after TIMESTAMPTZ NOT NULL DEFAULT now(),
        started_on TIMESTAMPTZ,
        singleton_key TEXT,
        singleton_on TIMESTAMPTZ,
        expire_in_seconds BIGINT NOT NULL DEFAULT 900,
        created_on TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_on TIMESTAMPTZ,
        keep_until TIMESTAMPTZ NOT NULL DEFAULT (now() + interval '14 days'),
        output JSONB,
        dead_letter TEXT,
        policy TEXT NOT NULL DEFAULT 'standard'
            CHECK (policy IN ('standard', 'short', 'singleton', 'stately'))
    );

    CREATE UNIQUE INDEX IF NOT EXISTS job_singleton_idx ON job (name, singleton_key, singleton_on)
        WHERE singleton_key IS NOT NULL AND state NOT IN ('completed', 'cancelled', 'failed');

    CREATE INDEX IF NOT EXISTS job_fetch_idx ON job (name, state, start_after, priority)
        WHERE state IN ('created', 'retry');

    CREATE INDEX IF NOT EXISTS job_active_expiry_idx ON job (started_on)
        WHERE state = 'active';

    CREATE INDEX IF NOT EXISTS job_completed_on_idx ON job (completed_on)
        WHERE state IN ('completed', 'cancelled', 'failed');

    CREATE TABLE IF NOT EXISTS archive (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        priority SMALLINT NOT NULL,
        data JSONB,
        state TEXT NOT NULL CHECK (state IN ('completed', 'cancelled', 'failed')),
        retry_limit INTEGER NOT NULL,
        retry_count INTEGER NOT NULL,
        retry_delay BIGINT NOT NULL,
        retry_backoff BOOLEAN NOT NULL,
        start_after TIMESTAMPTZ NOT NULL,
        started_on TIMESTAMPTZ,
        singleton_key TEXT,
        singleton_on TIMESTAMPTZ,
        expire_in_seconds BIGINT NOT NULL,
        created_on TIMESTAMPTZ NOT NULL,
        completed_on TIMESTAMPTZ,
        keep_until TIMESTAMPTZ NOT NULL,
        output JSONB,
        dead_letter TEXT,
        policy TEXT NOT NULL CHECK (policy IN ('standard', 'short', 'singleton', 'stately')),
        archived_on TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE INDEX IF NOT EXISTS archive_archived_on_idx ON archive (archived_on);

    CREATE TABLE IF NOT EXISTS schedule (
        name TEXT PRIMARY KEY REFERENCES queue(name) ON DELETE CASCADE,
        cron TEXT NOT NULL,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        data JSONB,
        options JSONB
    );

    CREATE TABLE IF NOT EXISTS subscription (
        event TEXT NOT NULL,
        name TEXT NOT NULL REFERENCES queue(name) ON DELETE CASCADE,
        PRIMARY KEY (event, name)
    );

    CREATE TABLE IF NOT EXISTS version (
        version INTEGER PRIMARY KEY,
        maintained_on TIMESTAMPTZ,
        monitored_on TIMESTAMPTZ,
        cron_on TIMESTAMPTZ
    );

    INSERT INTO version (version, maintained_on, monitored_on, cron_on)
    VALUES (1, NULL, NULL, NULL)
    ON CONFLICT (version) DO NOTHING;
    "#,
];

/// Installs or migrates the schema to the latest version. Safe to call
/// concurrently from multiple instances at start-up: every statement is
/// `IF NOT EXISTS`/`ON CONFLICT DO NOTHING`, and the loop simply re-applies
/// any migration that didn't already leave its mark.
pub async fn install(pool: &PgPool) -> Result<(), sqlx::Error> {
    let current_version: i64 = sqlx::query(
        "SELECT to_regclass('public.version') IS NOT NULL AS exists",
    )
    .fetch_one(pool)
    .await
    .ok()
    .and_then(|row| row.try_get::<bool, _>("exists").ok())
    .and_then(|exists| if exists { Some(()) } else { None })
    .map(|_| 1)
    .unwrap_or(0);

    for migration in MIGRATIONS.iter().skip(current_version.max(0) as usize) {
        sqlx::raw_sql(migration).execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_migration_is_non_empty() {
        for migration in MIGRATIONS {
            assert!(!migration.trim().is_empty());
        }
    }
}
