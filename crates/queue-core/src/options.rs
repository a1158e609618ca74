//! Closed-set configuration structs for every operation that takes options.
//! None of these are free-form maps: each is a struct with a `Default`
//! impl, replacing a dynamic option bag with something the compiler can
//! check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::QueuePolicy;

/// Options accepted by `send`/`insert`. All fields are optional; unset
/// fields fall back to the target queue's configured defaults.
///
/// Serializable so a [`crate::model::Schedule`] can persist the options a
/// recurring send should replay each time its cron fires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// Caller-provided id. A fresh UUIDv4 is minted when absent.
    pub id: Option<Uuid>,
    pub priority: i16,
    /// Defaults to "now" when unset.
    pub start_after: Option<DateTime<Utc>>,
    pub singleton_key: Option<String>,
    /// Bucket width in seconds for singleton/debounce/throttle admission.
    pub singleton_seconds: Option<i64>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i64>,
    pub retry_backoff: Option<bool>,
    pub expire_in_seconds: Option<i64>,
    pub keep_until: Option<DateTime<Utc>>,
    pub dead_letter: Option<String>,
}

impl SendOptions {
    /// `debounce_<queue>` is the conventional singleton key when the
    /// caller wants "at most one job per window" without naming a key.
    pub fn debounce_key(queue: &str) -> String {
        format!("debounce_{queue}")
    }

    /// `throttle_<queue>` is the same mechanism under a different name,
    /// conventionally used when admitting the *first* call in a window
    /// rather than deduplicating a burst.
    pub fn throttle_key(queue: &str) -> String {
        format!("throttle_{queue}")
    }
}

/// Options accepted by `fetch`.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: i64,
    pub include_metadata: bool,
    /// Order by priority descending, ties broken by `created_on` then `id`.
    pub priority: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            include_metadata: false,
            priority: true,
        }
    }
}

/// Options accepted by `createQueue`/`updateQueue`.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub policy: QueuePolicy,
    pub retry_limit: i32,
    pub retry_delay: i64,
    pub retry_backoff: bool,
    pub expire_seconds: i64,
    pub retention_minutes: i64,
    pub dead_letter: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            policy: QueuePolicy::Standard,
            retry_limit: 0,
            retry_delay: 0,
            retry_backoff: false,
            expire_seconds: 900,
            retention_minutes: 60 * 24 * 14,
            dead_letter: None,
        }
    }
}

/// Options accepted by `schedule`.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// IANA timezone name; defaults to UTC.
    pub timezone: Option<String>,
    pub data: Option<Value>,
    /// Carried through verbatim and replayed as `SendOptions` each time the
    /// schedule fires.
    pub send_options: Option<SendOptions>,
}
