//! Domain types shared by every storage backend: queues, jobs, schedules,
//! subscriptions, and the coordination singleton row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique job identifier. A UUIDv4 string at rest.
pub type JobId = Uuid;

/// Default job retention from creation, used when a caller does not set
/// `keep_until` explicitly.
pub const DEFAULT_RETENTION: Duration = Duration::days(14);

/// Execution policy attached to a queue at creation time and copied onto
/// every job inserted into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// No special admission behavior.
    #[default]
    Standard,
    /// Short-lived jobs; queues expect a tight expiry.
    Short,
    /// At most one non-terminal job per `(singleton_key, singleton_on)` bucket.
    Singleton,
    /// Jobs carry state transitions beyond the base lifecycle (reserved for
    /// downstream extension; behaves like `Standard` at this layer).
    Stately,
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Short => "short",
            Self::Singleton => "singleton",
            Self::Stately => "stately",
        };
        f.write_str(s)
    }
}

impl FromStr for QueuePolicy {
    type Err = crate::error::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "short" => Ok(Self::Short),
            "singleton" => Ok(Self::Singleton),
            "stately" => Ok(Self::Stately),
            other => Err(crate::error::QueueError::Validation(format!(
                "{other} is not a valid queue policy"
            ))),
        }
    }
}

/// Lifecycle state of a job. See the state machine in the design doc: the
/// only edge out of a terminal state is `resume`, which returns a
/// `Cancelled` job to `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Created,
    Retry,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    /// Terminal states are `completed`, `cancelled`, and `failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// States visible to `fetch`: a job can only be claimed out of these.
    pub fn is_fetchable(&self) -> bool {
        matches!(self, Self::Created | Self::Retry)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobState {
    type Err = crate::error::QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "retry" => Ok(Self::Retry),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            invalid => Err(crate::error::QueueError::Validation(format!(
                "{invalid} is not a valid job state"
            ))),
        }
    }
}

/// A named destination for jobs, carrying the default retry/expiry/retention
/// policy every job inserted into it inherits unless overridden per-send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub policy: QueuePolicy,
    pub retry_limit: i32,
    pub retry_delay: i64,
    pub retry_backoff: bool,
    pub expire_seconds: i64,
    pub retention_minutes: i64,
    pub dead_letter: Option<String>,
}

impl Queue {
    /// Sensible defaults for a freshly created queue: no retries, a one
    /// minute expiry, and fourteen days of archive retention (matching
    /// `DEFAULT_RETENTION` on the job row itself).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
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

/// A single unit of work: payload plus full lifecycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub priority: i16,
    pub data: Option<Value>,
    pub state: JobState,
    pub retry_limit: i32,
    pub retry_count: i32,
    pub retry_delay: i64,
    pub retry_backoff: bool,
    pub start_after: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub singleton_key: Option<String>,
    pub singleton_on: Option<DateTime<Utc>>,
    pub expire_in_seconds: i64,
    pub created_on: DateTime<Utc>,
    pub completed_on: Option<DateTime<Utc>>,
    pub keep_until: DateTime<Utc>,
    pub output: Option<Value>,
    pub dead_letter: Option<String>,
    pub policy: QueuePolicy,
}

impl Job {
    /// Whether `retry_count` has reached the point where one more failure
    /// exhausts the configured limit.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.retry_limit
    }

    /// The delay to apply before the next fetch-visible attempt, per the
    /// queue's backoff policy: linear (`retry_delay`) or exponential
    /// (`retry_delay * 2^retry_count`).
    pub fn next_retry_delay(&self) -> Duration {
        if self.retry_backoff {
            let factor = 2i64.saturating_pow(self.retry_count.max(0) as u32);
            Duration::seconds(self.retry_delay.saturating_mul(factor))
        } else {
            Duration::seconds(self.retry_delay)
        }
    }
}

/// A cron-driven recurring send, one row per target queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub data: Option<Value>,
    pub options: Option<Value>,
}

/// An event-to-queue fan-out binding. `publish(event, ..)` enqueues one
/// `send` per subscribed queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub event: String,
    pub name: String,
}

/// The coordination singleton row: schema version plus the three
/// leader-election leases consumed by the supervisor and timekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub version: i32,
    pub maintained_on: Option<DateTime<Utc>>,
    pub monitored_on: Option<DateTime<Utc>>,
    pub cron_on: Option<DateTime<Utc>>,
}

/// Quantize `now` to the nearest multiple of `seconds`, producing the
/// singleton/debounce/throttle bucket. Two sends inside the same bucket
/// collide on the `(name, singleton_key, singleton_on)` unique key.
pub fn singleton_bucket(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    if seconds <= 0 {
        return now;
    }
    let epoch_seconds = now.timestamp();
    let floored = (epoch_seconds / seconds) * seconds;
    DateTime::from_timestamp(floored, 0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_bucket_floors_to_interval() {
        let t = DateTime::parse_from_rfc3339("2026-07-27T12:00:07Z")
            .unwrap()
            .with_timezone(&Utc);
        let bucket = singleton_bucket(t, 10);
        assert_eq!(bucket.timestamp() % 10, 0);
        assert!(bucket <= t);
    }

    #[test]
    fn singleton_bucket_same_window_collides() {
        let a = DateTime::parse_from_rfc3339("2026-07-27T12:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-07-27T12:00:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(singleton_bucket(a, 10), singleton_bucket(b, 10));
    }

    #[test]
    fn singleton_bucket_next_window_differs() {
        let a = DateTime::parse_from_rfc3339("2026-07-27T12:00:09Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = DateTime::parse_from_rfc3339("2026-07-27T12:00:11Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_ne!(singleton_bucket(a, 10), singleton_bucket(b, 10));
    }

    #[test]
    fn job_state_round_trips_through_display_and_from_str() {
        for state in [
            JobState::Created,
            JobState::Retry,
            JobState::Active,
            JobState::Completed,
            JobState::Cancelled,
            JobState::Failed,
        ] {
            let parsed: JobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn terminal_states_are_exactly_completed_cancelled_failed() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Retry.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn backoff_delay_doubles_per_attempt() {
        let mut job = Job {
            id: Uuid::nil(),
            name: "q".into(),
            priority: 0,
            data: None,
            state: JobState::Retry,
            retry_limit: 5,
            retry_count: 0,
            retry_delay: 1,
            retry_backoff: true,
            start_after: Utc::now(),
            started_on: None,
            singleton_key: None,
            singleton_on: None,
            expire_in_seconds: 60,
            created_on: Utc::now(),
            completed_on: None,
            keep_until: Utc::now(),
            output: None,
            dead_letter: None,
            policy: QueuePolicy::Standard,
        };
        assert_eq!(job.next_retry_delay(), Duration::seconds(1));
        job.retry_count = 1;
        assert_eq!(job.next_retry_delay(), Duration::seconds(2));
        job.retry_count = 2;
        assert_eq!(job.next_retry_delay(), Duration::seconds(4));
    }

    #[test]
    fn linear_delay_ignores_attempt_count() {
        let job = Job {
            id: Uuid::nil(),
            name: "q".into(),
            priority: 0,
            data: None,
            state: JobState::Retry,
            retry_limit: 5,
            retry_count: 3,
            retry_delay: 7,
            retry_backoff: false,
            start_after: Utc::now(),
            started_on: None,
            singleton_key: None,
            singleton_on: None,
            expire_in_seconds: 60,
            created_on: Utc::now(),
            completed_on: None,
            keep_until: Utc::now(),
            output: None,
            dead_letter: None,
            policy: QueuePolicy::Standard,
        };
        assert_eq!(job.next_retry_delay(), Duration::seconds(7));
    }
}
