//! Admission validator. Normalizes user input into the canonical form the
//! rest of the system assumes, rejecting anything malformed before it ever
//! touches storage.

use std::str::FromStr;

use chrono_tz::Tz;
use cron::Schedule as CronSchedule;

use crate::error::{QueueError, QueueResult};
use crate::model::QueuePolicy;
use crate::options::{QueueOptions, SendOptions};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_SINGLETON_KEY_LEN: usize = 255;
pub const MAX_EXPIRE_SECONDS: i64 = 24 * 60 * 60;

/// Queue names are non-empty, at most 255 characters, drawn from
/// `[A-Za-z0-9_.-]`.
pub fn validate_queue_name(name: &str) -> QueueResult<()> {
    if name.is_empty() {
        return Err(QueueError::Validation("queue name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(QueueError::Validation(format!(
            "queue name must be at most {MAX_NAME_LEN} characters, got {}",
            name.len()
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err(QueueError::Validation(format!(
            "queue name {name:?} contains characters outside [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

/// Priority is a 16-bit signed integer; reject anything that would
/// truncate.
pub fn validate_priority(priority: i32) -> QueueResult<i16> {
    i16::try_from(priority)
        .map_err(|_| QueueError::Validation(format!("priority {priority} exceeds 16-bit range")))
}

/// Non-negative duration bounded by `max`. Used for `retryDelay`,
/// `expireInSeconds`, `retentionMinutes`, and the supervisor/timekeeper
/// interval settings.
pub fn validate_duration_seconds(field: &str, value: i64, max: i64) -> QueueResult<()> {
    if value < 0 {
        return Err(QueueError::Validation(format!(
            "{field} must be non-negative, got {value}"
        )));
    }
    if value > max {
        return Err(QueueError::Validation(format!(
            "{field} must be at most {max}, got {value}"
        )));
    }
    Ok(())
}

/// Singleton keys are bounded the same as queue names; the bucket width
/// must be positive (a zero or negative window cannot debounce anything).
pub fn validate_singleton_key(key: &str) -> QueueResult<()> {
    if key.len() > MAX_SINGLETON_KEY_LEN {
        return Err(QueueError::Validation(format!(
            "singleton key must be at most {MAX_SINGLETON_KEY_LEN} characters, got {}",
            key.len()
        )));
    }
    Ok(())
}

pub fn validate_singleton_seconds(seconds: i64) -> QueueResult<()> {
    if seconds <= 0 {
        return Err(QueueError::Validation(format!(
            "singletonSeconds must be positive, got {seconds}"
        )));
    }
    Ok(())
}

/// Parses and validates a 5-field cron expression against an IANA
/// timezone, returning both so the caller never has to reparse.
pub fn validate_cron(expression: &str, timezone: &str) -> QueueResult<(CronSchedule, Tz)> {
    let tz = Tz::from_str(timezone)
        .map_err(|_| QueueError::Validation(format!("{timezone} is not a known IANA timezone")))?;

    // The `cron` crate expects a leading seconds field; schedules are
    // stored in the standard 5-field `minute hour dom month dow` form, so
    // a literal "0" is prepended before parsing.
    let six_field = format!("0 {expression}");
    let schedule = CronSchedule::from_str(&six_field)
        .map_err(|e| QueueError::Validation(format!("invalid cron expression {expression:?}: {e}")))?;

    Ok((schedule, tz))
}

/// Validates a fully-assembled [`SendOptions`], including recursive
/// validation of an embedded dead-letter queue name.
pub fn validate_send_options(opts: &SendOptions) -> QueueResult<()> {
    if let Some(seconds) = opts.singleton_seconds {
        validate_singleton_seconds(seconds)?;
    }
    if let Some(key) = &opts.singleton_key {
        validate_singleton_key(key)?;
    }
    if let Some(delay) = opts.retry_delay {
        validate_duration_seconds("retryDelay", delay, i64::MAX)?;
    }
    if let Some(expire) = opts.expire_in_seconds {
        validate_duration_seconds("expireInSeconds", expire, MAX_EXPIRE_SECONDS)?;
    }
    if let Some(dead_letter) = &opts.dead_letter {
        validate_queue_name(dead_letter)?;
    }
    Ok(())
}

/// Validates a [`QueueOptions`] record, including the recursive
/// dead-letter queue name check from §4.6.
pub fn validate_queue_options(opts: &QueueOptions) -> QueueResult<()> {
    validate_duration_seconds("retryDelay", opts.retry_delay, i64::MAX)?;
    validate_duration_seconds("expireSeconds", opts.expire_seconds, MAX_EXPIRE_SECONDS)?;
    if opts.expire_seconds == 0 {
        return Err(QueueError::Validation(
            "expireSeconds must be greater than zero".into(),
        ));
    }
    validate_duration_seconds("retentionMinutes", opts.retention_minutes, i64::MAX)?;
    if opts.retention_minutes == 0 {
        return Err(QueueError::Validation(
            "retentionMinutes must be greater than zero".into(),
        ));
    }
    if opts.retry_limit < 0 {
        return Err(QueueError::Validation("retryLimit must be non-negative".into()));
    }
    if let Some(dead_letter) = &opts.dead_letter {
        validate_queue_name(dead_letter)?;
    }
    Ok(())
}

/// Parses a `QueuePolicy` from the on-disk representation, rejecting
/// anything outside the enumerated set.
pub fn validate_policy(raw: &str) -> QueueResult<QueuePolicy> {
    raw.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_conforming_queue_names() {
        assert!(validate_queue_name("test-queue").is_ok());
        assert!(validate_queue_name("test_queue.v2").is_ok());
    }

    #[test]
    fn rejects_empty_and_overlong_and_illegal_names() {
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(&"a".repeat(256)).is_err());
        assert!(validate_queue_name("bad name!").is_err());
        assert!(validate_queue_name("bad/name").is_err());
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(validate_priority(10).is_ok());
        assert!(validate_priority(i32::from(i16::MAX)).is_ok());
        assert!(validate_priority(i32::from(i16::MAX) + 1).is_err());
        assert!(validate_priority(i32::from(i16::MIN) - 1).is_err());
    }

    #[test]
    fn expire_seconds_caps_at_24_hours() {
        assert!(validate_duration_seconds("expireInSeconds", 24 * 60 * 60, MAX_EXPIRE_SECONDS).is_ok());
        assert!(validate_duration_seconds("expireInSeconds", 24 * 60 * 60 + 1, MAX_EXPIRE_SECONDS).is_err());
        assert!(validate_duration_seconds("expireInSeconds", -1, MAX_EXPIRE_SECONDS).is_err());
    }

    #[test]
    fn singleton_seconds_must_be_positive() {
        assert!(validate_singleton_seconds(1).is_ok());
        assert!(validate_singleton_seconds(0).is_err());
        assert!(validate_singleton_seconds(-5).is_err());
    }

    #[test]
    fn cron_parses_standard_five_field_expressions() {
        assert!(validate_cron("*/5 * * * *", "UTC").is_ok());
        assert!(validate_cron("0 9 * * 1-5", "America/New_York").is_ok());
    }

    #[test]
    fn cron_rejects_malformed_expressions_and_unknown_timezones() {
        assert!(validate_cron("not a cron", "UTC").is_err());
        assert!(validate_cron("*/5 * * * *", "Not/A_Zone").is_err());
    }

    #[test]
    fn debounce_and_throttle_keys_are_conventional_defaults() {
        assert_eq!(SendOptions::debounce_key("reports"), "debounce_reports");
        assert_eq!(SendOptions::throttle_key("reports"), "throttle_reports");
    }

    #[test]
    fn queue_options_rejects_zero_expiry_and_retention() {
        let mut opts = QueueOptions::default();
        opts.expire_seconds = 0;
        assert!(validate_queue_options(&opts).is_err());

        let mut opts = QueueOptions::default();
        opts.retention_minutes = 0;
        assert!(validate_queue_options(&opts).is_err());
    }

    #[test]
    fn queue_options_validates_dead_letter_name_recursively() {
        let mut opts = QueueOptions::default();
        opts.dead_letter = Some("bad name!".into());
        assert!(validate_queue_options(&opts).is_err());

        opts.dead_letter = Some("dlq".into());
        assert!(validate_queue_options(&opts).is_ok());
    }
}
