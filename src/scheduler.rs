//! # Scheduler
//!
//! Turns a five-field cron expression (plus the `@hourly`/`@daily`/
//! `@weekly`/`@monthly` descriptors) and an intent's recorded
//! `lastScheduledTime`/`nextScheduledTime` into a single decision: fire now,
//! or wait until a computed instant. Execution-history trimming to
//! `maxExecutionHistory` lives here too, since both are facets of the same
//! "how does a scheduled intent evolve across reconciliations" concern.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

use crate::{ExecutionRecord, Phase};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidExpression(String, String),
    #[error("cron expression '{0}' has no upcoming fire time")]
    NoUpcomingFire(String),
    #[error("stored nextScheduledTime '{0}' is not a valid RFC3339 timestamp")]
    InvalidTimestamp(String),
}

/// What the reconciler should do this pass for a scheduled intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// `suspend` is set; stay Pending and check back in one minute.
    Suspended,
    /// Fire now (first run, or the planned instant has arrived).
    ExecuteNow,
    /// Not due yet; persist `next_scheduled_time` and requeue at that
    /// instant.
    Wait { next_scheduled_time: DateTime<Utc> },
}

/// Minimum requeue delay the scheduler ever returns, even when a cron's
/// next fire is sooner than this.
const MIN_REQUEUE_SECS: i64 = 60;

/// Parses `expression` and compiles it into a `cron::Schedule`. Accepts the
/// four named descriptors alongside raw five-field cron syntax.
fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    let normalized = match expression.trim() {
        "@hourly" => "0 0 * * * *".to_string(),
        "@daily" => "0 0 0 * * *".to_string(),
        "@weekly" => "0 0 0 * * 0".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        other => {
            // `cron` expects six fields (seconds first); the spec's
            // five-field POSIX syntax omits seconds, so prefix "0 ".
            let field_count = other.split_whitespace().count();
            if field_count == 5 {
                format!("0 {other}")
            } else {
                other.to_string()
            }
        }
    };
    Schedule::from_str(&normalized)
        .map_err(|e| SchedulerError::InvalidExpression(expression.to_string(), e.to_string()))
}

/// Compute the next fire time strictly after `after`, enforcing the
/// `MIN_REQUEUE_SECS` floor so a very frequent cron expression cannot cause
/// a tight reconcile loop.
pub fn next_fire_after(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let schedule = parse_schedule(expression)?;
    let upcoming = schedule
        .after(&after)
        .next()
        .ok_or_else(|| SchedulerError::NoUpcomingFire(expression.to_string()))?;
    let floor = after + chrono::Duration::seconds(MIN_REQUEUE_SECS);
    Ok(upcoming.max(floor))
}

/// Decide what to do this pass, per §4.2's decision rule:
/// - `suspend` wins unconditionally.
/// - No `lastScheduledTime` recorded yet → fire immediately.
/// - `now >= nextScheduledTime` → fire now.
/// - Otherwise wait, replanning `nextScheduledTime` if it is missing or
///   stale relative to `expression`.
pub fn decide(
    expression: &str,
    suspend: bool,
    last_scheduled_time: Option<&str>,
    next_scheduled_time: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Decision, SchedulerError> {
    if suspend {
        return Ok(Decision::Suspended);
    }
    if last_scheduled_time.is_none() {
        return Ok(Decision::ExecuteNow);
    }

    let next = match next_scheduled_time {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| SchedulerError::InvalidTimestamp(raw.to_string()))?,
        None => next_fire_after(expression, now)?,
    };

    if now >= next {
        Ok(Decision::ExecuteNow)
    } else {
        Ok(Decision::Wait {
            next_scheduled_time: next,
        })
    }
}

/// Prepend a new `ExecutionRecord` and trim the history to
/// `max_execution_history` (newest first; oldest entries dropped from the
/// tail).
pub fn record_execution(
    history: &mut Vec<ExecutionRecord>,
    now: DateTime<Utc>,
    phase: Phase,
    outcome: Option<String>,
    message: Option<String>,
    max_execution_history: i32,
) {
    history.insert(
        0,
        ExecutionRecord {
            execution_time: now.to_rfc3339(),
            outcome,
            phase,
            message,
        },
    );
    let max = usize::try_from(max_execution_history.max(1)).unwrap_or(1);
    history.truncate(max);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn suspend_always_wins() {
        let decision = decide("@hourly", true, Some("2026-01-01T00:00:00Z"), None, at(2026, 1, 1, 0, 30)).unwrap();
        assert_eq!(decision, Decision::Suspended);
    }

    #[test]
    fn first_run_with_no_last_scheduled_time_fires_immediately() {
        let decision = decide("@daily", false, None, None, at(2026, 1, 1, 12, 0)).unwrap();
        assert_eq!(decision, Decision::ExecuteNow);
    }

    #[test]
    fn fires_when_now_reaches_next_scheduled_time() {
        let decision = decide(
            "@hourly",
            false,
            Some("2026-01-01T00:00:00Z"),
            Some("2026-01-01T01:00:00Z"),
            at(2026, 1, 1, 1, 0),
        )
        .unwrap();
        assert_eq!(decision, Decision::ExecuteNow);
    }

    #[test]
    fn waits_and_keeps_next_scheduled_time_when_not_due() {
        let decision = decide(
            "@hourly",
            false,
            Some("2026-01-01T00:00:00Z"),
            Some("2026-01-01T01:00:00Z"),
            at(2026, 1, 1, 0, 30),
        )
        .unwrap();
        assert_eq!(
            decision,
            Decision::Wait {
                next_scheduled_time: at(2026, 1, 1, 1, 0)
            }
        );
    }

    #[test]
    fn next_fire_after_is_strictly_greater_than_now() {
        let now = at(2026, 3, 15, 9, 42);
        let next = next_fire_after("@daily", now).unwrap();
        assert!(next > now);
        assert!(next < now + chrono::Duration::days(366));
    }

    #[test]
    fn five_field_expressions_are_accepted() {
        let next = next_fire_after("0 9 * * 1-5", at(2026, 1, 1, 0, 0));
        assert!(next.is_ok());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let err = parse_schedule("not a cron expression").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidExpression(_, _)));
    }

    #[test]
    fn record_execution_trims_to_max_history() {
        let mut history = Vec::new();
        for i in 0..5 {
            record_execution(
                &mut history,
                at(2026, 1, 1, 0, i),
                Phase::Committed,
                Some("ok".to_string()),
                None,
                3,
            );
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].execution_time, at(2026, 1, 1, 0, 4).to_rfc3339());
    }
}
