//! # Error Handling Constants Tests
//!
//! Verifies the fixed requeue delays and retry bounds from §7's error
//! taxonomy match the spec-mandated values. Unlike the teacher's
//! Fibonacci-backoff tests, these delays are fixed per error category
//! (§4.1), not progressive — see DESIGN.md's Open Question decisions for
//! why that divergence from the teacher is deliberate.

use git_change_operator::constants::{
    PROBE_RESPONSE_TRUNCATE_BYTES, REQUEUE_EXECUTION_FAILURE_SECS, REQUEUE_PROBE_UNMET_SECS,
    REQUEUE_TERMINAL_POLL_SECS, STATUS_WRITE_MAX_RETRIES, STATUS_WRITE_RETRY_SPACING_MS,
};

#[test]
fn execution_failure_requeues_after_five_minutes() {
    assert_eq!(REQUEUE_EXECUTION_FAILURE_SECS, 5 * 60);
}

#[test]
fn unmet_probe_condition_requeues_after_two_minutes() {
    assert_eq!(REQUEUE_PROBE_UNMET_SECS, 2 * 60);
}

#[test]
fn terminal_state_polls_after_one_minute() {
    assert_eq!(REQUEUE_TERMINAL_POLL_SECS, 60);
}

#[test]
fn status_write_conflicts_retry_at_most_three_times_spaced_100ms() {
    assert_eq!(STATUS_WRITE_MAX_RETRIES, 3);
    assert_eq!(STATUS_WRITE_RETRY_SPACING_MS, 100);
}

#[test]
fn probe_responses_are_truncated_to_1024_bytes() {
    assert_eq!(PROBE_RESPONSE_TRUNCATE_BYTES, 1024);
}
