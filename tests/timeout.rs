//! Timeout Integration Tests
//!
//! Tests for transfer and job wait limits and retry backoff as loaded from
//! configuration.

use std::time::Duration;

use beamflow::core::RetryPolicy;
use beamflow::Settings;

#[test]
fn test_transfer_timeout_configuration() {
    let yaml = r#"
transfer:
  poll_interval_secs: 2
  max_wait_secs: 900
  retry:
    max_attempts: 4
    initial_delay_ms: 500
"#;

    let settings = Settings::from_yaml(yaml, None).unwrap();
    let transfer = settings.transfer.settings();

    assert_eq!(transfer.poll_interval, Duration::from_secs(2));
    assert_eq!(transfer.max_wait, Duration::from_secs(900));
    assert_eq!(transfer.retry.max_attempts, 4);
    assert_eq!(transfer.retry.initial_delay_ms, 500);
    // Unset retry fields keep their defaults
    assert_eq!(transfer.retry.max_delay_ms, 30000);
}

#[test]
fn test_transfer_timeout_defaults() {
    let settings = Settings::from_yaml("{}", None).unwrap();
    let transfer = settings.transfer.settings();

    assert_eq!(transfer.poll_interval, Duration::from_secs(5));
    assert_eq!(transfer.max_wait, Duration::from_secs(600));
    assert_eq!(transfer.retry.max_attempts, 3);
}

#[test]
fn test_job_timeout_configuration() {
    let settings = Settings::from_yaml("compute:\n  max_wait_secs: 3600\n", None).unwrap();
    let polling = settings.compute.polling();

    assert_eq!(polling.max_wait, Duration::from_secs(3600));
    // Poll interval falls back to the default
    assert_eq!(polling.poll_interval, Duration::from_secs(10));
}

#[test]
fn test_job_timeout_defaults() {
    let settings = Settings::from_yaml("{}", None).unwrap();
    let polling = settings.compute.polling();

    assert_eq!(polling.poll_interval, Duration::from_secs(10));
    assert_eq!(polling.max_wait, Duration::from_secs(7200));
}

#[test]
fn test_retry_backoff_is_capped() {
    let policy = RetryPolicy {
        max_attempts: 10,
        initial_delay_ms: 1000,
        max_delay_ms: 5000,
        backoff_multiplier: 2.0,
    };

    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5000));
    assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(5000));
}

#[test]
fn test_retry_attempts_exhaust() {
    let policy = RetryPolicy::default();

    assert!(policy.should_retry(1));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3), "Third failed attempt is the last");
}
