//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for fixed-interval broker dialing and jittered exponential
//! backoff for client calls.

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use tonic::{Code, Status};

/// Fixed-interval backoff for dialing the broker.
///
/// Yields `max_attempts - 1` delays, so the caller makes `max_attempts`
/// attempts in total.
pub fn connect_backoff(delay: Duration, max_attempts: usize) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(max_attempts.saturating_sub(1))
}

/// Backoff for producer calls to the ingestion service.
///
/// - Min delay: 100ms
/// - Max delay: 2s
/// - Max attempts: 3
/// - Jitter enabled
pub fn client_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(3)
        .with_jitter()
}

/// Pause before requeueing a delivery that failed `failures` times in a row.
///
/// Doubles from `min` up to `max`, so a store outage does not turn into a
/// hot redelivery loop.
pub fn redelivery_delay(min: Duration, max: Duration, failures: u32) -> Duration {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .with_max_times(failures.clamp(1, 32) as usize)
        .build()
        .last()
        .unwrap_or(min)
}

/// Determines if a gRPC error is worth retrying.
///
/// Retryable codes:
/// - `Unavailable`: the server is down or restarting
///
/// Non-retryable:
/// - `DeadlineExceeded`: the request may have been accepted
/// - everything else: the server answered
pub fn is_retryable_status(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(is_retryable_status(&Status::unavailable("connection refused")));
        assert!(!is_retryable_status(&Status::deadline_exceeded("timeout")));
        assert!(!is_retryable_status(&Status::invalid_argument("bad")));
        assert!(!is_retryable_status(&Status::internal("Internal error")));
    }

    #[test]
    fn test_connect_backoff_yields_one_less_than_attempts() {
        let delays: Vec<Duration> = connect_backoff(Duration::from_millis(7), 30)
            .build()
            .collect();
        assert_eq!(delays.len(), 29);
        assert!(delays.iter().all(|d| *d == Duration::from_millis(7)));
    }

    #[test]
    fn test_connect_backoff_single_attempt_has_no_delays() {
        assert_eq!(connect_backoff(Duration::from_secs(1), 1).build().count(), 0);
        assert_eq!(connect_backoff(Duration::from_secs(1), 0).build().count(), 0);
    }

    #[test]
    fn test_client_backoff_is_bounded() {
        let delays: Vec<Duration> = client_backoff().build().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(4)));
    }

    #[test]
    fn test_redelivery_delay_doubles_up_to_max() {
        let min = Duration::from_millis(10);
        let max = Duration::from_millis(40);
        assert_eq!(redelivery_delay(min, max, 0), min);
        assert_eq!(redelivery_delay(min, max, 1), min);
        assert_eq!(redelivery_delay(min, max, 2), Duration::from_millis(20));
        assert_eq!(redelivery_delay(min, max, 10), max);
        assert_eq!(redelivery_delay(min, max, u32::MAX), max);
    }
}
