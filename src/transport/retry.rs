//! Connection retry policy.
//!
//! A request is retried only when the connection broke before any
//! response byte arrived. The upload body is reset and rewound by the
//! caller before the next attempt.

use crate::base::neterror::NetError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for broken connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_attempts: usize,
    /// Delay before the first retry, doubled for each further one.
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added on top, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Delay before retrying after `attempts` failed retries ended in
    /// `error`. `None` means the error is final.
    pub fn next_delay(&self, attempts: usize, error: &NetError) -> Option<Duration> {
        if !is_connection_failure(error) || attempts >= self.max_attempts {
            return None;
        }
        Some(self.backoff(attempts))
    }

    /// Backoff for the retry following `attempts` earlier retries.
    fn backoff(&self, attempts: usize) -> Duration {
        let shift = attempts.min(10) as u32;
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);

        // Deterministic so that tests can pin the schedule.
        let spread = (delay as f64 * self.jitter_factor) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            (attempts as u64 + 1) * 7 % spread
        };
        Duration::from_millis(delay.saturating_add(jitter))
    }
}

/// Failures where the server may never have seen the request.
fn is_connection_failure(error: &NetError) -> bool {
    matches!(
        error,
        NetError::ConnectionReset
            | NetError::ConnectionClosed
            | NetError::ConnectionAborted
            | NetError::SocketNotConnected
            | NetError::EmptyResponse
            | NetError::ConnectionTimedOut
            | NetError::NetworkChanged
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat() -> RetryConfig {
        RetryConfig {
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_until_capped() {
        let config = RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 2500,
            ..flat()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(1000));
        assert_eq!(config.backoff(1), Duration::from_millis(2000));
        assert_eq!(config.backoff(2), Duration::from_millis(2500));
        assert_eq!(config.backoff(40), Duration::from_millis(2500));
    }

    #[test]
    fn test_jitter_stays_within_factor() {
        let config = RetryConfig::default();
        for attempts in 0..3 {
            let delay = config.backoff(attempts).as_millis() as u64;
            let base = 100u64 << attempts;
            assert!(delay >= base && delay <= base + base / 10, "{}", delay);
        }
    }

    #[test]
    fn test_only_connection_failures_retry() {
        let config = flat();
        assert_eq!(
            config.next_delay(0, &NetError::ConnectionReset),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            config.next_delay(1, &NetError::EmptyResponse),
            Some(Duration::from_millis(200))
        );
        assert_eq!(config.next_delay(0, &NetError::ConnectionRefused), None);
        assert_eq!(config.next_delay(0, &NetError::TooManyRedirects), None);
    }

    #[test]
    fn test_attempts_run_out() {
        let config = flat();
        assert!(config.next_delay(2, &NetError::ConnectionClosed).is_some());
        assert_eq!(config.next_delay(3, &NetError::ConnectionClosed), None);
        assert_eq!(
            RetryConfig::no_retry().next_delay(0, &NetError::ConnectionReset),
            None
        );
    }
}
