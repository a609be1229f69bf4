//! Bounded exponential backoff for single-writer contention.
//!
//! SQLite admits one writer at a time. A second writer sees `SQLITE_BUSY`
//! once the engine's own busy timeout expires; [`RetryPolicy`] decides how
//! many more times the caller tries and how long it sleeps in between.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::serde_secs;
use crate::error::PoolError;

/// Exponential backoff with a capped delay and a capped attempt count.
///
/// With the defaults the delays between five attempts are 10, 20, 40 and
/// 80 ms; larger attempt counts flatten out at `max_backoff` (250 ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff", with = "serde_secs")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_backoff", with = "serde_secs")]
    pub max_backoff: Duration,

    /// Growth factor applied after each retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(10)
}

fn default_max_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Checks the policy invariants.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if `max_attempts` is zero, the
    /// multiplier is below 1.0 or not finite, or `initial_backoff` exceeds
    /// `max_backoff`.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_attempts == 0 {
            return Err(PoolError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(PoolError::InvalidConfig(format!(
                "retry.multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(PoolError::InvalidConfig(
                "retry.initial_backoff exceeds retry.max_backoff".into(),
            ));
        }
        Ok(())
    }

    /// Delay to sleep before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails with a non-busy error, or the
    /// attempts run out.
    ///
    /// `on_retry` is told the upcoming attempt number and the delay before
    /// the thread sleeps.
    ///
    /// # Errors
    ///
    /// Non-busy errors are returned as-is. When every attempt reports a
    /// busy database the last busy error is wrapped in
    /// `PoolError::WriteContention`.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, PoolError>,
        mut on_retry: impl FnMut(u32, Duration),
    ) -> Result<T, PoolError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(PoolError::Sqlite(source)) if crate::error::is_busy_error(&source) => {
                    if attempt >= self.max_attempts {
                        return Err(PoolError::WriteContention {
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    on_retry(attempt, delay);
                    thread::sleep(delay);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> PoolError {
        PoolError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[test]
    fn delays_grow_then_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        assert_eq!(policy.delay_for(10), Duration::from_millis(250));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn retries_busy_until_success() {
        let mut calls = 0;
        let mut retries = Vec::new();
        let result = fast_policy(5).run(
            || {
                calls += 1;
                if calls < 3 {
                    Err(busy())
                } else {
                    Ok(calls)
                }
            },
            |attempt, _| retries.push(attempt),
        );
        assert_eq!(result.expect("third attempt should succeed"), 3);
        assert_eq!(retries, vec![2, 3]);
    }

    #[test]
    fn exhausting_attempts_reports_contention() {
        let mut calls = 0;
        let err = fast_policy(3)
            .run(
                || -> Result<(), PoolError> {
                    calls += 1;
                    Err(busy())
                },
                |_, _| {},
            )
            .expect_err("should give up");
        assert_eq!(calls, 3);
        match err {
            PoolError::WriteContention { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let err = fast_policy(5)
            .run(
                || -> Result<(), PoolError> {
                    calls += 1;
                    Err(PoolError::ShutDown)
                },
                |_, _| {},
            )
            .expect_err("should fail immediately");
        assert_eq!(calls, 1);
        assert!(matches!(err, PoolError::ShutDown));
    }

    #[test]
    fn validate_rejects_bad_policies() {
        assert!(fast_policy(0).validate().is_err());
        let shrinking = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        assert!(shrinking.validate().is_err());
        let inverted = RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }
}
