//! Per-step retry policy

use fleet_shared::defaults;
use std::time::Duration;

/// Delay between attempts of the same step
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Same delay before every retry
    Fixed(Duration),
    /// `initial * factor^(n-1)` before retry n, capped at `max`
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
}

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff::Exponential {
            initial,
            max,
            factor: 2.0,
        }
    }

    /// Delay after `failed_attempts` consecutive failures (1-based)
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                if failed_attempts == 0 {
                    return Duration::ZERO;
                }
                // exponent capped to keep the float finite
                let exponent = (failed_attempts - 1).min(30) as i32;
                let secs = initial.as_secs_f64() * factor.powi(exponent);
                if secs.is_nan() || secs <= 0.0 {
                    Duration::ZERO
                } else if secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::try_from_secs_f64(secs).unwrap_or(*max)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; never below 1
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run once, never retry
    pub fn once() -> Self {
        Self::new(1, Backoff::None)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the attempt following `attempts` failures
    pub fn delay_after(&self, attempts: u32) -> Duration {
        self.backoff.delay(attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            defaults::STEP_MAX_ATTEMPTS,
            Backoff::exponential(
                Duration::from_millis(defaults::STEP_BACKOFF_INITIAL_MS),
                Duration::from_millis(defaults::STEP_BACKOFF_MAX_MS),
            ),
        )
    }
}
