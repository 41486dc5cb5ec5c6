//! Reconnection retry policies.
//!
//! The connectivity manager asks its policy how long to wait before each
//! reassociation attempt. `Immediate` retries at once forever; `Backoff` grows
//! the delay exponentially with jitter and caps it.

use std::time::Duration;

/// Default base delay for exponential backoff (in milliseconds).
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Default ceiling for exponential backoff (in milliseconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// How the connectivity manager paces reconnection attempts.
///
/// Attempts are never bounded; only the spacing between them changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Re-invoke association right away after every loss
    #[default]
    Immediate,

    /// Exponential delay `base * 2^(attempt-1)` plus up to 25% jitter, capped at `max`
    Backoff { base: Duration, max: Duration },
}

impl RetryPolicy {
    /// Backoff policy with the default base and ceiling.
    pub fn backoff() -> Self {
        RetryPolicy::Backoff {
            base: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }

    /// Delay before the given attempt. Attempts are numbered from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Backoff { base, max } => {
                let base_ms = base.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                let exponent = attempt.saturating_sub(1).min(10);

                // base * 2^(attempt-1)
                let exponential = base_ms.saturating_mul(1 << exponent);

                // Add jitter (up to 25% of the delay)
                let jitter = rand::random::<u64>() % (exponential / 4 + 1);

                Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RetryPolicy::Immediate => "immediate",
            RetryPolicy::Backoff { .. } => "backoff",
        }
    }
}
