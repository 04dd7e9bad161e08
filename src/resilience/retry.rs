//! Retry decisions for a single request.

use crate::client::Outcome;
use crate::config::RetryConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What to do after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The outcome is final; hand it to the caller.
    Done,
    /// Send the request again after `delay`.
    Retry {
        /// Time to wait first.
        delay: Duration,
        /// True when the wait was dictated by a rate limit.
        throttled: bool,
    },
    /// A ceiling was reached.
    Exhausted,
}

/// Attempt counters for one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptState {
    /// Transient and server failures so far.
    pub failures: u32,
    /// Throttled waits so far.
    pub throttle_waits: u32,
}

/// Retry policy with exponential backoff.
///
/// Transient failures and server errors count against `max_attempts`;
/// throttled responses count against `max_throttle_waits` and wait for the
/// server-advertised reset instead of backing off.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: f64,
    max_throttle_waits: u32,
    min_throttle_wait: Duration,
}

impl RetryPolicy {
    /// Creates a policy from retry configuration.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
            jitter: config.jitter.clamp(0.0, 1.0),
            max_throttle_waits: config.max_throttle_waits,
            min_throttle_wait: config.min_throttle_wait,
        }
    }

    /// Maximum attempts for transient failures.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what to do after an attempt ended with `outcome`.
    pub fn decide(
        &self,
        outcome: &Outcome,
        state: &mut AttemptState,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        match outcome {
            Outcome::Success | Outcome::NotFoundOrForbidden { .. } | Outcome::ClientError { .. } => {
                RetryDecision::Done
            }
            Outcome::Throttled {
                reset_at,
                retry_after,
                ..
            } => {
                if state.throttle_waits >= self.max_throttle_waits {
                    return RetryDecision::Exhausted;
                }
                state.throttle_waits += 1;
                RetryDecision::Retry {
                    delay: self.throttle_wait(*reset_at, *retry_after, now),
                    throttled: true,
                }
            }
            Outcome::ServerError { .. } | Outcome::Transient { .. } => {
                state.failures += 1;
                if state.failures >= self.max_attempts {
                    return RetryDecision::Exhausted;
                }
                RetryDecision::Retry {
                    delay: self.backoff_for(state.failures),
                    throttled: false,
                }
            }
        }
    }

    /// How long to wait on a throttled response.
    ///
    /// `retry-after` wins over the reset time; the result never drops below the
    /// configured floor.
    pub fn throttle_wait(
        &self,
        reset_at: Option<DateTime<Utc>>,
        retry_after: Option<u64>,
        now: DateTime<Utc>,
    ) -> Duration {
        let advertised = match (retry_after, reset_at) {
            (Some(secs), _) => Duration::from_secs(secs),
            (None, Some(reset)) => (reset - now).to_std().unwrap_or(Duration::ZERO),
            (None, None) => self.initial_backoff,
        };
        advertised.max(self.min_throttle_wait)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let jitter_range = capped * self.jitter;
        let jitter_value = rand_jitter() * jitter_range * 2.0 - jitter_range;
        let final_delay = (capped + jitter_value).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// Simple random jitter (0.0 to 1.0).
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as f64) / 1_000_000_000.0
}
