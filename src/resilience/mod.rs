//! Resilience patterns for the collector: adaptive throttling and retries.

mod rate_state;
mod retry;
mod throttle;

pub use rate_state::{Quota, QuotaHeaders, RateState, ThrottleSettings};
pub use retry::{AttemptState, RetryDecision, RetryPolicy};
pub use throttle::{AdaptiveThrottle, ThrottleSnapshot};
