//! Per-surface quota bookkeeping.
//!
//! Everything in here is plain data and pure arithmetic over explicit clocks, so
//! the throttling curve can be tested without a network or a runtime.

use crate::config::RateLimitConfig;
use crate::errors::RateLimitInfo;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Quota-related values observed on one response.
///
/// Missing headers stay `None`; `remaining` is signed because the server has been
/// seen to report negative values, and is clamped when folded into [`RateState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// `x-ratelimit-limit`.
    pub limit: Option<u32>,
    /// `x-ratelimit-remaining`.
    pub remaining: Option<i64>,
    /// `x-ratelimit-reset`.
    pub reset_at: Option<DateTime<Utc>>,
    /// `retry-after`, in seconds.
    pub retry_after: Option<u64>,
    /// `x-ratelimit-resource`.
    pub resource: Option<String>,
}

impl QuotaHeaders {
    /// True when no quota-related header was present.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_at.is_none()
            && self.retry_after.is_none()
    }

    /// True when the primary quota is reported as spent.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining, Some(r) if r <= 0)
    }

    /// Complete primary quota info, if every primary header was present.
    pub fn to_rate_limit_info(&self) -> Option<RateLimitInfo> {
        Some(RateLimitInfo {
            limit: self.limit?,
            remaining: self.remaining?.max(0).min(u32::MAX as i64) as u32,
            reset_at: self.reset_at?,
            retry_after: self.retry_after,
            resource: self.resource.clone(),
        })
    }
}

/// Last known primary quota of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Requests allowed per window.
    pub limit: u32,
    /// Requests left, never negative.
    pub remaining: u32,
    /// When the window resets.
    pub reset_at: DateTime<Utc>,
}

/// Tuning values the throttle curve is computed from.
#[derive(Debug, Clone)]
pub struct ThrottleSettings {
    /// Delay at the 20% mark.
    pub min_sleep: Duration,
    /// Delay at exhaustion.
    pub max_sleep: Duration,
    /// Requests in the window above which the secondary limit trips.
    pub secondary_limit: f64,
    /// Rolling window length.
    pub window: Duration,
    /// Capacity of the timestamp window.
    pub window_capacity: usize,
    /// Growth of the backoff multiplier per violation.
    pub backoff_growth: f64,
    /// Cap on the backoff multiplier.
    pub max_backoff_multiplier: f64,
    /// Token bucket capacity.
    pub burst_capacity: f64,
    /// Token bucket refill rate per second.
    pub sustained_rate: f64,
}

impl From<&RateLimitConfig> for ThrottleSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            min_sleep: config.min_sleep,
            max_sleep: config.max_sleep,
            secondary_limit: config.secondary_limit(),
            window: config.secondary_window,
            window_capacity: config.max_requests_per_minute.max(1) as usize + 1,
            backoff_growth: config.backoff_growth,
            max_backoff_multiplier: config.max_backoff_multiplier,
            burst_capacity: config.burst_capacity.max(1) as f64,
            sustained_rate: config.sustained_rate,
        }
    }
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

/// Quota and request-rate state of one API surface.
#[derive(Debug, Clone)]
pub struct RateState {
    quota: Option<Quota>,
    recent: VecDeque<Instant>,
    backoff_multiplier: f64,
    last_violation: Option<Instant>,
    tokens: f64,
    last_refill: Option<Instant>,
}

impl RateState {
    /// Creates an empty state with a full token bucket.
    pub fn new(settings: &ThrottleSettings) -> Self {
        Self {
            quota: None,
            recent: VecDeque::with_capacity(settings.window_capacity),
            backoff_multiplier: 1.0,
            last_violation: None,
            tokens: settings.burst_capacity,
            last_refill: None,
        }
    }

    /// Last known quota.
    pub fn quota(&self) -> Option<Quota> {
        self.quota
    }

    /// Current secondary backoff multiplier (1.0 when not backing off).
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Requests currently inside the rolling window.
    pub fn window_count(&self) -> usize {
        self.recent.len()
    }

    /// Folds one response's quota headers into the state.
    ///
    /// Returns true if the state changed. A `retry-after` value overrides the
    /// primary headers. Responses reporting an older reset than the one already
    /// known are stale and ignored; for the same reset the lower `remaining` wins,
    /// so applying the same headers twice is a no-op.
    pub fn apply(&mut self, headers: &QuotaHeaders, now: DateTime<Utc>) -> bool {
        if let Some(secs) = headers.retry_after {
            let forced = Quota {
                limit: headers
                    .limit
                    .or(self.quota.map(|q| q.limit))
                    .unwrap_or(0),
                remaining: 0,
                reset_at: now + ChronoDuration::seconds(secs.min(i64::MAX as u64) as i64),
            };
            let changed = self.quota != Some(forced);
            self.quota = Some(forced);
            return changed;
        }

        let (Some(limit), Some(remaining), Some(reset_at)) =
            (headers.limit, headers.remaining, headers.reset_at)
        else {
            return false;
        };

        if reset_at <= now {
            return false;
        }

        let fresh = Quota {
            limit,
            remaining: remaining.max(0).min(u32::MAX as i64) as u32,
            reset_at,
        };

        let next = match self.quota {
            None => fresh,
            Some(current) if fresh.reset_at < current.reset_at => return false,
            Some(current) if fresh.reset_at == current.reset_at => Quota {
                limit: fresh.limit,
                remaining: fresh.remaining.min(current.remaining),
                reset_at: current.reset_at,
            },
            Some(_) => fresh,
        };

        let changed = self.quota != Some(next);
        self.quota = Some(next);
        changed
    }

    /// Forgets the quota once its reset time has passed.
    pub fn roll_over(&mut self, now: DateTime<Utc>) {
        if matches!(self.quota, Some(q) if q.reset_at <= now) {
            self.quota = None;
        }
    }

    /// Remaining quota as a percentage of the limit, if known.
    pub fn remaining_percent(&self) -> Option<f64> {
        self.quota
            .map(|q| q.remaining as f64 / q.limit.max(1) as f64 * 100.0)
    }

    /// Delay curve over the remaining quota percentage.
    pub fn quota_delay(percent: f64, settings: &ThrottleSettings) -> Duration {
        let min = settings.min_sleep.as_secs_f64();
        let max = settings.max_sleep.as_secs_f64();

        let secs = if percent > 50.0 {
            0.0
        } else if percent >= 20.0 {
            min * (50.0 - percent) / 30.0
        } else if percent > 0.0 {
            let pressure = (20.0 - percent) / 20.0;
            min + (max - min) * pressure * pressure
        } else {
            max
        };

        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay owed before the next request, from quota and secondary backoff.
    pub fn delay_before(&self, settings: &ThrottleSettings) -> Duration {
        let base = self
            .remaining_percent()
            .map(|p| Self::quota_delay(p, settings))
            .unwrap_or(Duration::ZERO);

        if self.backoff_multiplier > 1.0 {
            base.max(settings.min_sleep).mul_f64(self.backoff_multiplier)
        } else {
            base
        }
    }

    /// Prunes the window and updates the secondary backoff multiplier.
    ///
    /// Every call that finds the window over the limit grows the multiplier.
    pub fn observe_window(&mut self, now: Instant, settings: &ThrottleSettings) {
        self.prune(now, settings.window);

        if self.recent.len() as f64 > settings.secondary_limit {
            self.backoff_multiplier = (self.backoff_multiplier * settings.backoff_growth)
                .min(settings.max_backoff_multiplier)
                .max(1.0);
            self.last_violation = Some(now);
        } else {
            self.expire(now, settings);
        }
    }

    /// Prunes the window and drops the backoff once a full window has passed
    /// since the last violation. Never grows the multiplier.
    pub fn expire(&mut self, now: Instant, settings: &ThrottleSettings) {
        self.prune(now, settings.window);

        let violation_expired = self
            .last_violation
            .map(|at| now.saturating_duration_since(at) >= settings.window)
            .unwrap_or(true);
        if violation_expired {
            self.backoff_multiplier = 1.0;
            self.last_violation = None;
        }
    }

    /// Records a request issued at `at`.
    pub fn record_request(&mut self, at: Instant, settings: &ThrottleSettings) {
        self.recent.push_back(at);
        while self.recent.len() > settings.window_capacity {
            self.recent.pop_front();
        }
    }

    /// Takes a token from the bucket, returning how long to wait for it.
    ///
    /// The bucket may go negative: a caller that has to wait has already reserved
    /// its token, so concurrent callers queue up behind it.
    pub fn take_token(&mut self, now: Instant, settings: &ThrottleSettings) -> Duration {
        if let Some(last) = self.last_refill {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            self.tokens = (self.tokens + elapsed * settings.sustained_rate)
                .min(settings.burst_capacity);
        }
        self.last_refill = Some(now);

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / settings.sustained_rate)
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}
