//! Shared, per-surface adaptive throttle.

use super::rate_state::{Quota, QuotaHeaders, RateState, ThrottleSettings};
use crate::config::RateLimitConfig;
use crate::types::Surface;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Point-in-time view of one surface's throttle state.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleSnapshot {
    /// Surface the snapshot describes.
    pub surface: Surface,
    /// Last known quota.
    pub quota: Option<Quota>,
    /// Current secondary backoff multiplier.
    pub backoff_multiplier: f64,
    /// Requests inside the rolling window.
    pub window_count: usize,
    /// Delay the next request would be charged.
    pub next_delay: Duration,
}

/// Adaptive throttle shared by every worker of a run.
///
/// Each surface has its own state behind its own lock; the lock is never held
/// across an await, and [`AdaptiveThrottle::acquire`] computes the delay and
/// records the request in one critical section.
#[derive(Debug)]
pub struct AdaptiveThrottle {
    settings: ThrottleSettings,
    rest: Mutex<RateState>,
    graphql: Mutex<RateState>,
}

impl AdaptiveThrottle {
    /// Creates a throttle from rate limit configuration.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_settings(ThrottleSettings::from(config))
    }

    /// Creates a throttle from explicit settings.
    pub fn with_settings(settings: ThrottleSettings) -> Self {
        Self {
            rest: Mutex::new(RateState::new(&settings)),
            graphql: Mutex::new(RateState::new(&settings)),
            settings,
        }
    }

    /// Gets the settings.
    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    fn state(&self, surface: Surface) -> MutexGuard<'_, RateState> {
        let lock = match surface {
            Surface::Rest => &self.rest,
            Surface::GraphQl => &self.graphql,
        };
        lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Folds a response's quota headers into the surface state.
    pub fn update(&self, surface: Surface, headers: &QuotaHeaders) {
        self.update_at(surface, headers, Utc::now());
    }

    /// [`AdaptiveThrottle::update`] with an explicit clock.
    pub fn update_at(&self, surface: Surface, headers: &QuotaHeaders, now: DateTime<Utc>) {
        let mut state = self.state(surface);
        if headers.retry_after.is_some() {
            warn!(surface = %surface, retry_after = headers.retry_after, "Server asked to back off");
        }
        state.apply(headers, now);
    }

    /// Delay the next request on `surface` would be charged, without recording it.
    pub fn delay_before(&self, surface: Surface) -> Duration {
        self.delay_before_at(surface, Instant::now(), Utc::now())
    }

    /// [`AdaptiveThrottle::delay_before`] with explicit clocks.
    pub fn delay_before_at(&self, surface: Surface, now: Instant, wall: DateTime<Utc>) -> Duration {
        let mut state = self.state(surface);
        state.roll_over(wall);
        state.expire(now, &self.settings);
        state.delay_before(&self.settings)
    }

    /// Reserves a request slot and returns how long to wait before sending.
    ///
    /// The request is recorded at its scheduled send time, so concurrent callers
    /// see each other's reservations.
    pub fn acquire(&self, surface: Surface) -> Duration {
        self.acquire_at(surface, Instant::now(), Utc::now())
    }

    /// [`AdaptiveThrottle::acquire`] with explicit clocks.
    pub fn acquire_at(&self, surface: Surface, now: Instant, wall: DateTime<Utc>) -> Duration {
        let mut state = self.state(surface);
        state.roll_over(wall);
        state.expire(now, &self.settings);

        let quota_delay = state.delay_before(&self.settings);
        let bucket_delay = state.take_token(now, &self.settings);
        let delay = quota_delay.max(bucket_delay);

        state.record_request(now + delay, &self.settings);
        state.observe_window(now, &self.settings);

        if state.backoff_multiplier() > 1.0 {
            warn!(
                surface = %surface,
                multiplier = state.backoff_multiplier(),
                window_count = state.window_count(),
                delay_ms = delay.as_millis() as u64,
                "Request rate near secondary limit, backing off"
            );
        }

        delay
    }

    /// Waits until a request on `surface` may be sent.
    pub async fn pace(&self, surface: Surface) {
        let delay = self.acquire(surface);
        if !delay.is_zero() {
            debug!(surface = %surface, delay_ms = delay.as_millis() as u64, "Throttling request");
            tokio::time::sleep(delay).await;
        }
    }

    /// Snapshot of one surface.
    pub fn snapshot(&self, surface: Surface) -> ThrottleSnapshot {
        let mut state = self.state(surface);
        state.roll_over(Utc::now());
        state.expire(Instant::now(), &self.settings);
        ThrottleSnapshot {
            surface,
            quota: state.quota(),
            backoff_multiplier: state.backoff_multiplier(),
            window_count: state.window_count(),
            next_delay: state.delay_before(&self.settings),
        }
    }

    /// Snapshots of both surfaces.
    pub fn snapshots(&self) -> Vec<ThrottleSnapshot> {
        Surface::ALL.iter().map(|s| self.snapshot(*s)).collect()
    }
}

impl Default for AdaptiveThrottle {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}
