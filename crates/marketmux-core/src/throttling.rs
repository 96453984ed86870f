//! Outbound request budget enforcement.
//!
//! The secondary equities provider allows 60 calls/minute; the engine caps
//! itself at 55 to keep headroom against provider-side throttling. The
//! token bucket refills continuously at the configured rate and its
//! capacity bounds bursts, so concurrent demand can never overdraw the
//! budget. The queue is shared process-wide: it gates one physical upstream
//! budget regardless of how many logical requests concur.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Quota window and retry backoff for one provider's budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlePolicy {
    pub quota_window: Duration,
    pub quota_limit: u32,
    pub retry_backoff: RetryBackoff,
}

/// Delay schedule offered to callers that found the bucket empty.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl ThrottlePolicy {
    /// Finnhub free tier is 60 calls/minute; 55 is the enforced budget.
    pub fn finnhub_default() -> Self {
        Self::per_minute(55)
    }

    pub fn per_minute(quota_limit: u32) -> Self {
        Self {
            quota_window: Duration::from_secs(60),
            quota_limit,
            retry_backoff: RetryBackoff {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                max_retries: 3,
            },
        }
    }
}

/// In-memory throttling queue that tracks pending requests and computes
/// retry delays for callers that must wait.
#[derive(Clone)]
pub struct ThrottlingQueue {
    limiter: Arc<DirectRateLimiter>,
    pending: Arc<Mutex<VecDeque<PendingRequest>>>,
    retry_backoff: RetryBackoff,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    retry_count: u32,
}

impl ThrottlingQueue {
    pub fn from_policy(policy: &ThrottlePolicy) -> Self {
        let quota = quota_from_window(policy.quota_window, policy.quota_limit);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            retry_backoff: policy.retry_backoff.clone(),
        }
    }

    /// Tries to acquire rate budget. When budget is unavailable the request
    /// is buffered and the recommended backoff delay is returned.
    pub fn acquire(&self) -> Result<(), Duration> {
        if self.limiter.check().is_ok() {
            return Ok(());
        }

        let mut pending = self
            .pending
            .lock()
            .expect("throttling pending queue should not be poisoned");
        pending.push_back(PendingRequest { retry_count: 0 });

        Err(self.retry_delay(0).unwrap_or(self.retry_backoff.max_delay))
    }

    /// Increments retry count for the oldest buffered request and returns
    /// its next delay, or `None` once retries are exhausted.
    pub fn register_retry(&self) -> Option<Duration> {
        let mut pending = self
            .pending
            .lock()
            .expect("throttling pending queue should not be poisoned");
        let request = pending.front_mut()?;
        request.retry_count = request.retry_count.saturating_add(1);
        self.retry_delay(request.retry_count)
    }

    /// Removes a request from the pending queue after a successful retry.
    pub fn complete_one(&self) {
        let mut pending = self
            .pending
            .lock()
            .expect("throttling pending queue should not be poisoned");
        let _ = pending.pop_front();
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .expect("throttling pending queue should not be poisoned")
            .len()
    }

    pub fn retry_delay(&self, retry_count: u32) -> Option<Duration> {
        if retry_count > self.retry_backoff.max_retries {
            return None;
        }

        let scale = self.retry_backoff.multiplier.powf(f64::from(retry_count));
        let seconds = self.retry_backoff.initial_delay.as_secs_f64() * scale;
        let capped_seconds = seconds.min(self.retry_backoff.max_delay.as_secs_f64());
        Some(Duration::from_secs_f64(capped_seconds))
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let safe_limit = quota_limit.max(1);
    let burst = NonZeroU32::new(safe_limit).expect("safe limit must be non-zero");

    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(safe_limit)).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .expect("period is always greater than zero")
        .allow_burst(burst)
}
