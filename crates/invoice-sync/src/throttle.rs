use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket limiter for calls to the bulk-download service.
///
/// Kept outside the stage loops so the policy can be tuned and tested on
/// its own.
pub struct Throttle {
    limiter: Option<DirectLimiter>,
}

impl Throttle {
    /// Allow `requests` calls per minute with bursts of up to `burst`.
    /// Zero requests means no limit.
    pub fn per_minute(requests: u32, burst: u32) -> Self {
        let Some(rate) = NonZeroU32::new(requests) else {
            return Self::unlimited();
        };
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(rate).allow_burst(burst);

        Self {
            limiter: Some(RateLimiter::direct(quota)),
        }
    }

    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Wait until a call is permitted.
    pub async fn until_ready(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.as_ref().is_none_or(|l| l.check().is_ok())
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
