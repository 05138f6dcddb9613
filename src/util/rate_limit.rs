//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Max match data frames per second from one session
pub const MATCH_DATA_RATE_LIMIT: u32 = 30;

/// Per-session limiter for inbound match data
#[derive(Clone)]
pub struct SessionRateLimiter {
    data_limiter: Arc<Limiter>,
}

impl SessionRateLimiter {
    pub fn new() -> Self {
        Self::with_rate(MATCH_DATA_RATE_LIMIT)
    }

    pub fn with_rate(per_second: u32) -> Self {
        Self {
            data_limiter: create_limiter(per_second),
        }
    }

    /// True if another data frame may be forwarded now
    pub fn check_data(&self) -> bool {
        self.data_limiter.check().is_ok()
    }
}

impl Default for SessionRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
