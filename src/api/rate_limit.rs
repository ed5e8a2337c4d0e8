//! Server-wide request quota

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use super::ApiState;
use super::turn::ApiError;

/// One quota shared by every caller
pub type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Quota allowing `requests_per_minute`, all of which may arrive at once
#[must_use]
pub fn create_limiter(requests_per_minute: u32) -> SharedLimiter {
    let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(rpm)))
}

/// Time until the limiter admits another request; `None` when one is admitted now
fn admit(limiter: &SharedLimiter) -> Option<Duration> {
    limiter
        .check()
        .err()
        .map(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
}

/// Answer 429 with `Retry-After` once the quota is spent
///
/// # Errors
///
/// Returns `RateLimited` carrying the wait until the next free slot
pub async fn enforce_rate_limit(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(limiter) = &state.rate_limiter
        && let Some(wait) = admit(limiter)
    {
        tracing::warn!(
            path = %req.uri().path(),
            retry_after_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            "request quota spent"
        );
        return Err(ApiError::RateLimited(wait));
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_spent_after_burst() {
        let limiter = create_limiter(2);
        assert_eq!(admit(&limiter), None);
        assert_eq!(admit(&limiter), None);

        let wait = admit(&limiter).unwrap();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(30));
    }

    #[test]
    fn test_zero_quota_is_clamped() {
        let limiter = create_limiter(0);
        assert_eq!(admit(&limiter), None);
    }
}
