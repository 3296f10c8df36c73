//! Rate limiting middleware
//! Mission: Per-IP windows with burst allowance in front of the ingest surface

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    /// Extra requests above the limit before hard reject.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 300,
            window: Duration::from_secs(60),
            burst: 50,
        }
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, WindowEntry>>>,
}

enum Verdict {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check(&self, ip: IpAddr) -> Verdict {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry = state.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        let limit = self.config.max_requests + self.config.burst;
        if entry.count > limit {
            let reset_at = entry.window_start + self.config.window;
            Verdict::Exceeded {
                retry_after: reset_at.saturating_duration_since(now),
            }
        } else {
            Verdict::Allowed
        }
    }

    /// Drop stale windows; called from a background task.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        Verdict::Allowed => next.run(request).await,
        Verdict::Exceeded { retry_after } => {
            warn!(ip = %addr.ip(), retry_after_secs = retry_after.as_secs(), "Rate limit exceeded");

            let body = serde_json::json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests. Please slow down.",
                "retry_after_seconds": retry_after.as_secs(),
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_through_burst_then_rejects() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 5,
            window: Duration::from_secs(60),
            burst: 2,
        });
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for i in 0..7 {
            assert!(
                matches!(limiter.check(ip), Verdict::Allowed),
                "request {i} should pass"
            );
        }
        assert!(matches!(limiter.check(ip), Verdict::Exceeded { .. }));
    }

    #[test]
    fn test_ips_tracked_independently() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        });

        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(matches!(limiter.check(a), Verdict::Allowed));
        assert!(matches!(limiter.check(a), Verdict::Exceeded { .. }));
        assert!(matches!(limiter.check(b), Verdict::Allowed));
    }

    #[test]
    fn test_cleanup_retains_active_windows() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        limiter.check(ip);

        limiter.cleanup();
        assert_eq!(limiter.state.lock().len(), 1);
    }
}
