//! HTTP rate limiting middleware.
//!
//! Per-IP sliding window protecting the RPC surface. Socket-level limits
//! (location, chat) are enforced per user inside the gateway instead.

use crate::config::RateLimitRule;
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
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitLayer {
    rule: RateLimitRule,
    state: std::sync::Arc<Mutex<HashMap<IpAddr, RateLimitEntry>>>,
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimitLayer {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            state: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.rule.window();

        let entry = state.entry(ip).or_insert(RateLimitEntry {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        if entry.count > self.rule.points {
            let reset_at = entry.window_start + window;
            Err(reset_at.duration_since(now))
        } else {
            Ok(())
        }
    }

    /// Periodic cleanup of idle entries (call from a background task).
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.rule.window();
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::State(limiter): axum::extract::State<RateLimitLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();
    match limiter.check(ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(ip = %ip, retry_after_secs = retry_after.as_secs(), "rpc rate limit exceeded");
            metrics::counter!("gateway_rate_limited_total", 1, "class" => "global");
            let body = serde_json::json!({
                "error": "RATE_LIMIT_EXCEEDED",
                "message": "Too many requests",
                "retryAfterSeconds": retry_after.as_secs(),
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

    fn limiter(points: u32) -> RateLimitLayer {
        RateLimitLayer::new(RateLimitRule {
            points,
            window_secs: 60,
        })
    }

    #[test]
    fn test_allows_under_limit() {
        let layer = limiter(10);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..10 {
            assert!(layer.check(ip).is_ok());
        }
        assert!(layer.check(ip).is_err());
    }

    #[test]
    fn test_limits_are_per_ip() {
        let layer = limiter(1);
        let first: IpAddr = "10.0.0.1".parse().unwrap();
        let second: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(layer.check(first).is_ok());
        assert!(layer.check(first).is_err());
        assert!(layer.check(second).is_ok());
    }

    #[test]
    fn test_cleanup_keeps_recent() {
        let layer = limiter(5);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let _ = layer.check(ip);
        layer.cleanup();
        assert!(layer.state.lock().contains_key(&ip));
    }
}
