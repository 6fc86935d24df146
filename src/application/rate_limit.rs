//! Per-client token bucket admission control.

use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const HEADER_API_KEY: &str = "x-api-key";
const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_REAL_IP: &str = "x-real-ip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One bucket per identity behind a single lock. Refill and consume happen
/// in the same critical section.
pub struct RateLimiter {
    rate_per_second: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Zero values fall back to the defaults.
    pub fn new(config: RateLimitConfig) -> Self {
        let defaults = RateLimitConfig::default();
        let rpm = if config.requests_per_minute == 0 {
            defaults.requests_per_minute
        } else {
            config.requests_per_minute
        };
        let burst = if config.burst == 0 { defaults.burst } else { config.burst };

        Self {
            rate_per_second: f64::from(rpm) / 60.0,
            capacity: f64::from(burst),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, identity: &str) -> RateLimitDecision {
        self.check_at(identity, Instant::now())
    }

    pub fn check_at(&self, identity: &str, now: Instant) -> RateLimitDecision {
        let mut buckets = self.buckets.lock();

        let Some(bucket) = buckets.get_mut(identity) else {
            buckets.insert(
                identity.to_string(),
                Bucket {
                    tokens: self.capacity - 1.0,
                    last_refill: now,
                },
            );
            return RateLimitDecision::Allowed {
                remaining: (self.capacity - 1.0) as u32,
            };
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            let missing = 1.0 - bucket.tokens;
            let retry_after = Duration::from_secs_f64(missing / self.rate_per_second);
            warn!(identity, retry_after_ms = retry_after.as_millis() as u64, "rate limit exceeded");
            return RateLimitDecision::Limited { retry_after };
        }

        bucket.tokens -= 1.0;
        RateLimitDecision::Allowed {
            remaining: bucket.tokens as u32,
        }
    }

    /// Drops buckets untouched for `max_idle`. Call from a background task.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        self.prune_idle_at(max_idle, Instant::now())
    }

    pub fn prune_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < max_idle);
        let pruned = before - buckets.len();
        if pruned > 0 {
            debug!(pruned, "idle rate limit buckets dropped");
        }
        pruned
    }

    pub fn tracked(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Who a request is counted against.
pub struct ClientIdentity;

impl ClientIdentity {
    /// API key first, then the first forwarded address, then the real-ip
    /// header, then the peer address. `None` if nothing identifies the caller.
    pub fn from_request(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Option<String> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(api_key) = header(HEADER_API_KEY) {
            return Some(api_key.to_string());
        }
        if let Some(forwarded) = header(HEADER_FORWARDED_FOR)
            && let Some(first) = forwarded.split(',').next().map(str::trim)
            && !first.is_empty()
        {
            return Some(first.to_string());
        }
        if let Some(real_ip) = header(HEADER_REAL_IP) {
            return Some(real_ip.to_string());
        }
        remote_addr.map(|addr| addr.ip().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 10,
        })
    }

    #[test]
    fn test_burst_then_limited() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            assert!(limiter.check_at("k", now).is_allowed());
        }
        assert!(matches!(limiter.check_at("k", now), RateLimitDecision::Limited { .. }));
    }

    #[test]
    fn test_refill_after_one_second() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..11 {
            limiter.check_at("k", now);
        }
        let later = now + Duration::from_secs(1);
        assert!(limiter.check_at("k", later).is_allowed());
        assert!(!limiter.check_at("k", later).is_allowed());
    }

    #[test]
    fn test_retry_after_hint() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            limiter.check_at("k", now);
        }
        match limiter.check_at("k", now + Duration::from_millis(500)) {
            RateLimitDecision::Limited { retry_after } => {
                assert!(retry_after <= Duration::from_millis(500));
                assert!(retry_after > Duration::from_millis(400));
            }
            other => panic!("expected limited, got {other:?}"),
        }
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            limiter.check_at("a", now);
        }
        assert!(!limiter.check_at("a", now).is_allowed());
        assert!(limiter.check_at("b", now).is_allowed());
    }

    #[test]
    fn test_prune_idle() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.check_at("a", now);
        limiter.check_at("b", now + Duration::from_secs(50));
        assert_eq!(limiter.prune_idle_at(Duration::from_secs(30), now + Duration::from_secs(60)), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_identity_precedence() {
        let addr: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(ClientIdentity::from_request(&headers, Some(addr)).as_deref(), Some("10.0.0.9"));

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.3"));
        assert_eq!(ClientIdentity::from_request(&headers, Some(addr)).as_deref(), Some("10.0.0.3"));

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(ClientIdentity::from_request(&headers, Some(addr)).as_deref(), Some("203.0.113.7"));

        headers.insert("x-api-key", HeaderValue::from_static("key-1"));
        assert_eq!(ClientIdentity::from_request(&headers, Some(addr)).as_deref(), Some("key-1"));

        assert_eq!(ClientIdentity::from_request(&HeaderMap::new(), None), None);
    }
}
