use paygate::application::rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn test_burst_then_refill_scenario() {
    let limiter = RateLimiter::new(RateLimitConfig {
        requests_per_minute: 60,
        burst: 10,
    });
    let start = Instant::now();

    for _ in 0..10 {
        assert!(limiter.check_at("merchant-1", start).is_allowed());
    }
    let RateLimitDecision::Limited { retry_after } = limiter.check_at("merchant-1", start) else {
        panic!("11th request in the same instant must be limited");
    };
    assert!(retry_after <= Duration::from_secs(1));

    assert!(limiter.check_at("merchant-1", start + Duration::from_secs(1)).is_allowed());
    assert!(limiter.check_at("merchant-2", start).is_allowed());
}

#[test]
fn test_concurrent_callers_never_exceed_burst() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        requests_per_minute: 1,
        burst: 5,
    }));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            std::thread::spawn(move || {
                (0..10)
                    .filter(|_| limiter.check("shared").is_allowed())
                    .count()
            })
        })
        .collect();

    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 5);
}

#[test]
fn test_idle_buckets_are_pruned() {
    let limiter = RateLimiter::new(RateLimitConfig::default());
    let start = Instant::now();
    limiter.check_at("a", start);
    limiter.check_at("b", start + Duration::from_secs(50));

    assert_eq!(limiter.prune_idle_at(Duration::from_secs(30), start + Duration::from_secs(60)), 1);
    assert_eq!(limiter.tracked(), 1);
}
