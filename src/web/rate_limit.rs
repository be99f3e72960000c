// src/web/rate_limit.rs
// Per-client-IP sliding-window rate limiter

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sliding window length
const WINDOW: Duration = Duration::from_secs(60);
/// Whole-map prune cadence
const PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Sliding-window counter keyed by normalized client IP. The
/// read-modify-write on one IP's timestamps is atomic under the map
/// mutex; the map itself is pruned of stale IPs every five minutes.
pub struct RateLimiter {
    limit: usize,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
    last_prune: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            hits: Mutex::new(HashMap::new()),
            last_prune: Mutex::new(Instant::now()),
        }
    }

    /// Record a request and decide. `Err(retry_after_secs)` when the
    /// count including this request exceeds the per-minute limit.
    pub fn check(&self, ip: &str) -> Result<(), u64> {
        let now = Instant::now();
        self.maybe_prune(now);

        let mut hits = self.hits.lock().expect("rate limiter poisoned");
        let timestamps = hits.entry(ip.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < WINDOW);

        if timestamps.len() + 1 > self.limit {
            let retry_after = timestamps
                .first()
                .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)).as_secs() + 1)
                .unwrap_or(1);
            debug!(ip = %ip, "Rate limit exceeded");
            return Err(retry_after);
        }

        timestamps.push(now);
        Ok(())
    }

    /// Drop IPs whose most recent request left the window
    fn maybe_prune(&self, now: Instant) {
        {
            let mut last = self.last_prune.lock().expect("rate limiter poisoned");
            if now.duration_since(*last) < PRUNE_INTERVAL {
                return;
            }
            *last = now;
        }
        let mut hits = self.hits.lock().expect("rate limiter poisoned");
        hits.retain(|_, timestamps| {
            timestamps
                .last()
                .map(|t| now.duration_since(*t) < WINDOW)
                .unwrap_or(false)
        });
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.hits.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_boundary() {
        let limiter = RateLimiter::new(3);
        // Exactly `limit` requests succeed
        assert!(limiter.check("1.2.3.4").is_ok());
        assert!(limiter.check("1.2.3.4").is_ok());
        assert!(limiter.check("1.2.3.4").is_ok());
        // The (limit+1)-th within the window is rejected
        let retry_after = limiter.check("1.2.3.4").unwrap_err();
        assert!(retry_after >= 1);
    }

    #[test]
    fn test_ips_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("1.1.1.1").is_ok());
        assert!(limiter.check("2.2.2.2").is_ok());
        assert!(limiter.check("1.1.1.1").is_err());
    }

    #[test]
    fn test_rejected_requests_do_not_count() {
        let limiter = RateLimiter::new(2);
        limiter.check("a").unwrap();
        limiter.check("a").unwrap();
        for _ in 0..10 {
            assert!(limiter.check("a").is_err());
        }
        // Still exactly two recorded hits
        assert_eq!(limiter.hits.lock().unwrap().get("a").unwrap().len(), 2);
    }

    #[test]
    fn test_prune_drops_stale_ips() {
        let limiter = RateLimiter::new(10);
        limiter.check("stale").unwrap();
        {
            // Age the entry and the prune clock past their windows
            let mut hits = limiter.hits.lock().unwrap();
            let old = Instant::now() - WINDOW - Duration::from_secs(1);
            hits.insert("stale".into(), vec![old]);
        }
        *limiter.last_prune.lock().unwrap() = Instant::now() - PRUNE_INTERVAL - Duration::from_secs(1);

        limiter.check("fresh").unwrap();
        assert_eq!(limiter.tracked_ips(), 1);
    }
}
