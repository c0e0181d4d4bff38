//! Adaptive per-model rate limiting.
//!
//! Providers advertise budgets through `x-ratelimit-*` response headers
//! and enforce them with 429s. The limiter mirrors both signals: header
//! budgets gate requests proactively, and consecutive 429s impose an
//! exponential hold capped at 60 seconds.

use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One advertised budget: requests or tokens per provider interval.
#[derive(Debug, Clone, Copy, Default)]
struct Budget {
    remaining: Option<u32>,
    resets_at: Option<Instant>,
}

impl Budget {
    /// How long this budget blocks for; zero when it does not.
    fn hold(&self, now: Instant) -> Duration {
        match (self.remaining, self.resets_at) {
            (Some(0), Some(at)) if at > now => at - now,
            _ => Duration::ZERO,
        }
    }

    /// Fold in the latest header values. Absent headers leave the
    /// previous observation in place.
    fn absorb(&mut self, remaining: Option<u32>, reset_secs: Option<f64>, now: Instant) {
        if remaining.is_some() {
            self.remaining = remaining;
        }
        if let Some(secs) = reset_secs {
            self.resets_at = Some(now + Duration::from_secs_f64(secs));
        }
    }
}

/// Throttle state for one model id.
#[derive(Debug, Default)]
struct ModelThrottle {
    requests: Budget,
    tokens: Budget,
    /// Consecutive 429s
    strikes: u32,
    /// Backoff hold imposed by strikes
    hold_until: Option<Instant>,
}

impl ModelThrottle {
    /// Longest hold any signal currently imposes.
    fn hold(&self, now: Instant) -> Duration {
        let mut hold = self.requests.hold(now).max(self.tokens.hold(now));
        if let Some(until) = self.hold_until {
            if until > now {
                hold = hold.max(until - now);
            }
        }
        hold
    }

    fn strike(&mut self, now: Instant) {
        self.strikes += 1;
        let secs = (2.0_f64).powi(self.strikes as i32).min(60.0);
        self.hold_until = Some(now + Duration::from_secs_f64(secs));
        warn!(
            strikes = self.strikes,
            hold_secs = secs,
            "Rate limited (429), holding"
        );
    }

    fn clear_strikes(&mut self) {
        if self.strikes > 0 {
            self.strikes = 0;
            self.hold_until = None;
        }
    }

    fn absorb_headers(&mut self, headers: &HeaderMap, now: Instant) {
        let text = |key: &str| headers.get(key).and_then(|v| v.to_str().ok());
        let num = |key: &str| text(key).and_then(|s| s.parse::<u32>().ok());
        let secs = |key: &str| text(key).and_then(|s| s.parse::<f64>().ok());

        self.requests.absorb(
            num("x-ratelimit-remaining-requests"),
            secs("x-ratelimit-reset-requests"),
            now,
        );
        self.tokens.absorb(
            num("x-ratelimit-remaining-tokens"),
            secs("x-ratelimit-reset-tokens"),
            now,
        );
    }
}

/// Adaptive rate limiter shared by all requests to an endpoint.
#[derive(Debug)]
pub struct RateLimiter {
    throttles: DashMap<String, ModelThrottle>,
    total_requests: AtomicU64,
    total_429s: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            throttles: DashMap::new(),
            total_requests: AtomicU64::new(0),
            total_429s: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Sleep out whatever hold the model currently carries. Returns the
    /// duration waited.
    pub async fn wait_if_needed(&self, model: &str) -> Duration {
        let hold = {
            let throttle = self.throttles.entry(model.to_string()).or_default();
            throttle.hold(Instant::now())
        };

        if hold > Duration::ZERO {
            debug!(
                model = model,
                wait_ms = hold.as_millis() as u64,
                "Waiting for rate limit"
            );
            self.total_wait_ms
                .fetch_add(hold.as_millis() as u64, Ordering::Relaxed);
            tokio::time::sleep(hold).await;
        }

        hold
    }

    /// Record a response: absorb budget headers, strike on 429, clear
    /// strikes on success.
    pub fn record_request(&self, model: &str, status: u16, headers: &HeaderMap) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut throttle = self.throttles.entry(model.to_string()).or_default();
        throttle.absorb_headers(headers, now);

        if status == 429 {
            self.total_429s.fetch_add(1, Ordering::Relaxed);
            throttle.strike(now);
        } else if status < 400 {
            throttle.clear_strikes();
        }
    }

    /// Aggregate counters for end-of-run reporting.
    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_429s = self.total_429s.load(Ordering::Relaxed);

        RateLimiterStats {
            total_requests,
            total_429s,
            total_wait_secs: self.total_wait_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            throttled_ratio: if total_requests > 0 {
                total_429s as f64 / total_requests as f64
            } else {
                0.0
            },
            models_tracked: self.throttles.len(),
        }
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub total_429s: u64,
    pub total_wait_secs: f64,
    pub throttled_ratio: f64,
    pub models_tracked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn budget_holds_only_when_exhausted() {
        let now = Instant::now();
        let mut budget = Budget::default();
        assert_eq!(budget.hold(now), Duration::ZERO);

        budget.absorb(Some(5), Some(10.0), now);
        assert_eq!(budget.hold(now), Duration::ZERO);

        budget.absorb(Some(0), None, now);
        assert!(budget.hold(now) > Duration::from_secs(9));
    }

    #[test]
    fn strikes_back_off_exponentially_with_cap() {
        let now = Instant::now();
        let mut throttle = ModelThrottle::default();

        throttle.strike(now);
        let first = throttle.hold(now);
        throttle.strike(now);
        let second = throttle.hold(now);
        assert!(second > first);

        for _ in 0..10 {
            throttle.strike(now);
        }
        assert!(throttle.hold(now) <= Duration::from_secs(60));

        throttle.clear_strikes();
        assert_eq!(throttle.hold(now), Duration::ZERO);
    }

    #[test]
    fn headers_absorbed_per_resource() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-remaining-requests",
            HeaderValue::from_static("0"),
        );
        headers.insert(
            "x-ratelimit-reset-requests",
            HeaderValue::from_static("2.5"),
        );
        headers.insert(
            "x-ratelimit-remaining-tokens",
            HeaderValue::from_static("9000"),
        );

        let now = Instant::now();
        let mut throttle = ModelThrottle::default();
        throttle.absorb_headers(&headers, now);

        assert_eq!(throttle.requests.remaining, Some(0));
        assert_eq!(throttle.tokens.remaining, Some(9000));
        assert!(throttle.hold(now) > Duration::from_secs(2));
    }

    #[test]
    fn limiter_counts_429s() {
        let limiter = RateLimiter::new();
        let headers = HeaderMap::new();
        limiter.record_request("m", 200, &headers);
        limiter.record_request("m", 429, &headers);

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_429s, 1);
        assert!((stats.throttled_ratio - 0.5).abs() < 1e-9);
        assert_eq!(stats.models_tracked, 1);
    }
}
