//! Per-IP token-bucket rate limiting. Buckets refill continuously and
//! are swept once they have sat idle past the configured interval. All
//! bucket state lives behind one mutex, so a sweep can never observe a
//! bucket mid-consumption.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::gemini::middleware::{Middleware, Verdict};
use crate::gemini::response::Response;
use crate::gemini::status::Status;
use crate::gemini::Request;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    enabled: bool,
    capacity: u32,
    refill_rate: f64,
    retry_after: u32,
    idle_eviction: Duration,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl RateLimiter {
    pub fn from_config(config: &RateLimitConfig) -> RateLimiter {
        RateLimiter {
            enabled: config.enabled,
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            retry_after: config.retry_after,
            idle_eviction: config.idle_eviction,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, TokenBucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refill the bucket for `ip` and try to take one token.
    fn try_acquire(&self, ip: IpAddr, now: Instant) -> bool {
        let mut buckets = self.lock();
        let bucket = buckets.entry(ip).or_insert(TokenBucket {
            tokens: self.capacity as f64,
            last_refill: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refilled =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity as f64);
        bucket.last_refill = now;
        if refilled >= 1.0 {
            bucket.tokens = refilled - 1.0;
            true
        } else {
            bucket.tokens = refilled;
            false
        }
    }

    /// Drop buckets idle past the eviction interval. Returns how many
    /// were removed.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < self.idle_eviction);
        before - buckets.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.lock().len()
    }

    pub fn idle_eviction(&self) -> Duration {
        self.idle_eviction
    }
}

impl Middleware for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn process(&self, request: &Request) -> Verdict {
        if !self.enabled {
            return Verdict::Allow;
        }
        if self.try_acquire(request.peer_ip, Instant::now()) {
            Verdict::Allow
        } else {
            // meta carries the retry-after seconds, per the 44 contract
            Verdict::Reject(Response::new(
                Status::SlowDown,
                self.retry_after.to_string(),
            ))
        }
    }
}
