use axum::http::{HeaderMap, HeaderName, HeaderValue};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::Config;

pub const UNKNOWN_CLIENT: &str = "unknown";

const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Client address headers, most trusted first. Only `x-forwarded-for` is a list.
const CLIENT_IP_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "x-vercel-forwarded-for"];

#[derive(Clone, Copy, Debug)]
struct Bucket {
    count: u32,
    reset_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// Writes `X-RateLimit-Limit`, `-Remaining` and `-Reset` (unix seconds).
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER, HeaderValue::from(self.reset_at_ms / 1000));
    }
}

/// Fixed-window request counter per client IP.
///
/// Counters live in process memory only: a restart clears them and separate
/// instances count independently.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    max_requests: u32,
    window_ms: u64,
    cleanup_interval_ms: u64,
    last_cleanup_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration, cleanup_interval: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_requests,
            window_ms: window.as_millis() as u64,
            cleanup_interval_ms: cleanup_interval.as_millis() as u64,
            last_cleanup_ms: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.rate_limit.max_requests,
            config.rate_limit_window(),
            config.rate_limit_cleanup_interval(),
        )
    }

    /// Human form of the window for client-facing messages.
    pub fn window_phrase(&self) -> String {
        match self.window_ms / 1000 {
            60 => "minute".to_string(),
            3600 => "hour".to_string(),
            86_400 => "day".to_string(),
            secs => format!("{} seconds", secs),
        }
    }

    pub fn check(&self, ip: &str) -> RateLimitDecision {
        self.check_at(ip, now_ms())
    }

    pub fn check_at(&self, ip: &str, now_ms: u64) -> RateLimitDecision {
        self.cleanup(now_ms);

        let key = if ip.is_empty() { UNKNOWN_CLIENT } else { ip };
        let window_ms = self.window_ms;
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            reset_at_ms: now_ms.saturating_add(window_ms),
        });
        if now_ms >= bucket.reset_at_ms {
            *bucket = Bucket {
                count: 0,
                reset_at_ms: now_ms.saturating_add(window_ms),
            };
        }

        let retry_after_secs = bucket.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1);
        if bucket.count >= self.max_requests {
            return RateLimitDecision {
                allowed: false,
                limit: self.max_requests,
                remaining: 0,
                reset_at_ms: bucket.reset_at_ms,
                retry_after_secs,
            };
        }

        bucket.count += 1;
        RateLimitDecision {
            allowed: true,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(bucket.count),
            reset_at_ms: bucket.reset_at_ms,
            retry_after_secs,
        }
    }

    /// Current standing of `ip` without spending a request.
    pub fn peek(&self, ip: &str) -> RateLimitDecision {
        self.peek_at(ip, now_ms())
    }

    pub fn peek_at(&self, ip: &str, now_ms: u64) -> RateLimitDecision {
        let key = if ip.is_empty() { UNKNOWN_CLIENT } else { ip };
        let live = self
            .buckets
            .get(key)
            .map(|bucket| *bucket)
            .filter(|bucket| now_ms < bucket.reset_at_ms);
        let bucket = live.unwrap_or(Bucket {
            count: 0,
            reset_at_ms: now_ms.saturating_add(self.window_ms),
        });
        RateLimitDecision {
            allowed: bucket.count < self.max_requests,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(bucket.count),
            reset_at_ms: bucket.reset_at_ms,
            retry_after_secs: bucket.reset_at_ms.saturating_sub(now_ms).div_ceil(1000).max(1),
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Drops every bucket and the cleanup schedule.
    #[cfg(test)]
    pub fn reset(&self) {
        self.buckets.clear();
        self.last_cleanup_ms.store(0, Ordering::Relaxed);
    }

    /// Purges buckets whose window ended more than two windows ago. Runs at
    /// most once per cleanup interval, on whichever request gets there first.
    fn cleanup(&self, now_ms: u64) {
        let last = self.last_cleanup_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.cleanup_interval_ms {
            return;
        }
        if self
            .last_cleanup_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let max_idle_ms = self.window_ms.saturating_mul(2);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now_ms.saturating_sub(bucket.reset_at_ms) <= max_idle_ms);
        let purged = before.saturating_sub(self.buckets.len());
        if purged > 0 {
            tracing::debug!(purged = purged, "rate limit buckets purged");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Client address used as the rate-limit key.
pub fn extract_client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    for name in CLIENT_IP_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let candidate = if name == "x-forwarded-for" {
            value.split(',').next().unwrap_or("")
        } else {
            value
        };
        if !candidate.trim().is_empty() {
            return normalize_ip(candidate);
        }
    }

    match remote {
        Some(addr) => normalize_ip(&addr.ip().to_string()),
        None => UNKNOWN_CLIENT.to_string(),
    }
}

/// Trims and strips `[...]` around IPv6 literals.
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    ip.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(ip)
        .to_string()
}
