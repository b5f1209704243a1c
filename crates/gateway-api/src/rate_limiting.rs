//! Per-key rate limiting
//!
//! Fixed-window counting: each API key id gets a bucket holding a counter and
//! the instant its window opened. The window resets (it does not slide) once
//! `window_secs` have elapsed. Buckets are created lazily on first use.
//!
//! ## Configuration
//!
//! - `DATAPRODUCT_RATE_LIMIT_BUDGET`: requests per window (default: 50)
//! - `DATAPRODUCT_RATE_LIMIT_WINDOW_SECS`: window length in seconds (default: 60)
//! - `DATAPRODUCT_RATE_LIMIT_MAX_BUCKETS`: bucket count that triggers cleanup (default: 10000)
//! - `DATAPRODUCT_RATE_LIMIT_BUCKET_TTL_SECS`: idle bucket TTL in seconds (default: 600)
//!
//! ## Memory Bounds
//!
//! When the table grows past half of `max_buckets`, buckets idle for longer
//! than the TTL are dropped before the next admission.

use dashmap::DashMap;
use dataproduct_gateway_core::env::env_parse;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::debug;

/// Default request budget per window
const DEFAULT_BUDGET: u32 = 50;

/// Default rate limit window in seconds
const DEFAULT_WINDOW_SECS: u64 = 60;

/// Default maximum number of rate limit buckets to keep in memory
const DEFAULT_MAX_BUCKETS: usize = 10_000;

/// Default TTL for idle rate limit buckets (10 minutes)
const DEFAULT_BUCKET_TTL_SECS: u64 = 600;

/// Configuration for rate limiting
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub budget: u32,
    pub window_secs: u64,
    pub max_buckets: usize,
    pub bucket_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            budget: DEFAULT_BUDGET,
            window_secs: DEFAULT_WINDOW_SECS,
            max_buckets: DEFAULT_MAX_BUCKETS,
            bucket_ttl_secs: DEFAULT_BUCKET_TTL_SECS,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        Self {
            budget: env_parse("DATAPRODUCT_RATE_LIMIT_BUDGET", DEFAULT_BUDGET),
            window_secs: env_parse("DATAPRODUCT_RATE_LIMIT_WINDOW_SECS", DEFAULT_WINDOW_SECS),
            max_buckets: env_parse("DATAPRODUCT_RATE_LIMIT_MAX_BUCKETS", DEFAULT_MAX_BUCKETS),
            bucket_ttl_secs: env_parse(
                "DATAPRODUCT_RATE_LIMIT_BUCKET_TTL_SECS",
                DEFAULT_BUCKET_TTL_SECS,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.budget == 0 {
            return Err("rate limit budget must be > 0".to_string());
        }
        if self.window_secs == 0 {
            return Err("rate limit window_secs must be > 0".to_string());
        }
        if self.max_buckets == 0 {
            return Err("rate limit max_buckets must be > 0".to_string());
        }
        if self.bucket_ttl_secs < self.window_secs {
            return Err(format!(
                "bucket_ttl_secs ({}) must be >= window_secs ({})",
                self.bucket_ttl_secs, self.window_secs
            ));
        }
        Ok(())
    }

    pub fn with_budget(mut self, budget: u32) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_window_secs(mut self, window_secs: u64) -> Self {
        self.window_secs = window_secs;
        self.bucket_ttl_secs = self.bucket_ttl_secs.max(window_secs);
        self
    }
}

/// Rate limit bucket for tracking requests
#[derive(Clone, Debug)]
struct RateLimitBucket {
    count: u32,
    window_start: Instant,
    last_accessed: Instant,
}

/// Rate limit metadata for response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitMetadata {
    pub limit: u32,
    pub remaining: u32,
    /// Unix timestamp (seconds) at which the window resets
    pub reset: u64,
}

/// Outcome of [`RateLimiter::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed(RateLimitMetadata),
    Denied {
        /// Whole seconds until the window resets, at least 1
        retry_after_secs: u64,
        metadata: RateLimitMetadata,
    },
}

impl Admission {
    pub fn metadata(&self) -> RateLimitMetadata {
        match self {
            Admission::Allowed(metadata) | Admission::Denied { metadata, .. } => *metadata,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// Per-key fixed-window rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimitConfig>,
    buckets: Arc<DashMap<String, RateLimitBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
            buckets: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request against `key_id`'s window.
    pub fn admit(&self, key_id: &str) -> Admission {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);
        let limit = self.config.budget;

        let threshold = self.config.max_buckets / 2;
        if self.buckets.len() > threshold {
            let ttl = Duration::from_secs(self.config.bucket_ttl_secs);
            self.buckets
                .retain(|_, bucket| now.duration_since(bucket.last_accessed) < ttl);
        }

        let mut bucket = self
            .buckets
            .entry(key_id.to_string())
            .or_insert_with(|| RateLimitBucket {
                count: 0,
                window_start: now,
                last_accessed: now,
            });

        bucket.last_accessed = now;

        if now.duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        let until_reset = window.saturating_sub(now.duration_since(bucket.window_start));
        let reset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .saturating_add(ceil_secs(until_reset));

        if bucket.count >= limit {
            let retry_after_secs = ceil_secs(until_reset).max(1);
            debug!(retry_after_secs, "Rate limit exceeded");

            #[cfg(feature = "metrics")]
            crate::metrics::RATE_LIMIT_REJECTIONS.inc();

            return Admission::Denied {
                retry_after_secs,
                metadata: RateLimitMetadata {
                    limit,
                    remaining: 0,
                    reset,
                },
            };
        }

        bucket.count += 1;
        Admission::Allowed(RateLimitMetadata {
            limit,
            remaining: limit.saturating_sub(bucket.count),
            reset,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(budget: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default().with_budget(budget))
    }

    #[test]
    fn test_config_defaults() {
        let config = RateLimitConfig::default();
        assert_eq!(config.budget, DEFAULT_BUDGET);
        assert_eq!(config.window_secs, DEFAULT_WINDOW_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::default().with_budget(0).validate().is_err());
        let config = RateLimitConfig {
            bucket_ttl_secs: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_budget_requests_admitted() {
        let limiter = limiter(50);

        for i in 0..50 {
            let admission = limiter.admit("key-a");
            assert!(admission.is_allowed(), "request {} should be admitted", i);
            assert_eq!(admission.metadata().remaining, 49 - i);
        }

        match limiter.admit("key-a") {
            Admission::Denied {
                retry_after_secs,
                metadata,
            } => {
                assert!(retry_after_secs > 0);
                assert!(retry_after_secs <= 60);
                assert_eq!(metadata.remaining, 0);
                assert_eq!(metadata.limit, 50);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_counts_down() {
        let limiter = limiter(1);
        assert!(limiter.admit("key-a").is_allowed());

        tokio::time::advance(Duration::from_millis(20_500)).await;
        match limiter.admit("key-a") {
            Admission::Denied {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 40),
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter(2);
        assert!(limiter.admit("key-a").is_allowed());
        assert!(limiter.admit("key-a").is_allowed());
        assert!(!limiter.admit("key-a").is_allowed());

        tokio::time::advance(Duration::from_secs(60)).await;

        let admission = limiter.admit("key-a");
        assert!(admission.is_allowed());
        assert_eq!(admission.metadata().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(1);
        assert!(limiter.admit("key-a").is_allowed());
        assert!(!limiter.admit("key-a").is_allowed());
        assert!(limiter.admit("key-b").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_buckets_cleaned_up() {
        let limiter = RateLimiter::new(RateLimitConfig {
            budget: 10,
            window_secs: 60,
            max_buckets: 4,
            bucket_ttl_secs: 60,
        });
        for key in ["a", "b", "c"] {
            limiter.admit(key);
        }
        assert_eq!(limiter.bucket_count(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.admit("d");
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admissions_respect_budget() {
        let limiter = limiter(25);
        let mut handles = Vec::new();
        for _ in 0..100 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.admit("shared") }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
    }
}
