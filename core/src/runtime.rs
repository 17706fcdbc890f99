/// Non-authoritative in-memory singletons.
///
/// None of these are ground truth: losing them on restart is safe. They are
/// explicit fields on `KernelRuntime` rather than process globals so tests
/// can construct independent instances.
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

const IDEMPOTENCY_TTL_SECS: i64 = 60;
const RATE_LIMIT_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct RateLimitCounter {
    pub count: u32,
    pub window_started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// 60s-TTL dedup cache for webhook delivery, keyed by a stable event id.
#[derive(Debug, Default)]
pub struct IdempotencyCache {
    seen: DashMap<String, DateTime<Utc>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `key` was already seen within the TTL window (i.e.
    /// the caller should treat this as a duplicate). Records `key` either way.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Utc::now();
        self.seen.retain(|_, seen_at| now - *seen_at < Duration::seconds(IDEMPOTENCY_TTL_SECS));

        if self.seen.contains_key(key) {
            true
        } else {
            self.seen.insert(key.to_string(), now);
            false
        }
    }
}

/// Per-user rate limiting for chat ingress (1 min decay).
#[derive(Debug, Default)]
pub struct RateLimiter {
    counters: DashMap<String, RateLimitCounter>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `key` and returns `true` if `limit` was
    /// exceeded within the current window.
    pub fn check_and_increment(&self, key: &str, limit: u32) -> bool {
        let now = Utc::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(RateLimitCounter {
            count: 0,
            window_started_at: now,
        });

        if now - entry.window_started_at >= Duration::seconds(RATE_LIMIT_WINDOW_SECS) {
            entry.count = 0;
            entry.window_started_at = now;
        }

        entry.count += 1;
        entry.count > limit
    }
}

/// Bearer-token cache for outbound calls to code-hosting providers, keyed by
/// installation id.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: DashMap<String, CachedToken>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, installation_id: &str) -> Option<String> {
        let entry = self.tokens.get(installation_id)?;
        if entry.expires_at > Utc::now() {
            Some(entry.token.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, installation_id: &str, token: String, expires_at: DateTime<Utc>) {
        self.tokens
            .insert(installation_id.to_string(), CachedToken { token, expires_at });
    }
}

/// The three non-authoritative singletons, grouped for convenient sharing
/// behind a single `Arc` alongside the `Store`.
#[derive(Debug, Default)]
pub struct KernelRuntime {
    pub idempotency: IdempotencyCache,
    pub rate_limits: RateLimiter,
    pub token_cache: TokenCache,
}

impl KernelRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_cache_flags_duplicates() {
        let cache = IdempotencyCache::new();
        assert!(!cache.check_and_record("evt-1"));
        assert!(cache.check_and_record("evt-1"));
    }

    #[test]
    fn rate_limiter_trips_after_limit() {
        let limiter = RateLimiter::new();
        assert!(!limiter.check_and_increment("user-1", 2));
        assert!(!limiter.check_and_increment("user-1", 2));
        assert!(limiter.check_and_increment("user-1", 2));
    }
}
