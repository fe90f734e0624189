//! Client-side admission limiting for the instance creation endpoint.
//!
//! The cloud API throttles instance creation per account. Every controller
//! pass that wants to create an instance first asks the account's
//! [`AdmissionLimiter`] for a slot; the HTTP client feeds the API's
//! rate-limit headers back into the same limiter so local accounting
//! converges on what the server reports.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use reqwest::Method;
use tokio::time::Instant;
use tracing::debug;

use crate::credentials::Credentials;
use crate::http::{ResponseObserver, INSTANCES_PATH};

/// Header carrying the request ceiling of the current window
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Header carrying the requests left in the current window
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Header carrying the Unix time (seconds) the current window ends
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Sizing of a limiter window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Admissions allowed per window
    pub ceiling: u32,
    /// Window length
    pub window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            ceiling: 10,
            window: Duration::from_secs(30),
        }
    }
}

/// Server-reported state of a rate limit window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    /// Time until the window resets, measured when the response arrived
    pub reset_in: Duration,
}

impl RateLimitSnapshot {
    /// Parse the rate-limit headers of a response.
    ///
    /// Returns `None` unless all three headers are present and numeric.
    pub fn from_headers(headers: &HeaderMap, now_unix: i64) -> Option<Self> {
        let read = |name: &str| -> Option<i64> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        };
        let limit = u32::try_from(read(RATE_LIMIT_LIMIT_HEADER)?).ok()?;
        let remaining = u32::try_from(read(RATE_LIMIT_REMAINING_HEADER)?).ok()?;
        let reset_at = read(RATE_LIMIT_RESET_HEADER)?;
        let reset_in = Duration::from_secs(u64::try_from(reset_at - now_unix).unwrap_or(0));
        Some(Self {
            limit,
            remaining,
            reset_in,
        })
    }
}

/// Rolling-window admission counter for one account
#[derive(Debug)]
pub struct AdmissionLimiter {
    ceiling: u32,
    window: Duration,
    count: u32,
    window_end: Instant,
}

impl AdmissionLimiter {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            ceiling: config.ceiling,
            window: config.window,
            count: 0,
            window_end: Instant::now(),
        }
    }

    fn roll(&mut self, now: Instant) {
        if now >= self.window_end {
            self.count = 0;
            self.window_end = now + self.window;
        }
    }

    /// Claim one admission in the current window.
    ///
    /// On refusal returns how long until the window resets. The check and
    /// the increment happen under the same `&mut`, so two callers sharing
    /// the limiter behind a lock can never both take the last slot.
    pub fn try_admit(&mut self) -> Result<(), Duration> {
        let now = Instant::now();
        self.roll(now);
        if self.count >= self.ceiling {
            return Err(self.window_end.saturating_duration_since(now));
        }
        self.count += 1;
        Ok(())
    }

    /// True when the current window has no admissions left
    pub fn is_limit_reached(&mut self) -> bool {
        self.roll(Instant::now());
        self.count >= self.ceiling
    }

    /// Time until the current window resets
    pub fn retry_after(&self) -> Duration {
        self.window_end.saturating_duration_since(Instant::now())
    }

    /// Adopt the server's view of the window
    pub fn observe(&mut self, snapshot: &RateLimitSnapshot) {
        self.ceiling = snapshot.limit;
        self.count = snapshot.limit.saturating_sub(snapshot.remaining);
        self.window_end = Instant::now() + snapshot.reset_in;
    }
}

/// Limiter shared between every pass that uses the same credentials
pub type SharedLimiter = Arc<Mutex<AdmissionLimiter>>;

/// Per-account limiters keyed by [`Credentials::identity`]
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    config: LimiterConfig,
    limiters: DashMap<String, SharedLimiter>,
}

impl LimiterRegistry {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            limiters: DashMap::new(),
        }
    }

    /// The limiter for these credentials, created on first use
    pub fn limiter_for(&self, credentials: &Credentials) -> SharedLimiter {
        self.limiters
            .entry(credentials.identity())
            .or_insert_with(|| Arc::new(Mutex::new(AdmissionLimiter::new(&self.config))))
            .clone()
    }

    /// Number of accounts seen so far
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// Feeds instance-creation responses into an account's limiter
pub struct LimiterObserver {
    limiter: SharedLimiter,
}

impl LimiterObserver {
    pub fn new(limiter: SharedLimiter) -> Self {
        Self { limiter }
    }
}

impl ResponseObserver for LimiterObserver {
    fn on_response(&self, method: &Method, path: &str, headers: &HeaderMap) {
        if method != Method::POST || path != INSTANCES_PATH {
            return;
        }
        let now_unix = chrono::Utc::now().timestamp();
        if let Some(snapshot) = RateLimitSnapshot::from_headers(headers, now_unix) {
            debug!(
                limit = snapshot.limit,
                remaining = snapshot.remaining,
                reset_in_secs = snapshot.reset_in.as_secs(),
                "Updating admission limiter from response headers"
            );
            self.limiter.lock().observe(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn limiter(ceiling: u32, window_secs: u64) -> AdmissionLimiter {
        AdmissionLimiter::new(&LimiterConfig {
            ceiling,
            window: Duration::from_secs(window_secs),
        })
    }

    fn headers(limit: &str, remaining: &str, reset: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from_str(limit).unwrap());
        h.insert(
            RATE_LIMIT_REMAINING_HEADER,
            HeaderValue::from_str(remaining).unwrap(),
        );
        h.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from_str(reset).unwrap());
        h
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_the_admission_after_the_ceiling() {
        let mut l = limiter(10, 30);
        for _ in 0..10 {
            assert!(l.try_admit().is_ok());
        }
        let refused = l.try_admit().unwrap_err();
        assert!(refused > Duration::ZERO);
        assert!(refused <= Duration::from_secs(30));
        assert!(l.is_limit_reached());
    }

    #[tokio::test(start_paused = true)]
    async fn window_reset_restores_admissions() {
        let mut l = limiter(2, 30);
        l.try_admit().unwrap();
        l.try_admit().unwrap();
        assert!(l.try_admit().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(!l.is_limit_reached());
        assert!(l.try_admit().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_counts_down_to_window_end() {
        let mut l = limiter(1, 30);
        l.try_admit().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(l.retry_after(), Duration::from_secs(20));
        assert_eq!(l.try_admit().unwrap_err(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn observed_headers_override_local_accounting() {
        let mut l = limiter(10, 30);
        l.observe(&RateLimitSnapshot {
            limit: 5,
            remaining: 0,
            reset_in: Duration::from_secs(4),
        });
        assert!(l.is_limit_reached());
        assert_eq!(l.retry_after(), Duration::from_secs(4));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(l.try_admit().is_ok());
    }

    #[test]
    fn snapshot_requires_all_three_headers() {
        let full = headers("10", "7", "1030");
        let snapshot = RateLimitSnapshot::from_headers(&full, 1000).unwrap();
        assert_eq!(
            snapshot,
            RateLimitSnapshot {
                limit: 10,
                remaining: 7,
                reset_in: Duration::from_secs(30),
            }
        );

        let mut partial = HeaderMap::new();
        partial.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from_static("10"));
        assert!(RateLimitSnapshot::from_headers(&partial, 1000).is_none());
    }

    #[test]
    fn reset_in_the_past_means_reset_now() {
        let snapshot = RateLimitSnapshot::from_headers(&headers("10", "0", "900"), 1000).unwrap();
        assert_eq!(snapshot.reset_in, Duration::ZERO);
    }

    #[tokio::test]
    async fn registry_shares_one_limiter_per_account() {
        let registry = LimiterRegistry::new(LimiterConfig {
            ceiling: 1,
            window: Duration::from_secs(30),
        });
        let a = Credentials::new("account-a");
        let b = Credentials::new("account-b");

        registry.limiter_for(&a).lock().try_admit().unwrap();
        assert!(registry.limiter_for(&a).lock().try_admit().is_err());
        assert!(registry.limiter_for(&b).lock().try_admit().is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn observer_only_reacts_to_instance_creation() {
        let shared = Arc::new(Mutex::new(limiter(10, 30)));
        let observer = LimiterObserver::new(shared.clone());
        let exhausted = headers("10", "0", &(chrono::Utc::now().timestamp() + 60).to_string());

        observer.on_response(&Method::GET, INSTANCES_PATH, &exhausted);
        assert!(!shared.lock().is_limit_reached());

        observer.on_response(&Method::POST, "vpcs", &exhausted);
        assert!(!shared.lock().is_limit_reached());

        observer.on_response(&Method::POST, INSTANCES_PATH, &exhausted);
        assert!(shared.lock().is_limit_reached());
    }
}
