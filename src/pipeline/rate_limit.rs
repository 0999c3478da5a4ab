// Token-bucket rate limiting per external collaborator class
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// `requests_per_interval` tokens are added every `interval`, up to `burst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_interval: u32,
    pub interval_ms: u64,
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Every field must be at least 1, otherwise the bucket never refills.
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_interval == 0 || self.interval_ms == 0 || self.burst == 0 {
            return Err(PipelineError::Config(
                "rate_limit values must all be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.requests_per_interval as f64 / self.interval().as_secs_f64()
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single bucket, shared by every worker calling the same collaborator.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            capacity: config.burst as f64,
            refill_rate: config.refill_rate(),
            state: Mutex::new(BucketState {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Wait until a token is available, then take it. Never rejects.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(state.last_refill);
                state.tokens =
                    (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Independent buckets keyed by collaborator class.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, RateLimitConfig>) -> Result<Self> {
        let mut buckets = HashMap::with_capacity(limits.len());
        for (class, config) in limits {
            let bucket = TokenBucket::new(&config).map_err(|_| {
                PipelineError::Config(format!("collaborator class '{}': invalid rate limit", class))
            })?;
            buckets.insert(class, Arc::new(bucket));
        }
        Ok(Self {
            buckets: Arc::new(buckets),
        })
    }

    /// Suspend until `class` may make another call. Classes without a
    /// configured limit proceed immediately.
    pub async fn acquire(&self, class: &str) {
        if let Some(bucket) = self.buckets.get(class) {
            bucket.acquire().await;
        }
    }

    pub fn is_limited(&self, class: &str) -> bool {
        self.buckets.contains_key(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limits(class: &str, rpi: u32, interval_ms: u64, burst: u32) -> HashMap<String, RateLimitConfig> {
        HashMap::from([(
            class.to_string(),
            RateLimitConfig {
                requests_per_interval: rpi,
                interval_ms,
                burst,
            },
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_granted_immediately() {
        let limiter = RateLimiter::new(limits("instagram", 2, 1000, 3)).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("instagram").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire("instagram").await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_class_never_waits() {
        let limiter = RateLimiter::new(limits("instagram", 1, 60_000, 1)).unwrap();
        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire("local-ffmpeg").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!limiter.is_limited("local-ffmpeg"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_classes_are_independent() {
        let mut config = limits("instagram", 1, 10_000, 1);
        config.extend(limits("whisper", 1, 10_000, 1));
        let limiter = RateLimiter::new(config).unwrap();

        limiter.acquire("instagram").await;
        let start = Instant::now();
        limiter.acquire("whisper").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_per_window_never_exceed_burst_plus_rate() {
        let rpi = 4;
        let burst = 2;
        let interval = Duration::from_millis(1000);
        let limiter = RateLimiter::new(limits("whisper", rpi, 1000, burst)).unwrap();
        let origin = Instant::now();
        let grants = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let grants = grants.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                while counter.fetch_add(1, Ordering::SeqCst) < 30 {
                    limiter.acquire("whisper").await;
                    grants.lock().unwrap().push(origin.elapsed());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let grants = grants.lock().unwrap().clone();
        assert_eq!(grants.len(), 30);
        for start in &grants {
            let in_window = grants
                .iter()
                .filter(|t| **t >= *start && **t < *start + interval)
                .count();
            assert!(in_window <= (burst + rpi) as usize, "{} grants in one window", in_window);
        }
    }

    #[test]
    fn test_degenerate_limits_are_rejected() {
        assert!(RateLimiter::new(limits("instagram", 0, 1000, 1)).is_err());
        assert!(RateLimiter::new(limits("instagram", 1, 0, 1)).is_err());
        let err = RateLimiter::new(limits("instagram", 1, 1000, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("instagram"));
    }
}
