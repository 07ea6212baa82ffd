use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tokio")]
use tokio::time::interval;

#[cfg(feature = "async-std")]
use async_std::task;

use crate::bucket::TokenBucket;
use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::error::Result;

/// Per-client rate limiter: one [`TokenBucket`] per client identifier.
///
/// Buckets are created lazily on first sight of an identifier. Concurrent
/// first requests for the same identifier always end up sharing one bucket.
/// Unrelated clients only contend on a map shard for the lookup, never on
/// each other's bucket.
///
/// ```
/// use client_ratelimit::ClientRegistry;
/// use std::time::Duration;
///
/// let registry = ClientRegistry::new(2, Duration::from_secs(1)).unwrap();
///
/// assert!(registry.is_allowed("10.0.0.1"));
/// assert!(registry.is_allowed("10.0.0.1"));
/// assert!(!registry.is_allowed("10.0.0.1"));
///
/// // Other clients have their own budget
/// assert!(registry.is_allowed("10.0.0.2"));
/// ```
#[derive(Debug)]
pub struct ClientRegistry {
    buckets: DashMap<String, Arc<TokenBucket>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl ClientRegistry {
    /// Create a registry whose buckets hold `capacity` tokens and gain one
    /// every `refill_interval`.
    pub fn new(capacity: u64, refill_interval: Duration) -> Result<Self> {
        Self::with_config(RegistryConfig::new(capacity, refill_interval))
    }

    pub fn with_config(config: RegistryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            buckets: DashMap::new(),
            config,
            clock,
        })
    }

    /// Admission decision for `client_id`; consumes a token when admitted.
    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.check(client_id).allowed
    }

    /// Like [`is_allowed`](Self::is_allowed), with the bucket's state after the check.
    pub fn check(&self, client_id: &str) -> RateLimitResult {
        let acquisition = self.bucket(client_id).acquire();

        if !acquisition.allowed {
            tracing::trace!(client_id, "rate limit exceeded");
        }

        RateLimitResult {
            allowed: acquisition.allowed,
            remaining: acquisition.remaining,
            limit: self.config.capacity,
            retry_after: acquisition.retry_after,
        }
    }

    /// Current tokens for a known client. Does not create a bucket.
    pub fn available_tokens(&self, client_id: &str) -> Option<u64> {
        let bucket = self.buckets.get(client_id).map(|b| Arc::clone(b.value()))?;
        Some(bucket.available_tokens())
    }

    /// Fetch the client's bucket, creating it if this is the first request.
    fn bucket(&self, client_id: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(client_id) {
            return Arc::clone(bucket.value());
        }

        // The entry holds the shard write lock, so a racing creator for the
        // same key waits here and then takes the Occupied arm.
        let (bucket, created) = match self.buckets.entry(client_id.to_owned()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let bucket = Arc::new(TokenBucket::new_unchecked(
                    self.config.capacity,
                    self.config.refill_interval,
                    Arc::clone(&self.clock),
                ));
                entry.insert(Arc::clone(&bucket));
                (bucket, true)
            }
        };

        if created {
            tracing::debug!(client_id, "created rate limit bucket");
        }
        bucket
    }

    /// Drop buckets idle for longer than the configured stale threshold that
    /// have refilled to capacity.
    ///
    /// Returns the number of buckets removed. Without a threshold this is a
    /// no-op. Only full buckets go, so a returning client gets exactly the
    /// budget it would have had. A request that fetched a bucket just before
    /// it was swept spends from the removed copy; since that copy was full,
    /// the client is out at most that one token, never over its capacity.
    pub fn evict_stale(&self) -> usize {
        let Some(threshold) = self.config.stale_threshold else {
            return 0;
        };

        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let keep = !bucket.is_stale(threshold);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = self.buckets.len(),
                "evicted stale rate limit buckets"
            );
        }
        removed
    }

    /// Run [`evict_stale`](Self::evict_stale) every `cleanup_interval`.
    ///
    /// The task holds a weak reference and stops once the registry is dropped.
    /// Does nothing when no stale threshold is configured.
    #[cfg(feature = "tokio")]
    pub fn spawn_cleanup_task(registry: &Arc<Self>) {
        if registry.config.stale_threshold.is_none() {
            return;
        }

        let weak = Arc::downgrade(registry);
        let period = registry.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = interval(period);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.evict_stale();
            }
        });
    }

    #[cfg(feature = "async-std")]
    pub fn spawn_cleanup_task(registry: &Arc<Self>) {
        if registry.config.stale_threshold.is_none() {
            return;
        }

        let weak = Arc::downgrade(registry);
        let period = registry.config.cleanup_interval;
        task::spawn(async move {
            loop {
                task::sleep(period).await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.evict_stale();
            }
        });
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get current statistics
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_clients: self.buckets.len(),
            capacity: self.config.capacity,
            refill_interval: self.config.refill_interval,
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// Time until the client's next token accrues, zero if tokens remain.
    pub retry_after: Duration,
}

/// Statistics about the registry
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub active_clients: usize,
    pub capacity: u64,
    pub refill_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ConfigError, RateLimitError};
    use std::sync::Barrier;
    use std::thread;

    fn registry(config: RegistryConfig) -> (ClientRegistry, ManualClock) {
        let clock = ManualClock::new();
        let registry = ClientRegistry::with_clock(config, Arc::new(clock.clone())).unwrap();
        (registry, clock)
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert_eq!(
            ClientRegistry::new(0, Duration::from_secs(1)).unwrap_err(),
            RateLimitError::InvalidConfiguration(ConfigError::ZeroCapacity)
        );
        assert_eq!(
            ClientRegistry::new(1, Duration::ZERO).unwrap_err(),
            RateLimitError::InvalidConfiguration(ConfigError::ZeroRefillInterval)
        );
    }

    #[test]
    fn test_rate_limiter() {
        let (registry, _clock) = registry(RegistryConfig::new(5, Duration::from_secs(1)));

        // Should allow up to capacity
        for i in 0..5 {
            let result = registry.check("192.168.1.1");
            assert!(result.allowed, "Request {} should be allowed", i + 1);
            assert_eq!(result.remaining, 4 - i as u64);
            assert_eq!(result.limit, 5);
        }

        // Should deny when capacity exceeded
        let result = registry.check("192.168.1.1");
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after, Duration::from_secs(1));
    }

    #[test]
    fn test_clients_are_isolated() {
        let (registry, _clock) = registry(RegistryConfig::new(2, Duration::from_secs(60)));

        assert!(registry.is_allowed("alice"));
        assert!(registry.is_allowed("alice"));
        assert!(!registry.is_allowed("alice"));

        // Exhausting one client leaves the other untouched
        assert!(registry.is_allowed("bob"));
        assert_eq!(registry.available_tokens("bob"), Some(1));
        assert_eq!(registry.available_tokens("alice"), Some(0));
        assert_eq!(registry.stats().active_clients, 2);
    }

    #[test]
    fn test_refill_through_registry() {
        let (registry, clock) = registry(RegistryConfig::new(1, Duration::from_millis(500)));

        assert!(registry.is_allowed("client"));
        assert!(!registry.is_allowed("client"));

        clock.advance(Duration::from_millis(500));
        assert!(registry.is_allowed("client"));
        assert!(!registry.is_allowed("client"));
    }

    #[test]
    fn test_available_tokens_does_not_create_bucket() {
        let (registry, _clock) = registry(RegistryConfig::default());
        assert_eq!(registry.available_tokens("ghost"), None);
        assert_eq!(registry.stats().active_clients, 0);
    }

    #[test]
    fn test_concurrent_first_access_creates_single_bucket() {
        const CAPACITY: u64 = 8;
        const THREADS: usize = 32;

        let (registry, _clock) =
            registry(RegistryConfig::new(CAPACITY, Duration::from_secs(3600)));
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.is_allowed("fresh-client")
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        // A second bucket would have let up to 2 * CAPACITY through.
        assert_eq!(granted as u64, CAPACITY);
        assert_eq!(registry.stats().active_clients, 1);
        assert_eq!(registry.available_tokens("fresh-client"), Some(0));
    }

    #[test]
    fn test_concurrent_clients_get_independent_budgets() {
        const CAPACITY: u64 = 4;
        const CLIENTS: usize = 8;
        const THREADS_PER_CLIENT: usize = 4;
        const CALLS: usize = 3;

        let (registry, _clock) =
            registry(RegistryConfig::new(CAPACITY, Duration::from_secs(3600)));
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(CLIENTS * THREADS_PER_CLIENT));

        let handles: Vec<_> = (0..CLIENTS * THREADS_PER_CLIENT)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let client = format!("client-{}", i % CLIENTS);
                thread::spawn(move || {
                    barrier.wait();
                    (0..CALLS).filter(|_| registry.is_allowed(&client)).count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted as u64, CAPACITY * CLIENTS as u64);
        assert_eq!(registry.stats().active_clients, CLIENTS);
    }

    #[test]
    fn test_evict_stale_without_threshold_keeps_everything() {
        let (registry, clock) = registry(RegistryConfig::new(1, Duration::from_secs(1)));
        registry.is_allowed("a");
        clock.advance(Duration::from_secs(86_400));
        assert_eq!(registry.evict_stale(), 0);
        assert_eq!(registry.stats().active_clients, 1);
    }

    #[test]
    fn test_evict_stale_removes_idle_buckets() {
        let config = RegistryConfig::new(1, Duration::from_secs(1))
            .with_stale_threshold(Duration::from_secs(60));
        let (registry, clock) = registry(config);

        registry.is_allowed("idle");
        clock.advance(Duration::from_secs(45));
        registry.is_allowed("busy");
        clock.advance(Duration::from_secs(30));

        assert_eq!(registry.evict_stale(), 1);
        assert_eq!(registry.available_tokens("idle"), None);
        assert!(registry.available_tokens("busy").is_some());

        // A returning client starts with a full bucket
        assert!(registry.is_allowed("idle"));
    }

    #[test]
    fn test_evict_stale_keeps_partially_refilled_buckets() {
        let config = RegistryConfig::new(10, Duration::from_secs(60))
            .with_stale_threshold(Duration::from_secs(120));
        let (registry, clock) = registry(config);

        for _ in 0..10 {
            assert!(registry.is_allowed("drained"));
        }
        clock.advance(Duration::from_secs(121));

        assert_eq!(registry.evict_stale(), 0);
        let granted = (0..20).filter(|_| registry.is_allowed("drained")).count();
        assert_eq!(granted, 2);

        // Once fully refilled and idle, the bucket can go
        clock.advance(Duration::from_secs(600));
        assert_eq!(registry.evict_stale(), 1);
        assert_eq!(registry.stats().active_clients, 0);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_sweeps_periodically() {
        let config = RegistryConfig::new(1, Duration::from_secs(1))
            .with_stale_threshold(Duration::from_secs(10))
            .with_cleanup_interval(Duration::from_secs(1));
        let (registry, clock) = registry(config);
        let registry = Arc::new(registry);

        registry.is_allowed("client");
        clock.advance(Duration::from_secs(11));

        ClientRegistry::spawn_cleanup_task(&registry);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(registry.stats().active_clients, 0);
    }

    #[test]
    fn test_stats() {
        let (registry, _clock) = registry(RegistryConfig::new(7, Duration::from_millis(250)));
        registry.is_allowed("x");
        let stats = registry.stats();
        assert_eq!(stats.active_clients, 1);
        assert_eq!(stats.capacity, 7);
        assert_eq!(stats.refill_interval, Duration::from_millis(250));
    }
}
