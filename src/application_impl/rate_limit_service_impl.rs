use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed-window rate limiter over a shared counter store.
///
/// Without a store, or while the store errors, every request is admitted.
pub struct FixedWindowRateLimiter {
    store: Option<Arc<dyn CounterStore>>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowRateLimiter {
    pub fn new(store: Option<Arc<dyn CounterStore>>, clock: Arc<dyn Clock>) -> Self {
        if store.is_none() {
            warn!("rate limiting is disabled: no counter store configured");
        }
        Self { store, clock }
    }

    pub fn is_enforcing(&self) -> bool {
        self.store.is_some()
    }

    fn fail_open(&self, policy: RateLimitPolicy) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            limit: policy.limit,
            remaining: policy.limit,
            reset_at: window_end(self.clock.now(), policy.window()),
        }
    }

    async fn count(
        &self,
        store: &dyn CounterStore,
        key: &str,
        policy: RateLimitPolicy,
    ) -> Result<RateLimitDecision, CounterStoreError> {
        let count = store.increment(key, policy.limit.saturating_add(1)).await?;

        if count == 1 {
            if let Err(e) = store.expire(key, policy.window()).await {
                warn!(key, error = %e, "failed to start rate limit window");
            }
        }

        let ttl = match store.ttl(key).await {
            Ok(Some(ttl)) => Some(ttl),
            Ok(None) => {
                // A counter must never outlive its window; heal a lost expiry.
                if let Err(e) = store.expire(key, policy.window()).await {
                    warn!(key, error = %e, "failed to restore rate limit window");
                }
                None
            }
            Err(e) => {
                debug!(key, error = %e, "counter ttl unavailable");
                None
            }
        };

        let reset_at = window_end(self.clock.now(), ttl.unwrap_or_else(|| policy.window()));

        Ok(RateLimitDecision {
            allowed: count <= policy.limit,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(count),
            reset_at,
        })
    }
}

/// `now + window`, saturating at the largest representable instant.
fn window_end(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait::async_trait]
impl RateLimitService for FixedWindowRateLimiter {
    async fn check(
        &self,
        key: &RateLimitKey,
        policy: RateLimitPolicy,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if !policy.is_valid() {
            return Err(RateLimitError::InvalidPolicy {
                limit: policy.limit,
                window_secs: policy.window_secs,
            });
        }
        if key.is_empty() {
            return Err(RateLimitError::InvalidKey);
        }

        let Some(store) = self.store.as_deref() else {
            return Ok(self.fail_open(policy));
        };

        let key = key.to_string();
        match self.count(store, &key, policy).await {
            Ok(decision) => {
                debug!(
                    key = %key,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "rate limit decision"
                );
                Ok(decision)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "counter store failed, admitting request");
                Ok(self.fail_open(policy))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra_memory::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        clock: Arc<ManualClock>,
        limiter: Arc<FixedWindowRateLimiter>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = Arc::new(FixedWindowRateLimiter::new(Some(store), clock.clone()));
        Fixture { clock, limiter }
    }

    struct BrokenStore {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _ceiling: u64) -> Result<u64, CounterStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CounterStoreError::Unavailable("connection refused".into()))
        }

        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".into()))
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".into()))
        }
    }

    /// Counts like a store but can neither report nor keep an expiry.
    struct NoTtlStore {
        inner: MemoryCounterStore,
        expire_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CounterStore for NoTtlStore {
        async fn increment(&self, key: &str, ceiling: u64) -> Result<u64, CounterStoreError> {
            self.inner.increment(key, ceiling).await
        }

        async fn ttl(&self, _key: &str) -> Result<Option<Duration>, CounterStoreError> {
            Ok(None)
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), CounterStoreError> {
            self.expire_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn window_admits_exactly_limit_then_resets() {
        let f = fixture();
        let key = RateLimitKey::new("api", "ip:1.2.3.4");
        let policy = RateLimitPolicy::new(5, 60);

        for expected in [4, 3, 2, 1, 0] {
            let decision = f.limiter.check(&key, policy).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let rejected = f.limiter.check(&key, policy).await.unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);

        f.clock.advance(chrono::Duration::seconds(61));
        let decision = f.limiter.check(&key, policy).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn reset_at_tracks_the_window_start() {
        let f = fixture();
        let key = RateLimitKey::new("api", "user:42");
        let policy = RateLimitPolicy::new(3, 60);
        let started = f.clock.now();

        let first = f.limiter.check(&key, policy).await.unwrap();
        assert_eq!(first.reset_at, started + chrono::Duration::seconds(60));

        f.clock.advance(chrono::Duration::seconds(20));
        let second = f.limiter.check(&key, policy).await.unwrap();
        assert_eq!(second.reset_at, started + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn keys_are_counted_independently() {
        let f = fixture();
        let policy = RateLimitPolicy::new(1, 60);
        let a = RateLimitKey::new("api", "ip:10.0.0.1");
        let b = RateLimitKey::new("api", "ip:10.0.0.2");
        let c = RateLimitKey::new("auth", "ip:10.0.0.1");

        assert!(f.limiter.check(&a, policy).await.unwrap().allowed);
        assert!(!f.limiter.check(&a, policy).await.unwrap().allowed);
        assert!(f.limiter.check(&b, policy).await.unwrap().allowed);
        assert!(f.limiter.check(&c, policy).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn concurrent_burst_admits_exactly_limit() {
        let f = fixture();
        let key = RateLimitKey::new("api", "ip:5.6.7.8");
        let policy = RateLimitPolicy::new(10, 60);

        let mut handles = Vec::new();
        for _ in 0..25 {
            let limiter = f.limiter.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                limiter.check(&key, policy).await.unwrap().allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn rejected_requests_are_not_counted_again() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = FixedWindowRateLimiter::new(Some(store.clone()), clock.clone());
        let key = RateLimitKey::new("api", "ip:9.9.9.9");
        let policy = RateLimitPolicy::new(2, 60);

        for _ in 0..10 {
            limiter.check(&key, policy).await.unwrap();
        }
        assert_eq!(store.increment(&key.to_string(), u64::MAX).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn missing_store_fails_open() {
        let clock = Arc::new(ManualClock::default());
        let limiter = FixedWindowRateLimiter::new(None, clock);
        let key = RateLimitKey::new("api", "ip:1.1.1.1");
        let policy = RateLimitPolicy::new(2, 60);

        for _ in 0..100 {
            let decision = limiter.check(&key, policy).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 2);
        }
        assert!(!limiter.is_enforcing());
    }

    #[tokio::test]
    async fn failing_store_fails_open() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(BrokenStore {
            calls: AtomicUsize::new(0),
        });
        let limiter = FixedWindowRateLimiter::new(Some(store.clone()), clock);
        let key = RateLimitKey::new("api", "ip:1.1.1.1");
        let policy = RateLimitPolicy::new(1, 60);

        for _ in 0..20 {
            let decision = limiter.check(&key, policy).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 1);
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn unknown_ttl_falls_back_to_window_and_reapplies_expiry() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(NoTtlStore {
            inner: MemoryCounterStore::new(clock.clone()),
            expire_calls: AtomicUsize::new(0),
        });
        let limiter = FixedWindowRateLimiter::new(Some(store.clone()), clock.clone());
        let key = RateLimitKey::new("api", "ip:2.2.2.2");

        let decision = limiter.check(&key, RateLimitPolicy::new(5, 30)).await.unwrap();
        assert_eq!(decision.reset_at, clock.now() + chrono::Duration::seconds(30));
        // Once for the new window, once to heal the missing ttl.
        assert_eq!(store.expire_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let f = fixture();
        let key = RateLimitKey::new("api", "ip:1.2.3.4");
        assert!(matches!(
            f.limiter.check(&key, RateLimitPolicy::new(0, 60)).await,
            Err(RateLimitError::InvalidPolicy { .. })
        ));
        assert!(matches!(
            f.limiter.check(&key, RateLimitPolicy::new(5, 0)).await,
            Err(RateLimitError::InvalidPolicy { .. })
        ));
        assert!(matches!(
            f.limiter
                .check(&key, RateLimitPolicy::new(5, 10_000_000_000_000))
                .await,
            Err(RateLimitError::InvalidPolicy { .. })
        ));
        assert!(matches!(
            f.limiter
                .check(&RateLimitKey::new("api", ""), RateLimitPolicy::new(5, 60))
                .await,
            Err(RateLimitError::InvalidKey)
        ));
    }

    #[test]
    fn window_end_saturates_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(window_end(now, Duration::from_secs(60)), now + chrono::Duration::seconds(60));
        assert_eq!(window_end(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            window_end(now, Duration::from_secs(10_000_000_000_000)),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
