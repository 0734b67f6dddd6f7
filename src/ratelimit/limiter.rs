//! The limiter facade: namespacing, validation and dispatch to an engine.

use tracing::{debug, trace};

use crate::error::{LimiterError, Result};
use crate::store::AtomicStore;

use super::gcra::Gcra;
use super::key::{StoreKey, DEFAULT_PREFIX};
use super::limit::{Algorithm, Decision, Limit};
use super::sliding_window::SlidingWindow;

/// An engine bound to one namespaced key.
enum Engine<'a, S: ?Sized> {
    Gcra(Gcra<'a, S>),
    SlidingWindow(SlidingWindow<'a, S>),
}

impl<'a, S: AtomicStore + ?Sized> Engine<'a, S> {
    async fn allow_n(&self, n: u64) -> Result<Decision> {
        match self {
            Engine::Gcra(engine) => engine.allow_n(n).await,
            Engine::SlidingWindow(engine) => engine.allow().await,
        }
    }

    async fn reset(&self) -> Result<()> {
        match self {
            Engine::Gcra(engine) => engine.reset().await,
            Engine::SlidingWindow(engine) => engine.reset().await,
        }
    }
}

/// Controls how frequently events are allowed to happen.
///
/// The limiter holds no per-key state: every decision is made by one atomic
/// procedure in the store, so any number of limiters in any number of
/// processes sharing a store observe one consistent decision stream per key.
#[derive(Debug, Clone)]
pub struct Limiter<S> {
    store: S,
    prefix: String,
}

impl<S: AtomicStore> Limiter<S> {
    /// Create a limiter namespacing its keys under `"limiter"`.
    pub fn new(store: S) -> Self {
        Self::with_prefix(store, DEFAULT_PREFIX)
    }

    /// Create a limiter namespacing its keys under `prefix`.
    pub fn with_prefix(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Check whether one event for `key` may happen now under `limit`.
    pub async fn allow(&self, key: &str, limit: &Limit) -> Result<Decision> {
        self.allow_n(key, limit, 1).await
    }

    /// Check whether `n` events for `key` may happen now under `limit`.
    ///
    /// The sliding window records one event per check, so it only accepts
    /// `n == 1`.
    pub async fn allow_n(&self, key: &str, limit: &Limit, n: u64) -> Result<Decision> {
        if limit.algorithm == Algorithm::SlidingWindow && n != 1 {
            return Err(LimiterError::InvalidLimit(format!(
                "sliding window admits exactly one event per check, got {}",
                n
            )));
        }
        let store_key = self.store_key(key, limit)?;

        trace!(
            key = %store_key,
            algorithm = %limit.algorithm,
            n = n,
            "Checking rate limit"
        );

        let decision = self.engine(&store_key, limit).allow_n(n).await?;

        if !decision.allowed {
            debug!(
                key = %store_key,
                algorithm = %limit.algorithm,
                remaining = decision.remaining,
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Delete the state for `key` under `limit`'s algorithm.
    ///
    /// Idempotent: resetting a key that was never used succeeds.
    pub async fn reset(&self, key: &str, limit: &Limit) -> Result<()> {
        let store_key = self.store_key(key, limit)?;
        self.engine(&store_key, limit).reset().await?;
        debug!(key = %store_key, "Rate limit reset");
        Ok(())
    }

    /// Validate `limit` and build the namespaced key, before any store I/O.
    fn store_key(&self, key: &str, limit: &Limit) -> Result<StoreKey> {
        limit.validate()?;
        Ok(StoreKey::new(&self.prefix, limit.algorithm, key))
    }

    fn engine<'a>(&'a self, store_key: &StoreKey, limit: &'a Limit) -> Engine<'a, S> {
        let key = store_key.to_string_key();
        match limit.algorithm {
            Algorithm::Gcra => Engine::Gcra(Gcra::new(&self.store, key, limit)),
            Algorithm::SlidingWindow => {
                Engine::SlidingWindow(SlidingWindow::new(&self.store, key, limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Arg, ManualClock, MemoryStore, Procedure, Reply, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn test_limiter() -> (Limiter<Arc<MemoryStore>>, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (Limiter::new(store), clock)
    }

    /// A store that answers every procedure with a fixed reply and counts calls.
    struct CannedStore {
        reply: Vec<Reply>,
        calls: AtomicUsize,
    }

    impl CannedStore {
        fn new(reply: Vec<Reply>) -> Self {
            Self {
                reply,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AtomicStore for CannedStore {
        async fn run(&self, _: Procedure, _: &str, _: &[Arg]) -> StoreResult<Vec<Reply>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }

        async fn delete(&self, _: &str) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_gcra_burst_admission() {
        let (limiter, _) = test_limiter();
        let limit = Limit::gcra(10, Duration::from_secs(120), 10);

        let mut last_remaining = u64::MAX;
        for i in 1..=10 {
            let decision = limiter.allow("burst", &limit).await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i);
            assert!(decision.remaining < last_remaining);
            assert_eq!(decision.retry_after, None);
            last_remaining = decision.remaining;
        }
        assert_eq!(last_remaining, 0);

        let decision = limiter.allow("burst", &limit).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(12)));
    }

    #[tokio::test]
    async fn test_gcra_first_call_reports_metadata() {
        let (limiter, _) = test_limiter();
        let limit = Limit::gcra(10, Duration::from_secs(60), 10);

        let decision = limiter.allow("test_me", &limit).await.unwrap();

        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.retry_after, None);
        assert_eq!(decision.reset_after, Some(Duration::from_secs(6)));
        assert_eq!(decision.key, "limiter:gcra:test_me");
        assert_eq!(decision.limit, limit);
    }

    #[tokio::test]
    async fn test_gcra_refills_after_retry_after() {
        let (limiter, clock) = test_limiter();
        let limit = Limit::gcra(1, Duration::from_secs(60), 1);

        assert!(limiter.allow("refill", &limit).await.unwrap().allowed);
        clock.advance(Duration::from_secs(15));

        let rejected = limiter.allow("refill", &limit).await.unwrap();
        assert!(!rejected.allowed);
        let wait = rejected.retry_after.unwrap();
        assert_eq!(wait, Duration::from_secs(45));

        clock.advance(wait);
        assert!(limiter.allow("refill", &limit).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_gcra_rejection_has_no_side_effect() {
        let (limiter, _) = test_limiter();
        let limit = Limit::gcra(3, Duration::from_secs(30), 3);

        for _ in 0..3 {
            assert!(limiter.allow("steady", &limit).await.unwrap().allowed);
        }

        let first = limiter.allow("steady", &limit).await.unwrap();
        let second = limiter.allow("steady", &limit).await.unwrap();
        assert!(!first.allowed);
        assert!(!second.allowed);
        assert_eq!(first.remaining, second.remaining);
        assert_eq!(first.retry_after, second.retry_after);
        assert_eq!(first.reset_after, second.reset_after);
    }

    #[tokio::test]
    async fn test_gcra_allow_n() {
        let (limiter, _) = test_limiter();
        let limit = Limit::gcra(10, Duration::from_secs(10), 10);

        let decision = limiter.allow_n("bulk", &limit, 4).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 6);

        let decision = limiter.allow_n("bulk", &limit, 7).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 6);
    }

    #[tokio::test]
    async fn test_zero_rate_gcra_skips_store() {
        let store = CannedStore::new(vec![]);
        let limiter = Limiter::new(store);
        let limit = Limit::gcra(0, Duration::from_secs(1), 5);

        let decision = limiter.allow("closed", &limit).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, None);
        assert_eq!(limiter.store().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sliding_window_exactness() {
        let (limiter, _) = test_limiter();
        let limit = Limit::sliding_window(1, Duration::from_secs(60));

        let first = limiter.allow("window", &limit).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 0);
        assert_eq!(first.reset_after, Some(Duration::from_secs(60)));

        let second = limiter.allow("window", &limit).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.retry_after, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_sliding_window_rolls_off() {
        let (limiter, clock) = test_limiter();
        let limit = Limit::sliding_window(2, Duration::from_secs(10));

        assert!(limiter.allow("roll", &limit).await.unwrap().allowed);
        clock.advance(Duration::from_secs(5));
        assert!(limiter.allow("roll", &limit).await.unwrap().allowed);

        let rejected = limiter.allow("roll", &limit).await.unwrap();
        assert_eq!(rejected.retry_after, Some(Duration::from_secs(5)));

        clock.advance(Duration::from_secs(5));
        let decision = limiter.allow("roll", &limit).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_sliding_window_rejects_multi_event_checks() {
        let store = CannedStore::new(vec![]);
        let limiter = Limiter::new(store);
        let limit = Limit::sliding_window(5, Duration::from_secs(1));

        let result = limiter.allow_n("k", &limit, 2).await;
        assert!(matches!(result, Err(LimiterError::InvalidLimit(_))));
        assert_eq!(limiter.store().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reset_never_used_key() {
        let (limiter, _) = test_limiter();
        assert_ok!(limiter.reset("never", &Limit::per_second(1)).await);
        assert_ok!(
            limiter
                .reset("never", &Limit::sliding_window(1, Duration::from_secs(1)))
                .await
        );
    }

    #[tokio::test]
    async fn test_reset_restores_fresh_state() {
        let (limiter, _) = test_limiter();

        for limit in [
            Limit::gcra(1, Duration::from_secs(60), 1),
            Limit::sliding_window(1, Duration::from_secs(60)),
        ] {
            let fresh = limiter.allow("reset_me", &limit).await.unwrap();
            assert!(fresh.allowed);
            assert!(!limiter.allow("reset_me", &limit).await.unwrap().allowed);

            limiter.reset("reset_me", &limit).await.unwrap();

            let again = limiter.allow("reset_me", &limit).await.unwrap();
            assert_eq!(again, fresh);
        }
    }

    #[tokio::test]
    async fn test_algorithms_do_not_share_state() {
        let (limiter, _) = test_limiter();
        let gcra = Limit::gcra(1, Duration::from_secs(60), 1);
        let window = Limit::sliding_window(1, Duration::from_secs(60));

        assert!(limiter.allow("shared", &gcra).await.unwrap().allowed);
        assert!(!limiter.allow("shared", &gcra).await.unwrap().allowed);

        let decision = limiter.allow("shared", &window).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.key, "limiter:sliding_window:shared");
    }

    #[tokio::test]
    async fn test_prefix_isolates_limiters() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock)));
        let a = Limiter::with_prefix(store.clone(), "a");
        let b = Limiter::with_prefix(store, "b");
        let limit = Limit::gcra(1, Duration::from_secs(60), 1);

        assert!(a.allow("user", &limit).await.unwrap().allowed);
        assert!(b.allow("user", &limit).await.unwrap().allowed);
        assert!(!a.allow("user", &limit).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_invalid_limit_fails_before_store_io() {
        let store = CannedStore::new(vec![]);
        let limiter = Limiter::new(store);
        let limit = Limit::gcra(10, Duration::ZERO, 10);

        assert_err!(limiter.allow("k", &limit).await);
        assert_err!(limiter.reset("k", &limit).await);
        assert_eq!(limiter.store().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_decode_error() {
        let limit = Limit::per_second(1);

        let short = Limiter::new(CannedStore::new(vec![Reply::Int(0)]));
        assert!(matches!(short.allow("k", &limit).await, Err(LimiterError::Decode(_))));

        let garbled = Limiter::new(CannedStore::new(vec![
            Reply::Int(0),
            Reply::Int(1),
            Reply::Text("-1".to_string()),
            Reply::Text("later".to_string()),
        ]));
        assert!(matches!(garbled.allow("k", &limit).await, Err(LimiterError::Decode(_))));

        let window = Limit::sliding_window(1, Duration::from_secs(1));
        let bad_flag = Limiter::new(CannedStore::new(vec![
            Reply::Int(2),
            Reply::Int(0),
            Reply::Text("-1".to_string()),
        ]));
        assert!(matches!(bad_flag.allow("k", &window).await, Err(LimiterError::Decode(_))));
    }

    #[tokio::test]
    async fn test_negative_wait_is_decode_error() {
        let limit = Limit::per_second(1);
        let corrupt = Limiter::new(CannedStore::new(vec![
            Reply::Int(1),
            Reply::Int(0),
            Reply::Text("-3600".to_string()),
            Reply::Text("1".to_string()),
        ]));
        assert!(matches!(corrupt.allow("k", &limit).await, Err(LimiterError::Decode(_))));

        let window = Limit::sliding_window(1, Duration::from_secs(1));
        let corrupt = Limiter::new(CannedStore::new(vec![
            Reply::Int(0),
            Reply::Int(0),
            Reply::Text("-3600".to_string()),
        ]));
        assert!(matches!(corrupt.allow("k", &window).await, Err(LimiterError::Decode(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_one() {
        for limit in [
            Limit::gcra(1, Duration::from_secs(60), 1),
            Limit::sliding_window(1, Duration::from_secs(60)),
        ] {
            let (limiter, _) = test_limiter();
            let limiter = Arc::new(limiter);

            let checks = (0..64).map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("contended", &limit).await })
            });
            let results = futures::future::join_all(checks).await;

            let admitted = results
                .into_iter()
                .map(|joined| joined.unwrap().unwrap())
                .filter(|decision| decision.allowed)
                .count();
            assert_eq!(admitted, 1, "{} admitted more than one", limit.algorithm);
        }
    }

    fn assert_close(redis: Option<Duration>, memory: Option<Duration>, what: &str) {
        match (redis, memory) {
            (None, None) => {}
            (Some(r), Some(m)) => {
                let drift = r.as_secs_f64() - m.as_secs_f64();
                assert!(drift.abs() < 0.5, "{} differs: redis {:?}, memory {:?}", what, r, m);
            }
            (r, m) => panic!("{} differs: redis {:?}, memory {:?}", what, r, m),
        }
    }

    #[tokio::test]
    #[ignore = "requires a redis server at REDIS_URL"]
    async fn test_redis_matches_memory_store() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let store = crate::store::RedisStore::connect(&url).await.unwrap();
        store.preload().await.unwrap();
        let redis = Limiter::with_prefix(store, "tollgate-test");
        let memory = Limiter::with_prefix(MemoryStore::new(), "tollgate-test");

        for limit in [
            Limit::gcra(10, Duration::from_secs(120), 10),
            Limit::gcra(1, Duration::from_secs(60), 1),
            Limit::sliding_window(3, Duration::from_secs(60)),
        ] {
            redis.reset("redis", &limit).await.unwrap();

            for step in 0..12 {
                let r = redis.allow("redis", &limit).await.unwrap();
                let m = memory.allow("redis", &limit).await.unwrap();
                let what = format!("{} step {}", limit.algorithm, step);

                assert_eq!(r.allowed, m.allowed, "{} allowed", what);
                assert_eq!(r.remaining, m.remaining, "{} remaining", what);
                assert_close(r.retry_after, m.retry_after, &format!("{} retry_after", what));
                assert_close(r.reset_after, m.reset_after, &format!("{} reset_after", what));
            }

            redis.reset("redis", &limit).await.unwrap();
            assert!(redis.allow("redis", &limit).await.unwrap().allowed);
            redis.reset("redis", &limit).await.unwrap();
            memory.reset("redis", &limit).await.unwrap();
        }
    }
}
