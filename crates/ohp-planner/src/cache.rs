//! Run-scoped memoization of discovery lookups.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use ohp_adapters::{DiscoveryClient, DiscoveryFailure};
use ohp_core::Season;
use tokio::sync::Mutex;
use tracing::debug;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    fetched_at: DateTime<Utc>,
}

/// Wraps a [`DiscoveryClient`] so each sport/league is listed at most once per TTL window.
///
/// Failures are never cached; a later lookup asks the site again.
pub struct DiscoveryCache {
    client: Arc<dyn DiscoveryClient>,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
    seasons: Mutex<HashMap<(String, String), Cached<BTreeSet<Season>>>>,
    markets: Mutex<HashMap<String, Cached<BTreeSet<String>>>>,
    leagues: Mutex<HashMap<String, Cached<BTreeSet<String>>>>,
    remote_calls: AtomicUsize,
}

impl DiscoveryCache {
    pub fn new(client: Arc<dyn DiscoveryClient>, clock: Arc<dyn Clock>, ttl: TimeDelta) -> Self {
        Self {
            client,
            clock,
            ttl,
            seasons: Mutex::new(HashMap::new()),
            markets: Mutex::new(HashMap::new()),
            leagues: Mutex::new(HashMap::new()),
            remote_calls: AtomicUsize::new(0),
        }
    }

    /// Number of lookups that actually reached the discovery client.
    pub fn remote_calls(&self) -> usize {
        self.remote_calls.load(Ordering::Relaxed)
    }

    pub async fn list_seasons(
        &self,
        sport: &str,
        league: &str,
    ) -> Result<BTreeSet<Season>, DiscoveryFailure> {
        let key = (sport.to_string(), league.to_string());
        self.lookup(&self.seasons, key, || self.client.list_seasons(sport, league))
            .await
    }

    pub async fn list_markets(&self, sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure> {
        self.lookup(&self.markets, sport.to_string(), || self.client.list_markets(sport))
            .await
    }

    pub async fn list_leagues(&self, sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure> {
        self.lookup(&self.leagues, sport.to_string(), || self.client.list_leagues(sport))
            .await
    }

    async fn lookup<K, T, F, Fut>(
        &self,
        entries: &Mutex<HashMap<K, Cached<T>>>,
        key: K,
        fetch: F,
    ) -> Result<T, DiscoveryFailure>
    where
        K: Eq + Hash + std::fmt::Debug,
        T: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DiscoveryFailure>>,
    {
        let now = self.clock.now();
        {
            let entries = entries.lock().await;
            if let Some(cached) = entries.get(&key) {
                if now - cached.fetched_at < self.ttl {
                    debug!(?key, "discovery cache hit");
                    return Ok(cached.value.clone());
                }
            }
        }

        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        let value = fetch().await?;
        let mut entries = entries.lock().await;
        entries.insert(
            key,
            Cached {
                value: value.clone(),
                fetched_at: self.clock.now(),
            },
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct CountingDiscovery {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl DiscoveryClient for CountingDiscovery {
        async fn list_seasons(
            &self,
            _sport: &str,
            league: &str,
        ) -> Result<BTreeSet<Season>, DiscoveryFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DiscoveryFailure::new(league, "archive page unavailable"));
            }
            Ok([Season::Single(2021), Season::Single(2023)].into_iter().collect())
        }

        async fn list_markets(&self, _sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(["1x2".to_string()].into_iter().collect())
        }

        async fn list_leagues(&self, _sport: &str) -> Result<BTreeSet<String>, DiscoveryFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BTreeSet::new())
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-16T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn cache(fail: bool) -> (Arc<CountingDiscovery>, Arc<ManualClock>, DiscoveryCache) {
        let client = Arc::new(CountingDiscovery {
            calls: AtomicUsize::new(0),
            fail,
        });
        let clock = Arc::new(ManualClock::new(start()));
        let cache = DiscoveryCache::new(client.clone(), clock.clone(), TimeDelta::minutes(30));
        (client, clock, cache)
    }

    #[tokio::test]
    async fn repeated_lookups_within_ttl_hit_the_site_once() {
        let (client, _clock, cache) = cache(false);
        for _ in 0..4 {
            let seasons = cache.list_seasons("football", "serie-a").await.unwrap();
            assert_eq!(seasons.len(), 2);
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.remote_calls(), 1);

        cache.list_seasons("football", "la-liga").await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_refreshed() {
        let (client, clock, cache) = cache(false);
        cache.list_markets("football").await.unwrap();
        clock.advance(TimeDelta::minutes(29));
        cache.list_markets("football").await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        clock.advance(TimeDelta::minutes(2));
        cache.list_markets("football").await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_remembered() {
        let (client, _clock, cache) = cache(true);
        assert!(cache.list_seasons("football", "serie-a").await.is_err());
        assert!(cache.list_seasons("football", "serie-a").await.is_err());
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }
}
