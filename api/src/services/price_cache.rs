use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use domain::PriceQuote;
use tokio::sync::RwLock;

use super::clock::Clock;

/// Expired entries stay readable through `last_known` for this many TTLs, then are evicted.
pub const STALE_RETENTION_TTLS: u32 = 12;

#[derive(Debug, Clone)]
pub struct PriceCacheEntry {
    pub token_id: String,
    pub price: f64,
    pub source: String,
    pub fetched_at: Instant,
    pub fetched_at_utc: DateTime<Utc>,
    pub ttl: Duration,
}

impl PriceCacheEntry {
    /// An entry is served strictly before `fetched_at + ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < self.ttl
    }

    pub fn to_quote(&self) -> PriceQuote {
        PriceQuote {
            token_id: self.token_id.clone(),
            price: self.price,
            source: self.source.clone(),
            fetched_at: self.fetched_at_utc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Fresh(PriceQuote),
    /// Present but past its ttl: the caller must refetch.
    StaleIgnored(PriceQuote),
    Miss,
}

pub struct PriceCache {
    entries: RwLock<HashMap<String, PriceCacheEntry>>,
    ttl: Duration,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl PriceCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            retention: ttl.saturating_mul(STALE_RETENTION_TTLS),
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn lookup(&self, token_id: &str) -> CacheLookup {
        let entries = self.entries.read().await;
        match entries.get(token_id) {
            Some(entry) if entry.is_fresh(self.clock.now()) => CacheLookup::Fresh(entry.to_quote()),
            Some(entry) => CacheLookup::StaleIgnored(entry.to_quote()),
            None => CacheLookup::Miss,
        }
    }

    pub async fn store(&self, token_id: &str, price: f64, source: &str) -> PriceQuote {
        let entry = PriceCacheEntry {
            token_id: token_id.to_string(),
            price,
            source: source.to_string(),
            fetched_at: self.clock.now(),
            fetched_at_utc: Utc::now(),
            ttl: self.ttl,
        };
        let quote = entry.to_quote();
        let mut entries = self.entries.write().await;
        let now = entry.fetched_at;
        let retention = self.retention;
        entries.retain(|_, old| now.saturating_duration_since(old.fetched_at) < retention);
        entries.insert(token_id.to_string(), entry);
        quote
    }

    /// Most recent price regardless of age.
    pub async fn last_known(&self, token_id: &str) -> Option<PriceQuote> {
        self.entries
            .read()
            .await
            .get(token_id)
            .map(PriceCacheEntry::to_quote)
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;

    #[tokio::test]
    async fn entry_expires_exactly_at_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = PriceCache::new(Duration::from_secs(60), clock.clone());
        cache.store("SOL", 150.0, "jupiter").await;

        clock.advance(Duration::from_secs(59));
        assert!(matches!(cache.lookup("SOL").await, CacheLookup::Fresh(q) if q.price == 150.0));

        clock.advance(Duration::from_secs(1));
        assert!(matches!(cache.lookup("SOL").await, CacheLookup::StaleIgnored(_)));
        assert_eq!(cache.last_known("SOL").await.map(|q| q.price), Some(150.0));
    }

    #[tokio::test]
    async fn store_refreshes_entry() {
        let clock = Arc::new(ManualClock::new());
        let cache = PriceCache::new(Duration::from_secs(10), clock.clone());
        cache.store("SOL", 1.0, "a").await;
        clock.advance(Duration::from_secs(11));
        cache.store("SOL", 2.0, "b").await;
        match cache.lookup("SOL").await {
            CacheLookup::Fresh(quote) => {
                assert_eq!(quote.price, 2.0);
                assert_eq!(quote.source, "b");
            }
            other => panic!("expected fresh entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn long_expired_entries_are_evicted_on_store() {
        let clock = Arc::new(ManualClock::new());
        let ttl = Duration::from_secs(10);
        let cache = PriceCache::new(ttl, clock.clone());
        cache.store("OLD", 1.0, "s").await;

        clock.advance(ttl * (STALE_RETENTION_TTLS - 1));
        cache.store("MID", 2.0, "s").await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.last_known("OLD").await.is_some());

        clock.advance(ttl);
        cache.store("NEW", 3.0, "s").await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.last_known("OLD").await, None);
        assert_eq!(cache.last_known("MID").await.map(|q| q.price), Some(2.0));
    }

    #[tokio::test]
    async fn clear_empties_cache() {
        let cache = PriceCache::new(Duration::from_secs(10), Arc::new(ManualClock::new()));
        cache.store("A", 1.0, "s").await;
        assert_eq!(cache.len().await, 1);
        cache.clear().await;
        assert_eq!(cache.lookup("A").await, CacheLookup::Miss);
    }
}
