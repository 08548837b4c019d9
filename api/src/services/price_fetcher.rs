//! Tiered price lookup: TTL cache first, then each source in priority order behind its
//! own circuit breaker. Concurrent lookups of one token share a single upstream fetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use domain::{PriceQuote, SourceHealthView};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::clock::Clock;
use super::price_cache::{CacheLookup, PriceCache};
use super::price_sources::{PriceSource, SourceError};

#[derive(Debug, Clone)]
pub struct PriceFetcherConfig {
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for PriceFetcherConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceAttempt {
    pub source: String,
    pub error: SourceError,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("no price source available for {token}")]
    NoSourceAvailable {
        token: String,
        attempts: Vec<SourceAttempt>,
    },
    #[error("price fetch for {token} aborted: {reason}")]
    Aborted { token: String, reason: String },
}

type SharedFetch = Shared<BoxFuture<'static, Result<PriceQuote, FetchError>>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

struct SourceSlot {
    source: Arc<dyn PriceSource>,
    breaker: Arc<CircuitBreaker>,
}

struct Inner {
    sources: Vec<SourceSlot>,
    cache: PriceCache,
    request_timeout: Duration,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_fetch_id: AtomicU64,
}

#[derive(Clone)]
pub struct PriceFetcher {
    inner: Arc<Inner>,
}

impl PriceFetcher {
    pub fn new(
        sources: Vec<Arc<dyn PriceSource>>,
        config: PriceFetcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sources = sources
            .into_iter()
            .map(|source| SourceSlot {
                breaker: Arc::new(CircuitBreaker::new(
                    source.id(),
                    config.breaker.clone(),
                    Arc::clone(&clock),
                )),
                source,
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                sources,
                cache: PriceCache::new(config.cache_ttl, clock),
                request_timeout: config.request_timeout,
                in_flight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
            }),
        }
    }

    pub async fn get_price(&self, token_id: &str) -> Result<PriceQuote, FetchError> {
        match self.inner.cache.lookup(token_id).await {
            CacheLookup::Fresh(quote) => {
                metrics::counter!("price_cache_hits_total").increment(1);
                return Ok(quote);
            }
            CacheLookup::StaleIgnored(stale) => {
                debug!(
                    token = %token_id,
                    source = %stale.source,
                    "cached price expired, refetching"
                );
            }
            CacheLookup::Miss => {}
        }
        metrics::counter!("price_cache_misses_total").increment(1);
        self.join_or_start(token_id).await
    }

    /// Bypasses the cache; still coalesced with any fetch already in flight.
    pub async fn get_price_fresh(&self, token_id: &str) -> Result<PriceQuote, FetchError> {
        self.join_or_start(token_id).await
    }

    /// Most recent cached quote, even if expired.
    pub async fn last_known_price(&self, token_id: &str) -> Option<PriceQuote> {
        self.inner.cache.last_known(token_id).await
    }

    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await;
    }

    pub async fn cache_len(&self) -> usize {
        self.inner.cache.len().await
    }

    pub fn cache_ttl(&self) -> Duration {
        self.inner.cache.ttl()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.inner
            .sources
            .iter()
            .map(|slot| slot.source.id().to_string())
            .collect()
    }

    pub fn source_health(&self) -> Vec<SourceHealthView> {
        self.inner
            .sources
            .iter()
            .map(|slot| slot.breaker.view())
            .collect()
    }

    fn join_or_start(&self, token_id: &str) -> SharedFetch {
        let mut table = self.inner.lock_in_flight();
        if let Some(existing) = table.get(token_id) {
            debug!(token = %token_id, "joining in-flight price fetch");
            return existing.fetch.clone();
        }

        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            token_id: token_id.to_string(),
            id,
        };
        // Runs to completion even if every caller goes away.
        let handle = tokio::spawn(async move {
            let result = guard.inner.fetch_from_sources(&guard.token_id).await;
            drop(guard);
            result
        });
        let token = token_id.to_string();
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(FetchError::Aborted {
                    token,
                    reason: err.to_string(),
                }),
            }
        }
        .boxed()
        .shared();
        table.insert(
            token_id.to_string(),
            InFlight {
                id,
                fetch: fetch.clone(),
            },
        );
        fetch
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn fetch_from_sources(&self, token_id: &str) -> Result<PriceQuote, FetchError> {
        let mut attempts = Vec::new();
        for slot in &self.sources {
            let source_id = slot.source.id();
            let permit = match slot.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(retry_in) => {
                    debug!(source = %source_id, token = %token_id, "source skipped, circuit open");
                    attempts.push(SourceAttempt {
                        source: source_id.to_string(),
                        error: SourceError::CircuitOpen {
                            retry_in_ms: retry_in.as_millis() as u64,
                        },
                    });
                    continue;
                }
            };

            metrics::counter!("price_source_requests_total", "source" => source_id.to_string())
                .increment(1);
            let call = timeout(self.request_timeout, slot.source.fetch_price(token_id));
            let outcome = match call.await {
                Ok(Ok(price)) if price.is_finite() && price > 0.0 => Ok(price),
                Ok(Ok(price)) => Err(SourceError::Malformed(format!("unusable price {price}"))),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(SourceError::Timeout),
            };

            match outcome {
                Ok(price) => {
                    permit.succeed();
                    debug!(source = %source_id, token = %token_id, price, "price fetched");
                    return Ok(self.cache.store(token_id, price, source_id).await);
                }
                // The source answered; it just does not list this token.
                Err(SourceError::Unsupported) => {
                    permit.succeed();
                    attempts.push(SourceAttempt {
                        source: source_id.to_string(),
                        error: SourceError::Unsupported,
                    });
                }
                Err(error) => {
                    let opened = permit.fail();
                    metrics::counter!(
                        "price_source_failures_total",
                        "source" => source_id.to_string(),
                        "kind" => error.kind()
                    )
                    .increment(1);
                    warn!(
                        source = %source_id,
                        token = %token_id,
                        error = %error,
                        circuit_opened = opened,
                        "price source failed"
                    );
                    attempts.push(SourceAttempt {
                        source: source_id.to_string(),
                        error,
                    });
                }
            }
        }

        metrics::counter!("price_fetch_exhausted_total").increment(1);
        warn!(token = %token_id, attempts = attempts.len(), "no price source available");
        Err(FetchError::NoSourceAvailable {
            token: token_id.to_string(),
            attempts,
        })
    }
}

/// Removes the in-flight entry it was created for, including when the fetch task panics.
struct InFlightGuard {
    inner: Arc<Inner>,
    token_id: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut table = self.inner.lock_in_flight();
        if table.get(&self.token_id).map(|entry| entry.id) == Some(self.id) {
            table.remove(&self.token_id);
        }
    }
}
