pub mod circuit_breaker;
pub mod clock;
pub mod price_cache;
pub mod price_fetcher;
pub mod price_sources;
pub mod risk_monitor;
pub mod wallet;

pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitBreakerConfig};
pub use clock::{Clock, ManualClock, SystemClock};
pub use price_cache::{CacheLookup, PriceCache, PriceCacheEntry};
pub use price_fetcher::{FetchError, PriceFetcher, PriceFetcherConfig, SourceAttempt};
pub use price_sources::{
    BirdeyeSource, CoingeckoSource, JupiterSource, PriceSource, SourceError, StaticPriceSource,
};
pub use risk_monitor::{CycleReport, MonitorSettings, PriceRefresher, RiskMonitor};
pub use wallet::BirdeyeWalletProvider;
