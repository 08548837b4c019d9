use std::sync::Arc;

use crate::{
    app::get_prometheus_handle,
    config::AppConfig,
    repositories::{InMemoryPositionRepository, PositionRepository, PostgresPositionRepository},
    services::{
        BirdeyeSource, BirdeyeWalletProvider, CoingeckoSource, JupiterSource, PriceFetcher,
        PriceRefresher, PriceSource, RiskMonitor, StaticPriceSource, SystemClock,
    },
    state::AppState,
};
use action_engine::{LoggingExecutor, RecordingExecutor};
use anyhow::{bail, Context, Result};
use indexer::{MonitorSetBuilder, StaticWalletProvider, WalletProvider};
use reqwest::Client;
use risk_engine::ThresholdEvaluator;
use sqlx::PgPool;
use tracing::{info, warn};

const ACTION_HISTORY: usize = 100;

pub async fn build_state(config: &AppConfig) -> Result<AppState> {
    let positions = build_positions(config).await?;
    let client = Client::builder()
        .timeout(config.fetcher.request_timeout)
        .build()
        .context("failed to build http client")?;

    let sources = build_sources(config, &client);
    if sources.is_empty() {
        bail!("no usable price sources in PRICE_SOURCES");
    }
    let fetcher = PriceFetcher::new(sources, config.fetcher.clone(), Arc::new(SystemClock));
    info!(sources = ?fetcher.source_ids(), "price fetcher ready");

    let balances = build_wallet_provider(config, &client);
    let set_builder = if config.dynamic_mode {
        if balances.is_none() {
            warn!("DYNAMIC_MODE set but no wallet source configured, monitoring static lists");
        }
        MonitorSetBuilder::new(config.monitor_lists.clone(), balances.clone())
    } else {
        MonitorSetBuilder::new(config.monitor_lists.clone(), None)
    };

    let evaluator = Arc::new(ThresholdEvaluator::new(config.risk_limits.clone()));
    let actions = Arc::new(RecordingExecutor::new(
        Arc::new(LoggingExecutor),
        ACTION_HISTORY,
    ));
    let mut monitor = RiskMonitor::new(
        set_builder.clone(),
        fetcher.clone(),
        evaluator.clone(),
        actions.clone(),
        positions.clone(),
        config.monitor.clone(),
    );
    if let Some(provider) = balances {
        monitor = monitor.with_balance_provider(provider);
    }

    Ok(AppState {
        config: config.clone(),
        fetcher,
        set_builder,
        evaluator,
        actions,
        positions,
        monitor: Arc::new(monitor),
    })
}

/// Starts the risk monitor and the cache refresher when enabled.
pub fn spawn_workers(state: &AppState) {
    if !state.config.enable_risk_monitor {
        info!("risk monitor disabled");
        return;
    }
    // The first cycle runs immediately; its metrics need the recorder in place.
    get_prometheus_handle();
    state.monitor.clone().spawn();
    let refresher = Arc::new(PriceRefresher::new(
        state.fetcher.clone(),
        state.set_builder.clone(),
        state.config.fetcher.cache_ttl,
    ));
    refresher.spawn();
}

async fn build_positions(config: &AppConfig) -> Result<Arc<dyn PositionRepository>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            sqlx::migrate!("../migrations").run(&pool).await?;
            Ok(Arc::new(PostgresPositionRepository::new(pool)))
        }
        None => {
            info!("DATABASE_URL not set, keeping positions in memory");
            Ok(Arc::new(InMemoryPositionRepository::default()))
        }
    }
}

pub fn build_sources(config: &AppConfig, client: &Client) -> Vec<Arc<dyn PriceSource>> {
    let settings = &config.sources;
    let mut sources: Vec<Arc<dyn PriceSource>> = Vec::with_capacity(settings.order.len());
    for id in &settings.order {
        match id.as_str() {
            "birdeye" => match &settings.birdeye_api_key {
                Some(key) => sources.push(Arc::new(BirdeyeSource::new(
                    client.clone(),
                    settings.birdeye_api_base.clone(),
                    key.clone(),
                ))),
                None => warn!("BIRDEYE_API_KEY missing, birdeye source disabled"),
            },
            "jupiter" => sources.push(Arc::new(JupiterSource::new(
                client.clone(),
                settings.jupiter_api_base.clone(),
            ))),
            "coingecko" => sources.push(Arc::new(CoingeckoSource::new(
                client.clone(),
                settings.coingecko_api_base.clone(),
                settings.coingecko_ids.clone(),
            ))),
            "static" => sources.push(Arc::new(StaticPriceSource::new(
                settings.static_prices.clone(),
            ))),
            other => warn!(source = %other, "unknown price source ignored"),
        }
    }
    sources
}

/// Birdeye when a wallet and api key are configured, otherwise configured balances.
pub fn build_wallet_provider(
    config: &AppConfig,
    client: &Client,
) -> Option<Arc<dyn WalletProvider>> {
    match (&config.wallet_address, &config.sources.birdeye_api_key) {
        (Some(wallet), Some(key)) => Some(Arc::new(BirdeyeWalletProvider::new(
            client.clone(),
            config.sources.birdeye_api_base.clone(),
            key.clone(),
            wallet.clone(),
        ))),
        _ if !config.wallet_balances.is_empty() => Some(Arc::new(StaticWalletProvider::new(
            config.wallet_address.clone(),
            config.wallet_balances.clone(),
        ))),
        _ => None,
    }
}
