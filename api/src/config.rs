use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::{env, time::Duration};

use anyhow::{Context, Result};
use domain::{LimitBasis, RiskLimit};
use indexer::MonitorLists;
use risk_engine::RiskLimits;

use crate::services::{CircuitBreakerConfig, MonitorSettings, PriceFetcherConfig};

const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";
const NATIVE_SOL_MINT: &str = "So11111111111111111111111111111111111111111";

#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Source ids in priority order.
    pub order: Vec<String>,
    pub birdeye_api_key: Option<String>,
    pub birdeye_api_base: String,
    pub jupiter_api_base: String,
    pub coingecko_api_base: String,
    /// token -> coingecko coin id
    pub coingecko_ids: HashMap<String, String>,
    pub static_prices: HashMap<String, f64>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub frontend_origins: Vec<String>,
    pub monitor_lists: MonitorLists,
    pub dynamic_mode: bool,
    pub wallet_address: Option<String>,
    /// Fixed balances used when no wallet API is available.
    pub wallet_balances: BTreeMap<String, f64>,
    pub sources: SourceSettings,
    pub fetcher: PriceFetcherConfig,
    pub risk_limits: RiskLimits,
    pub monitor: MonitorSettings,
    pub enable_risk_monitor: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let excluded_tokens = env::var("EXCLUDED_TOKENS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|_| {
                vec![
                    USDC_MINT.to_string(),
                    WRAPPED_SOL_MINT.to_string(),
                    NATIVE_SOL_MINT.to_string(),
                ]
            });
        let monitor_lists = MonitorLists {
            monitored_tokens: parse_list("MONITORED_TOKENS"),
            dca_tokens: parse_list("DCA_MONITORED_TOKENS"),
            token_map: parse_pairs("TOKEN_MAP", ':').into_iter().collect(),
            exchange_pairs: parse_pairs("EXCHANGE_PAIRS", '=').into_iter().collect(),
            excluded_tokens,
        };

        let cooldown_base = parse_duration_seconds("BREAKER_COOLDOWN_BASE_SECS", 30);
        let fetcher = PriceFetcherConfig {
            cache_ttl: parse_duration_seconds("PRICE_CACHE_TTL_SECS", 300),
            request_timeout: parse_duration_seconds("PRICE_REQUEST_TIMEOUT_SECS", 10),
            breaker: CircuitBreakerConfig {
                failure_threshold: parse_positive("BREAKER_FAILURE_THRESHOLD", 5u32),
                cooldown_base,
                cooldown_max: parse_duration_seconds("BREAKER_COOLDOWN_MAX_SECS", 900)
                    .max(cooldown_base),
            },
        };

        let sources = SourceSettings {
            order: env::var("PRICE_SOURCES")
                .map(|raw| split_list(&raw))
                .unwrap_or_else(|_| {
                    ["birdeye", "jupiter", "coingecko", "static"]
                        .map(String::from)
                        .to_vec()
                })
                .into_iter()
                .map(|id| id.to_lowercase())
                .collect(),
            birdeye_api_key: env::var("BIRDEYE_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            birdeye_api_base: env::var("BIRDEYE_API_BASE")
                .unwrap_or_else(|_| "https://public-api.birdeye.so".to_string()),
            jupiter_api_base: env::var("JUPITER_API_BASE")
                .unwrap_or_else(|_| "https://api.jup.ag".to_string()),
            coingecko_api_base: env::var("COINGECKO_API_BASE")
                .unwrap_or_else(|_| "https://api.coingecko.com/api/v3".to_string()),
            coingecko_ids: parse_pairs("TOKEN_PRICE_IDS", ':').into_iter().collect(),
            static_prices: parse_amounts("STATIC_TOKEN_PRICES").into_iter().collect(),
        };

        let default_limit = if parse_bool("USE_PERCENTAGE", true) {
            RiskLimit::percentage(
                parse_f64("MAX_LOSS_PERCENT", 20.0),
                parse_f64("MAX_GAIN_PERCENT", 50.0),
            )
        } else {
            RiskLimit::absolute(
                parse_f64("MAX_LOSS_USD", 25.0),
                parse_f64("MAX_GAIN_USD", 25.0),
            )
        };
        let default_basis = default_limit.basis;
        let mut risk_limits = RiskLimits::new(default_limit)
            .with_minimum_balance(parse_f64("MINIMUM_BALANCE_USD", 100.0))
            .with_ai_confirmation(parse_bool("USE_AI_CONFIRMATION", false));
        if let Ok(raw) = env::var("TOKEN_RISK_LIMITS") {
            for limit in parse_token_limits(&raw, default_basis) {
                risk_limits = risk_limits.with_limit(limit);
            }
        }

        let monitor = MonitorSettings {
            interval: parse_duration_seconds("RISK_CHECK_INTERVAL_SECS", 600),
            balance_log_interval: parse_duration_seconds("BALANCE_LOG_INTERVAL_SECS", 86_400),
            action_cooldown: parse_duration_seconds("ACTION_COOLDOWN_SECS", 900),
            max_concurrency: parse_positive("MONITOR_MAX_CONCURRENCY", 4usize),
        };

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8081".to_string())
                .parse()
                .context("PORT must be a valid u16")?,
            database_url: env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            frontend_origins: parse_origins(),
            monitor_lists,
            dynamic_mode: parse_bool("DYNAMIC_MODE", false),
            wallet_address: env::var("WALLET_ADDRESS")
                .ok()
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty()),
            wallet_balances: parse_amounts("WALLET_BALANCES").into_iter().collect(),
            sources,
            fetcher,
            risk_limits,
            monitor,
            enable_risk_monitor: parse_bool("ENABLE_RISK_MONITOR", true),
        })
    }
}

fn parse_origins() -> Vec<String> {
    match env::var("FRONTEND_ORIGINS") {
        Ok(list) => split_list(&list),
        Err(_) => vec!["http://localhost:3000".to_string()],
    }
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn parse_list(key: &str) -> Vec<String> {
    env::var(key).map(|raw| split_list(&raw)).unwrap_or_default()
}

/// `key<sep>value` entries separated by commas; blank keys or values are dropped.
fn split_pairs(raw: &str, separator: char) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|item| {
            let (key, value) = item.split_once(separator)?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_pairs(key: &str, separator: char) -> Vec<(String, String)> {
    env::var(key)
        .map(|raw| split_pairs(&raw, separator))
        .unwrap_or_default()
}

fn split_amounts(raw: &str) -> Vec<(String, f64)> {
    split_pairs(raw, '=')
        .into_iter()
        .filter_map(|(token, value)| {
            let amount = value.parse::<f64>().ok().filter(|v| v.is_finite())?;
            Some((token, amount))
        })
        .collect()
}

fn parse_amounts(key: &str) -> Vec<(String, f64)> {
    env::var(key)
        .map(|raw| split_amounts(&raw))
        .unwrap_or_default()
}

/// `token:max_loss:max_gain[:pct|usd]` entries; the basis defaults to the global one.
fn parse_token_limits(raw: &str, default_basis: LimitBasis) -> Vec<RiskLimit> {
    raw.split(',')
        .filter_map(|item| {
            let parts: Vec<_> = item.trim().split(':').map(str::trim).collect();
            if parts.len() < 3 || parts[0].is_empty() {
                return None;
            }
            let max_loss = parts[1].parse::<f64>().ok()?;
            let max_gain = parts[2].parse::<f64>().ok()?;
            let basis = match parts.get(3) {
                Some(raw) => LimitBasis::parse(raw)?,
                None => default_basis,
            };
            Some(RiskLimit {
                token_id: Some(parts[0].to_string()),
                max_loss,
                max_gain,
                basis,
            })
        })
        .collect()
}

fn parse_duration_seconds(key: &str, default: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

fn parse_positive<T: FromStr + PartialOrd + Default>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| positive(&v))
        .unwrap_or(default)
}

/// Out-of-range values are rejected rather than truncated.
fn positive<T: FromStr + PartialOrd + Default>(raw: &str) -> Option<T> {
    raw.trim().parse::<T>().ok().filter(|value| *value > T::default())
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_skip_blank_entries() {
        assert_eq!(split_list(" a, ,b,, c "), vec!["a", "b", "c"]);
    }

    #[test]
    fn pairs_use_the_given_separator() {
        assert_eq!(
            split_pairs("mintA:BONK, mintB : WIF ,broken,:x", ':'),
            vec![
                ("mintA".to_string(), "BONK".to_string()),
                ("mintB".to_string(), "WIF".to_string())
            ]
        );
        assert_eq!(
            split_amounts("a=1.5,b=oops,c=2"),
            vec![("a".to_string(), 1.5), ("c".to_string(), 2.0)]
        );
    }

    #[test]
    fn token_limits_accept_optional_basis() {
        let limits = parse_token_limits(
            "AAA:10:30:usd, BBB:5:15, CCC:x:1, DDD:1:2:weird",
            LimitBasis::Percentage,
        );
        assert_eq!(limits.len(), 2);
        assert_eq!(limits[0].token_id.as_deref(), Some("AAA"));
        assert_eq!(limits[0].basis, LimitBasis::Absolute);
        assert_eq!(limits[1].basis, LimitBasis::Percentage);
        assert_eq!(limits[1].max_gain, 15.0);
    }

    #[test]
    fn counts_must_be_positive_and_in_range() {
        assert_eq!(positive::<u32>(" 7 "), Some(7));
        assert_eq!(positive::<u32>("0"), None);
        assert_eq!(positive::<u32>("4294967296"), None);
        assert_eq!(positive::<usize>("-1"), None);
    }
}
