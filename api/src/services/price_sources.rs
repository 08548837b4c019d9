use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SourceError {
    #[error("request timed out")]
    Timeout,
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("token not supported by this source")]
    Unsupported,
    #[error("circuit open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Timeout => "timeout",
            SourceError::Status(_) => "status",
            SourceError::Malformed(_) => "malformed",
            SourceError::Transport(_) => "transport",
            SourceError::Unsupported => "unsupported",
            SourceError::CircuitOpen { .. } => "circuit_open",
        }
    }
}

/// One upstream able to price a token in USD.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn id(&self) -> &str;
    async fn fetch_price(&self, token_id: &str) -> Result<f64, SourceError>;
}

async fn get_json(request: RequestBuilder) -> Result<Value, SourceError> {
    let resp = request.send().await.map_err(|err| {
        if err.is_timeout() {
            SourceError::Timeout
        } else {
            SourceError::Transport(err.to_string())
        }
    })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SourceError::Status(status.as_u16()));
    }
    resp.json::<Value>().await.map_err(|err| {
        if err.is_timeout() {
            SourceError::Timeout
        } else {
            SourceError::Malformed(err.to_string())
        }
    })
}

/// Accepts JSON numbers and numeric strings; rejects non-positive values.
fn price_value(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (price.is_finite() && price > 0.0).then_some(price)
}

#[derive(Clone)]
pub struct BirdeyeSource {
    client: Client,
    api_base: String,
    api_key: String,
}

impl BirdeyeSource {
    pub fn new(client: Client, api_base: String, api_key: String) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

pub fn parse_birdeye_price(body: &Value) -> Result<f64, SourceError> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(SourceError::Malformed("birdeye success=false".into()));
    }
    let data = body
        .get("data")
        .ok_or_else(|| SourceError::Malformed("birdeye response missing data".into()))?;
    let value = match data {
        Value::Object(map) => map.get("value").unwrap_or(&Value::Null),
        other => other,
    };
    // Unlisted tokens come back as `data: null` or `value: null`.
    if value.is_null() {
        return Err(SourceError::Unsupported);
    }
    price_value(value).ok_or_else(|| SourceError::Malformed("birdeye price missing".into()))
}

#[async_trait]
impl PriceSource for BirdeyeSource {
    fn id(&self) -> &str {
        "birdeye"
    }

    async fn fetch_price(&self, token_id: &str) -> Result<f64, SourceError> {
        let url = format!("{}/defi/price", self.api_base);
        let body = get_json(
            self.client
                .get(url)
                .header("X-API-KEY", &self.api_key)
                .header("x-chain", "solana")
                .query(&[("address", token_id)]),
        )
        .await?;
        parse_birdeye_price(&body)
    }
}

#[derive(Clone)]
pub struct JupiterSource {
    client: Client,
    api_base: String,
}

impl JupiterSource {
    pub fn new(client: Client, api_base: String) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

pub fn parse_jupiter_price(body: &Value, token_id: &str) -> Result<f64, SourceError> {
    let data = body
        .get("data")
        .ok_or_else(|| SourceError::Malformed("jupiter response missing data".into()))?;
    match data.get(token_id) {
        None | Some(Value::Null) => Err(SourceError::Unsupported),
        Some(entry) => entry
            .get("price")
            .and_then(price_value)
            .ok_or_else(|| SourceError::Malformed(format!("jupiter price missing for {token_id}"))),
    }
}

#[async_trait]
impl PriceSource for JupiterSource {
    fn id(&self) -> &str {
        "jupiter"
    }

    async fn fetch_price(&self, token_id: &str) -> Result<f64, SourceError> {
        let url = format!("{}/price/v2", self.api_base);
        let body = get_json(self.client.get(url).query(&[("ids", token_id)])).await?;
        parse_jupiter_price(&body, token_id)
    }
}

#[derive(Clone)]
pub struct CoingeckoSource {
    client: Client,
    api_base: String,
    platform: String,
    /// token -> coingecko coin id, for tokens priced by id rather than contract.
    ids: HashMap<String, String>,
}

impl CoingeckoSource {
    pub fn new(client: Client, api_base: String, ids: HashMap<String, String>) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            platform: "solana".to_string(),
            ids,
        }
    }
}

/// Reads `body[key].usd`, trying the key as given and lowercased.
pub fn parse_coingecko_price(body: &Value, key: &str) -> Result<f64, SourceError> {
    let entry = body
        .get(key)
        .or_else(|| body.get(key.to_lowercase()))
        .ok_or(SourceError::Unsupported)?;
    entry
        .get("usd")
        .and_then(price_value)
        .ok_or_else(|| SourceError::Malformed(format!("coingecko usd price missing for {key}")))
}

#[async_trait]
impl PriceSource for CoingeckoSource {
    fn id(&self) -> &str {
        "coingecko"
    }

    async fn fetch_price(&self, token_id: &str) -> Result<f64, SourceError> {
        if let Some(id) = self.ids.get(token_id) {
            let url = format!("{}/simple/price", self.api_base);
            let body = get_json(
                self.client
                    .get(url)
                    .query(&[("ids", id.as_str()), ("vs_currencies", "usd")]),
            )
            .await?;
            return parse_coingecko_price(&body, id);
        }
        let url = format!("{}/simple/token_price/{}", self.api_base, self.platform);
        let body = get_json(
            self.client
                .get(url)
                .query(&[("contract_addresses", token_id), ("vs_currencies", "usd")]),
        )
        .await?;
        parse_coingecko_price(&body, token_id)
    }
}

/// Fixed prices from configuration, typically stablecoins. Last in the chain.
#[derive(Clone, Default)]
pub struct StaticPriceSource {
    prices: HashMap<String, f64>,
}

impl StaticPriceSource {
    pub fn new(prices: HashMap<String, f64>) -> Self {
        Self { prices }
    }
}

#[async_trait]
impl PriceSource for StaticPriceSource {
    fn id(&self) -> &str {
        "static"
    }

    async fn fetch_price(&self, token_id: &str) -> Result<f64, SourceError> {
        self.prices
            .get(token_id)
            .copied()
            .ok_or(SourceError::Unsupported)
    }
}
