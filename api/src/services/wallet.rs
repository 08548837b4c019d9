use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use domain::{TokenBalance, WalletSnapshot};
use indexer::WalletProvider;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

/// Wallet balances from Birdeye's token list endpoint.
#[derive(Clone)]
pub struct BirdeyeWalletProvider {
    client: Client,
    api_base: String,
    api_key: String,
    wallet: String,
}

impl BirdeyeWalletProvider {
    pub fn new(client: Client, api_base: String, api_key: String, wallet: String) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            wallet,
        }
    }
}

/// Reads `data.items[]` entries of `{address, uiAmount, valueUsd}`; items without an
/// address or amount are skipped.
pub fn parse_wallet_tokens(body: &Value) -> Result<Vec<TokenBalance>> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(anyhow!("birdeye wallet request unsuccessful"));
    }
    let items = body
        .pointer("/data/items")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("birdeye wallet response missing data.items"))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let token_id = item.get("address")?.as_str()?.trim();
            let amount = item.get("uiAmount")?.as_f64()?;
            if token_id.is_empty() {
                return None;
            }
            Some(TokenBalance {
                token_id: token_id.to_string(),
                amount,
                usd_value: item.get("valueUsd").and_then(Value::as_f64),
            })
        })
        .collect())
}

#[async_trait]
impl WalletProvider for BirdeyeWalletProvider {
    async fn snapshot(&self) -> Result<WalletSnapshot> {
        let url = format!("{}/v1/wallet/token_list", self.api_base);
        let body: Value = self
            .client
            .get(url)
            .header("X-API-KEY", &self.api_key)
            .header("x-chain", "solana")
            .query(&[("wallet", self.wallet.as_str())])
            .send()
            .await
            .context("birdeye wallet request failed")?
            .error_for_status()
            .context("birdeye wallet request rejected")?
            .json()
            .await
            .context("birdeye wallet response was not json")?;
        let balances = parse_wallet_tokens(&body)?;
        debug!(wallet = %self.wallet, tokens = balances.len(), "wallet balances loaded");
        Ok(WalletSnapshot::new(Some(self.wallet.clone()), balances))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_token_list() {
        let body = json!({
            "success": true,
            "data": {
                "wallet": "W",
                "totalUsd": 130.0,
                "items": [
                    {
                        "address": "So11111111111111111111111111111111111111112",
                        "uiAmount": 0.5,
                        "valueUsd": 75.0
                    },
                    {"address": "BONK", "uiAmount": 1000000.0},
                    {"address": "", "uiAmount": 3.0},
                    {"symbol": "NOADDR", "uiAmount": 1.0}
                ]
            }
        });
        let balances = parse_wallet_tokens(&body).unwrap();
        assert_eq!(balances.len(), 2);
        assert_eq!(balances[0].usd_value, Some(75.0));
        assert_eq!(balances[1].token_id, "BONK");
        assert_eq!(balances[1].usd_value, None);
    }

    #[test]
    fn rejects_unsuccessful_response() {
        let body = json!({"success": false, "message": "Unauthorized"});
        assert!(parse_wallet_tokens(&body).is_err());
        assert!(parse_wallet_tokens(&json!({"data": {}})).is_err());
    }
}
