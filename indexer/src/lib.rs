use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use domain::{TokenBalance, TokenId, WalletSnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Source of current wallet balances.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    async fn snapshot(&self) -> Result<WalletSnapshot>;
}

/// Balances fixed at construction, e.g. from configuration.
#[derive(Clone, Default)]
pub struct StaticWalletProvider {
    wallet: Option<String>,
    balances: Vec<TokenBalance>,
}

impl StaticWalletProvider {
    pub fn new(wallet: Option<String>, balances: BTreeMap<TokenId, f64>) -> Self {
        Self {
            wallet,
            balances: balances
                .into_iter()
                .map(|(token_id, amount)| TokenBalance {
                    token_id,
                    amount,
                    usd_value: None,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl WalletProvider for StaticWalletProvider {
    async fn snapshot(&self) -> Result<WalletSnapshot> {
        Ok(WalletSnapshot::new(self.wallet.clone(), self.balances.clone()))
    }
}

/// Configured token lists feeding the monitoring set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorLists {
    pub monitored_tokens: Vec<TokenId>,
    pub dca_tokens: Vec<TokenId>,
    /// token -> display symbol
    pub token_map: BTreeMap<TokenId, String>,
    /// token -> exchange symbol
    pub exchange_pairs: BTreeMap<TokenId, String>,
    pub excluded_tokens: Vec<TokenId>,
}

/// Union of every configured list plus the held wallet tokens, exclusions removed last.
pub fn build_monitor_set(
    lists: &MonitorLists,
    wallet: Option<&WalletSnapshot>,
) -> BTreeSet<TokenId> {
    let mut tokens: BTreeSet<TokenId> = BTreeSet::new();
    let configured = lists
        .monitored_tokens
        .iter()
        .chain(lists.dca_tokens.iter())
        .chain(lists.token_map.keys())
        .chain(lists.exchange_pairs.keys());
    for token in configured {
        insert_trimmed(&mut tokens, token);
    }

    if let Some(snapshot) = wallet {
        for balance in snapshot.balances.iter().filter(|b| b.amount > 0.0) {
            insert_trimmed(&mut tokens, &balance.token_id);
        }
    }

    for excluded in &lists.excluded_tokens {
        tokens.remove(excluded.trim());
    }
    tokens
}

fn insert_trimmed(tokens: &mut BTreeSet<TokenId>, token: &str) {
    let trimmed = token.trim();
    if !trimmed.is_empty() {
        tokens.insert(trimmed.to_string());
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSet {
    pub tokens: BTreeSet<TokenId>,
    /// Snapshot the set was built from; present only in dynamic mode.
    pub snapshot: Option<WalletSnapshot>,
}

/// Builds the monitoring set each cycle. Dynamic mode is simply the presence of a wallet provider.
#[derive(Clone)]
pub struct MonitorSetBuilder {
    lists: MonitorLists,
    wallet: Option<Arc<dyn WalletProvider>>,
}

impl MonitorSetBuilder {
    pub fn new(lists: MonitorLists, wallet: Option<Arc<dyn WalletProvider>>) -> Self {
        Self { lists, wallet }
    }

    pub fn lists(&self) -> &MonitorLists {
        &self.lists
    }

    pub fn is_dynamic(&self) -> bool {
        self.wallet.is_some()
    }

    pub async fn build(&self) -> MonitorSet {
        let snapshot = match &self.wallet {
            Some(provider) => match provider.snapshot().await {
                Ok(snapshot) => {
                    debug!(held = snapshot.balances.len(), "wallet snapshot loaded");
                    Some(snapshot)
                }
                Err(err) => {
                    // Fall back to the configured lists for this cycle.
                    warn!(error = %err, "wallet snapshot failed, using static lists");
                    None
                }
            },
            None => None,
        };
        let tokens = build_monitor_set(&self.lists, snapshot.as_ref());
        info!(
            tokens = tokens.len(),
            dynamic = self.is_dynamic(),
            "monitor set built"
        );
        MonitorSet { tokens, snapshot }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingWallet;

    #[async_trait]
    impl WalletProvider for FailingWallet {
        async fn snapshot(&self) -> Result<WalletSnapshot> {
            Err(anyhow::anyhow!("rpc down"))
        }
    }

    fn lists() -> MonitorLists {
        MonitorLists {
            monitored_tokens: vec!["A".into(), "B".into(), "USDC".into()],
            dca_tokens: vec!["B".into(), "C".into()],
            token_map: BTreeMap::from([("D".to_string(), "DOG".to_string())]),
            exchange_pairs: BTreeMap::from([("USDC".to_string(), "USDC".to_string())]),
            excluded_tokens: vec!["USDC".into(), "SOL".into()],
        }
    }

    fn snapshot(tokens: &[(&str, f64)]) -> WalletSnapshot {
        WalletSnapshot::new(
            Some("wallet".into()),
            tokens
                .iter()
                .map(|(token, amount)| TokenBalance {
                    token_id: token.to_string(),
                    amount: *amount,
                    usd_value: None,
                })
                .collect(),
        )
    }

    #[test]
    fn union_of_lists_without_exclusions() {
        let set = build_monitor_set(&lists(), None);
        let expected: Vec<&str> = vec!["A", "B", "C", "D"];
        assert_eq!(set.iter().map(String::as_str).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn exclusions_apply_to_wallet_tokens() {
        let wallet = snapshot(&[("SOL", 4.0), ("E", 1.0), ("USDC", 10.0)]);
        let set = build_monitor_set(&lists(), Some(&wallet));
        assert!(set.contains("E"));
        assert!(!set.contains("SOL"));
        assert!(!set.contains("USDC"));
    }

    #[test]
    fn empty_wallet_balances_are_ignored() {
        let wallet = snapshot(&[("E", 0.0)]);
        let set = build_monitor_set(&lists(), Some(&wallet));
        assert!(!set.contains("E"));
    }

    #[test]
    fn building_twice_is_idempotent() {
        let wallet = snapshot(&[("A", 1.0), ("F", 2.0)]);
        let first = build_monitor_set(&lists(), Some(&wallet));
        let second = build_monitor_set(&lists(), Some(&wallet));
        assert_eq!(first, second);
    }

    #[test]
    fn blank_entries_are_skipped() {
        let lists = MonitorLists {
            monitored_tokens: vec!["  ".into(), " A ".into()],
            ..Default::default()
        };
        let set = build_monitor_set(&lists, None);
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn static_mode_ignores_wallet() {
        let builder = MonitorSetBuilder::new(lists(), None);
        let built = builder.build().await;
        assert!(built.snapshot.is_none());
        assert_eq!(built.tokens.len(), 4);
    }

    #[tokio::test]
    async fn dynamic_mode_adds_held_tokens() {
        let provider = StaticWalletProvider::new(
            Some("wallet".into()),
            BTreeMap::from([("Z".to_string(), 5.0)]),
        );
        let builder = MonitorSetBuilder::new(lists(), Some(Arc::new(provider)));
        let built = builder.build().await;
        assert!(built.tokens.contains("Z"));
        assert!(built.snapshot.is_some());
    }

    #[tokio::test]
    async fn wallet_failure_falls_back_to_lists() {
        let builder = MonitorSetBuilder::new(lists(), Some(Arc::new(FailingWallet)));
        let built = builder.build().await;
        assert!(built.snapshot.is_none());
        assert_eq!(built.tokens, build_monitor_set(&lists(), None));
    }
}
