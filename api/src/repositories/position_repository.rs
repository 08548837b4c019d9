use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BalanceRecord {
    pub balance_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Entry prices per token and the account balance history.
#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn entry_price(&self, token_id: &str) -> Result<Option<f64>>;
    /// Keeps the first recorded entry; returns the stored price.
    async fn record_entry(&self, token_id: &str, price: f64) -> Result<f64>;
    async fn clear_entry(&self, token_id: &str) -> Result<()>;
    async fn record_balance(&self, balance_usd: f64) -> Result<BalanceRecord>;
    async fn latest_balance(&self) -> Result<Option<BalanceRecord>>;
}

#[derive(Clone)]
pub struct PostgresPositionRepository {
    pool: PgPool,
}

impl PostgresPositionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PositionRepository for PostgresPositionRepository {
    async fn entry_price(&self, token_id: &str) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT entry_price FROM position_entries WHERE token_id = $1")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get("entry_price").context("invalid entry_price column"))
            .transpose()
    }

    async fn record_entry(&self, token_id: &str, price: f64) -> Result<f64> {
        sqlx::query(
            "INSERT INTO position_entries (token_id, entry_price, recorded_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (token_id) DO NOTHING",
        )
        .bind(token_id)
        .bind(price)
        .execute(&self.pool)
        .await?;
        Ok(self.entry_price(token_id).await?.unwrap_or(price))
    }

    async fn clear_entry(&self, token_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM position_entries WHERE token_id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_balance(&self, balance_usd: f64) -> Result<BalanceRecord> {
        let row = sqlx::query(
            "INSERT INTO balance_history (balance_usd, recorded_at)
             VALUES ($1, NOW())
             RETURNING balance_usd, recorded_at",
        )
        .bind(balance_usd)
        .fetch_one(&self.pool)
        .await?;
        Ok(BalanceRecord {
            balance_usd: row.try_get("balance_usd")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    async fn latest_balance(&self) -> Result<Option<BalanceRecord>> {
        let row = sqlx::query(
            "SELECT balance_usd, recorded_at FROM balance_history
             ORDER BY recorded_at DESC, id DESC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| -> Result<BalanceRecord> {
            Ok(BalanceRecord {
                balance_usd: r.try_get("balance_usd")?,
                recorded_at: r.try_get("recorded_at")?,
            })
        })
        .transpose()
    }
}

/// Used when no database is configured.
#[derive(Default)]
pub struct InMemoryPositionRepository {
    entries: RwLock<HashMap<String, f64>>,
    balances: RwLock<Vec<BalanceRecord>>,
}

#[async_trait]
impl PositionRepository for InMemoryPositionRepository {
    async fn entry_price(&self, token_id: &str) -> Result<Option<f64>> {
        Ok(self.entries.read().await.get(token_id).copied())
    }

    async fn record_entry(&self, token_id: &str, price: f64) -> Result<f64> {
        let mut entries = self.entries.write().await;
        Ok(*entries.entry(token_id.to_string()).or_insert(price))
    }

    async fn clear_entry(&self, token_id: &str) -> Result<()> {
        self.entries.write().await.remove(token_id);
        Ok(())
    }

    async fn record_balance(&self, balance_usd: f64) -> Result<BalanceRecord> {
        let record = BalanceRecord {
            balance_usd,
            recorded_at: Utc::now(),
        };
        self.balances.write().await.push(record.clone());
        Ok(record)
    }

    async fn latest_balance(&self) -> Result<Option<BalanceRecord>> {
        Ok(self.balances.read().await.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_entry_price_wins() {
        let repo = InMemoryPositionRepository::default();
        assert_eq!(repo.record_entry("T", 1.0).await.unwrap(), 1.0);
        assert_eq!(repo.record_entry("T", 2.0).await.unwrap(), 1.0);
        repo.clear_entry("T").await.unwrap();
        assert_eq!(repo.entry_price("T").await.unwrap(), None);
        assert_eq!(repo.record_entry("T", 3.0).await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn latest_balance_is_last_recorded() {
        let repo = InMemoryPositionRepository::default();
        assert!(repo.latest_balance().await.unwrap().is_none());
        repo.record_balance(100.0).await.unwrap();
        repo.record_balance(90.0).await.unwrap();
        assert_eq!(repo.latest_balance().await.unwrap().map(|r| r.balance_usd), Some(90.0));
    }
}
