use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mint address or symbol identifying a token across every source.
pub type TokenId = String;

/// Pseudo token id used when the whole portfolio is evaluated as one position.
pub const PORTFOLIO_TOKEN: &str = "PORTFOLIO";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PriceQuote {
    pub token_id: TokenId,
    pub price: f64,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitBasis {
    Percentage,
    Absolute,
}

impl LimitBasis {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pct" | "percent" | "percentage" | "%" => Some(LimitBasis::Percentage),
            "usd" | "abs" | "absolute" => Some(LimitBasis::Absolute),
            _ => None,
        }
    }
}

/// Loss/gain bounds for one token, or the default bounds when `token_id` is `None`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RiskLimit {
    #[serde(default)]
    pub token_id: Option<TokenId>,
    pub max_loss: f64,
    pub max_gain: f64,
    pub basis: LimitBasis,
}

impl RiskLimit {
    pub fn percentage(max_loss: f64, max_gain: f64) -> Self {
        Self {
            token_id: None,
            max_loss,
            max_gain,
            basis: LimitBasis::Percentage,
        }
    }

    pub fn absolute(max_loss: f64, max_gain: f64) -> Self {
        Self {
            token_id: None,
            max_loss,
            max_gain,
            basis: LimitBasis::Absolute,
        }
    }

    pub fn for_token(mut self, token_id: impl Into<TokenId>) -> Self {
        self.token_id = Some(token_id.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Position {
    pub token_id: TokenId,
    pub amount: f64,
    pub entry_price: f64,
    pub current_price: f64,
}

impl Position {
    pub fn new(
        token_id: impl Into<TokenId>,
        amount: f64,
        entry_price: f64,
        current_price: f64,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            amount,
            entry_price,
            current_price,
        }
    }

    pub fn entry_value(&self) -> f64 {
        self.amount * self.entry_price
    }

    pub fn current_value(&self) -> f64 {
        self.amount * self.current_price
    }

    pub fn pnl_usd(&self) -> f64 {
        self.current_value() - self.entry_value()
    }

    /// PnL relative to entry, in percent. `None` when the entry value is not positive.
    pub fn pnl_percent(&self) -> Option<f64> {
        let entry = self.entry_value();
        if entry <= 0.0 || !entry.is_finite() {
            return None;
        }
        Some(self.pnl_usd() * 100.0 / entry)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    Close,
    ConsultAi,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::None => "none",
            Action::Close => "close",
            Action::ConsultAi => "consult_ai",
        }
    }

    pub fn is_none(self) -> bool {
        self == Action::None
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BreachKind {
    MaxLoss,
    MaxGain,
    MinimumBalance,
}

impl BreachKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BreachKind::MaxLoss => "max_loss",
            BreachKind::MaxGain => "max_gain",
            BreachKind::MinimumBalance => "minimum_balance",
        }
    }
}

/// A limit that was crossed, with the observed value in the limit's own unit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Breach {
    pub kind: BreachKind,
    pub observed: f64,
    pub limit: f64,
    #[serde(default)]
    pub basis: Option<LimitBasis>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TokenBalance {
    pub token_id: TokenId,
    pub amount: f64,
    #[serde(default)]
    pub usd_value: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WalletSnapshot {
    #[serde(default)]
    pub wallet: Option<String>,
    pub balances: Vec<TokenBalance>,
    pub taken_at: DateTime<Utc>,
}

impl WalletSnapshot {
    pub fn new(wallet: Option<String>, balances: Vec<TokenBalance>) -> Self {
        Self {
            wallet,
            balances,
            taken_at: Utc::now(),
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.balances.iter().map(|b| b.token_id.as_str())
    }

    pub fn amount_of(&self, token_id: &str) -> Option<f64> {
        self.balances
            .iter()
            .find(|b| b.token_id == token_id)
            .map(|b| b.amount)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SourceHealthView {
    pub source_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u32,
    /// Milliseconds until the source may be probed again, when open.
    #[serde(default)]
    pub retry_in_ms: Option<u64>,
}
