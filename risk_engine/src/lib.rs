use std::collections::HashMap;

use domain::{Action, Breach, BreachKind, LimitBasis, Position, RiskLimit, TokenId};
use serde::{Deserialize, Serialize};

/// Read-only limit configuration shared by every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub default_limit: RiskLimit,
    #[serde(default)]
    pub per_token: HashMap<TokenId, RiskLimit>,
    pub minimum_balance_usd: f64,
    pub use_ai_confirmation: bool,
}

impl RiskLimits {
    pub fn new(default_limit: RiskLimit) -> Self {
        Self {
            default_limit,
            per_token: HashMap::new(),
            minimum_balance_usd: 0.0,
            use_ai_confirmation: false,
        }
    }

    /// Registers an override; limits without a token id replace the default.
    pub fn with_limit(mut self, limit: RiskLimit) -> Self {
        match limit.token_id.clone() {
            Some(token_id) => {
                self.per_token.insert(token_id, limit);
            }
            None => self.default_limit = limit,
        }
        self
    }

    pub fn with_minimum_balance(mut self, minimum_balance_usd: f64) -> Self {
        self.minimum_balance_usd = minimum_balance_usd;
        self
    }

    pub fn with_ai_confirmation(mut self, enabled: bool) -> Self {
        self.use_ai_confirmation = enabled;
        self
    }

    pub fn limit_for(&self, token_id: &str) -> &RiskLimit {
        self.per_token.get(token_id).unwrap_or(&self.default_limit)
    }

    fn breach_action(&self) -> Action {
        if self.use_ai_confirmation {
            Action::ConsultAi
        } else {
            Action::Close
        }
    }
}

/// Returns the first crossed limit for the position. Non-positive limits are disabled.
pub fn check_position(position: &Position, limit: &RiskLimit) -> Option<Breach> {
    let observed = match limit.basis {
        LimitBasis::Percentage => position.pnl_percent()?,
        LimitBasis::Absolute => position.pnl_usd(),
    };
    if !observed.is_finite() {
        return None;
    }
    if limit.max_loss > 0.0 && observed <= -limit.max_loss {
        return Some(Breach {
            kind: BreachKind::MaxLoss,
            observed,
            limit: limit.max_loss,
            basis: Some(limit.basis),
        });
    }
    if limit.max_gain > 0.0 && observed >= limit.max_gain {
        return Some(Breach {
            kind: BreachKind::MaxGain,
            observed,
            limit: limit.max_gain,
            basis: Some(limit.basis),
        });
    }
    None
}

pub fn check_balance(balance_usd: f64, minimum_balance_usd: f64) -> Option<Breach> {
    if minimum_balance_usd > 0.0 && balance_usd < minimum_balance_usd {
        Some(Breach {
            kind: BreachKind::MinimumBalance,
            observed: balance_usd,
            limit: minimum_balance_usd,
            basis: None,
        })
    } else {
        None
    }
}

pub fn evaluate(position: &Position, limits: &RiskLimits) -> Action {
    match check_position(position, limits.limit_for(&position.token_id)) {
        Some(_) => limits.breach_action(),
        None => Action::None,
    }
}

pub fn evaluate_balance(balance_usd: f64, limits: &RiskLimits) -> Action {
    match check_balance(balance_usd, limits.minimum_balance_usd) {
        Some(_) => limits.breach_action(),
        None => Action::None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub action: Action,
    pub breach: Option<Breach>,
}

impl Assessment {
    fn from_breach(breach: Option<Breach>, limits: &RiskLimits) -> Self {
        let action = if breach.is_some() {
            limits.breach_action()
        } else {
            Action::None
        };
        Self { action, breach }
    }
}

pub trait RiskEvaluator: Send + Sync {
    fn assess_position(&self, position: &Position) -> Assessment;
    fn assess_balance(&self, balance_usd: f64) -> Assessment;
    fn limits(&self) -> &RiskLimits;
}

#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    limits: RiskLimits,
}

impl ThresholdEvaluator {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }
}

impl RiskEvaluator for ThresholdEvaluator {
    fn assess_position(&self, position: &Position) -> Assessment {
        let limit = self.limits.limit_for(&position.token_id);
        Assessment::from_breach(check_position(position, limit), &self.limits)
    }

    fn assess_balance(&self, balance_usd: f64) -> Assessment {
        Assessment::from_breach(
            check_balance(balance_usd, self.limits.minimum_balance_usd),
            &self.limits,
        )
    }

    fn limits(&self) -> &RiskLimits {
        &self.limits
    }
}
