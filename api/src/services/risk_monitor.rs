use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use action_engine::{ActionExecutor, ActionRequest};
use anyhow::Result;
use chrono::Utc;
use domain::{BreachKind, Position, TokenId, WalletSnapshot, PORTFOLIO_TOKEN};
use indexer::{MonitorSetBuilder, WalletProvider};
use risk_engine::{Assessment, RiskEvaluator};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::price_fetcher::PriceFetcher;
use crate::repositories::PositionRepository;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub balance_log_interval: Duration,
    pub action_cooldown: Duration,
    pub max_concurrency: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            balance_log_interval: Duration::from_secs(86_400),
            action_cooldown: Duration::from_secs(900),
            max_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub tokens: Vec<TokenId>,
    pub prices: BTreeMap<TokenId, f64>,
    /// Tokens left out of this cycle because no price was available.
    pub gaps: Vec<TokenId>,
    pub portfolio_value_usd: Option<f64>,
    pub actions: Vec<ActionRequest>,
    /// Breaches seen again while their action cooldown was running.
    pub suppressed: Vec<TokenId>,
}

type CooldownKey = (TokenId, Option<BreachKind>);

pub struct RiskMonitor {
    set_builder: MonitorSetBuilder,
    balances: Option<Arc<dyn WalletProvider>>,
    fetcher: PriceFetcher,
    evaluator: Arc<dyn RiskEvaluator>,
    executor: Arc<dyn ActionExecutor>,
    positions: Arc<dyn PositionRepository>,
    settings: MonitorSettings,
    clock: Arc<dyn Clock>,
    last_actions: Mutex<HashMap<CooldownKey, Instant>>,
}

impl RiskMonitor {
    pub fn new(
        set_builder: MonitorSetBuilder,
        fetcher: PriceFetcher,
        evaluator: Arc<dyn RiskEvaluator>,
        executor: Arc<dyn ActionExecutor>,
        positions: Arc<dyn PositionRepository>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            set_builder,
            balances: None,
            fetcher,
            evaluator,
            executor,
            positions,
            settings,
            clock: Arc::new(SystemClock),
            last_actions: Mutex::new(HashMap::new()),
        }
    }

    /// Balance source for static mode, where the set builder carries no wallet.
    pub fn with_balance_provider(mut self, provider: Arc<dyn WalletProvider>) -> Self {
        self.balances = Some(provider);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.run_cycle().await {
                    Ok(report) => info!(
                        tokens = report.tokens.len(),
                        priced = report.prices.len(),
                        gaps = report.gaps.len(),
                        actions = report.actions.len(),
                        "risk cycle finished"
                    ),
                    Err(err) => warn!(error = %err, "risk cycle failed"),
                }
                sleep(self.settings.interval).await;
            }
        })
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let set = self.set_builder.build().await;
        metrics::gauge!("monitor_tokens").set(set.tokens.len() as f64);
        let snapshot = match set.snapshot {
            Some(snapshot) => Some(snapshot),
            None => self.load_balances().await,
        };

        let mut report = CycleReport {
            tokens: set.tokens.iter().cloned().collect(),
            ..CycleReport::default()
        };
        self.fetch_prices(&set.tokens, &mut report).await?;

        let Some(snapshot) = snapshot else {
            debug!("no wallet balances, skipping position checks");
            return Ok(report);
        };

        for (token_id, price) in &report.prices.clone() {
            let amount = snapshot.amount_of(token_id).unwrap_or(0.0);
            if amount <= 0.0 {
                self.positions.clear_entry(token_id).await?;
                continue;
            }
            let entry_price = match self.positions.entry_price(token_id).await? {
                Some(entry) => entry,
                None => {
                    let entry = self.positions.record_entry(token_id, *price).await?;
                    info!(token = %token_id, entry_price = entry, "entry price recorded");
                    entry
                }
            };
            let position = Position::new(token_id.clone(), amount, entry_price, *price);
            let assessment = self.evaluator.assess_position(&position);
            let context = format!(
                "amount {amount} entry {entry_price} current {price} pnl ${:.2}",
                position.pnl_usd()
            );
            self.dispatch(token_id, assessment, context, &mut report).await;
        }

        match portfolio_value(&snapshot, &report.prices, &report.gaps) {
            Some(value) => {
                report.portfolio_value_usd = Some(value);
                self.check_portfolio(value, &mut report).await?;
            }
            None => warn!(
                gaps = ?report.gaps,
                "held tokens without a price, portfolio checks skipped this cycle"
            ),
        }
        Ok(report)
    }

    async fn load_balances(&self) -> Option<WalletSnapshot> {
        let provider = self.balances.as_ref()?;
        match provider.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(error = %err, "wallet balances unavailable");
                None
            }
        }
    }

    async fn fetch_prices(
        &self,
        tokens: &BTreeSet<TokenId>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(tokens.len());

        for token_id in tokens {
            let permit = semaphore.clone().acquire_owned().await?;
            let fetcher = self.fetcher.clone();
            let token_id = token_id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = fetcher.get_price(&token_id).await;
                (token_id, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((token_id, Ok(quote))) => {
                    report.prices.insert(token_id, quote.price);
                }
                Ok((token_id, Err(err))) => {
                    warn!(token = %token_id, error = %err, "price gap, token skipped this cycle");
                    report.gaps.push(token_id);
                }
                Err(err) => warn!(error = %err, "price task failed"),
            }
        }
        Ok(())
    }

    async fn check_portfolio(&self, value: f64, report: &mut CycleReport) -> Result<()> {
        let baseline = self.positions.latest_balance().await?;
        let due = match &baseline {
            Some(last) => {
                let age = (Utc::now() - last.recorded_at).to_std().unwrap_or_default();
                age >= self.settings.balance_log_interval
            }
            None => true,
        };
        if due {
            self.positions.record_balance(value).await?;
            info!(balance_usd = value, "balance recorded");
        }

        if let Some(baseline) = baseline.filter(|b| b.balance_usd > 0.0) {
            let portfolio = Position::new(PORTFOLIO_TOKEN, 1.0, baseline.balance_usd, value);
            let assessment = self.evaluator.assess_position(&portfolio);
            let context = format!(
                "portfolio ${value:.2} against ${:.2} recorded {}",
                baseline.balance_usd, baseline.recorded_at
            );
            self.dispatch(PORTFOLIO_TOKEN, assessment, context, report).await;
        }

        let assessment = self.evaluator.assess_balance(value);
        let context = format!(
            "balance ${value:.2} below minimum ${:.2}",
            self.evaluator.limits().minimum_balance_usd
        );
        self.dispatch(PORTFOLIO_TOKEN, assessment, context, report).await;
        Ok(())
    }

    async fn dispatch(
        &self,
        token_id: &str,
        assessment: Assessment,
        context: String,
        report: &mut CycleReport,
    ) {
        if assessment.action.is_none() {
            return;
        }
        let key = (
            token_id.to_string(),
            assessment.breach.as_ref().map(|b| b.kind),
        );
        let now = self.clock.now();
        {
            let mut last_actions = self.last_actions.lock().await;
            if let Some(at) = last_actions.get(&key) {
                if now.saturating_duration_since(*at) < self.settings.action_cooldown {
                    debug!(token = %token_id, "action suppressed by cooldown");
                    report.suppressed.push(token_id.to_string());
                    return;
                }
            }
            last_actions.insert(key.clone(), now);
        }

        let action = assessment.action;
        let request = ActionRequest::new(token_id, action, assessment.breach, context);
        metrics::counter!("risk_actions_total", "action" => action.as_str()).increment(1);
        match self.executor.execute(&request).await {
            Ok(()) => info!(
                token = %token_id,
                action = action.as_str(),
                request = %request.id,
                "risk action dispatched"
            ),
            Err(err) => {
                warn!(token = %token_id, error = %err, "risk action failed");
                // Failed actions do not start a cooldown.
                self.last_actions.lock().await.remove(&key);
            }
        }
        report.actions.push(request);
    }
}

/// Held value at current prices. Unpriced holdings count at the wallet's own USD value;
/// `None` when a monitored holding failed to price and the wallet gives no value for it.
fn portfolio_value(
    snapshot: &WalletSnapshot,
    prices: &BTreeMap<TokenId, f64>,
    gaps: &[TokenId],
) -> Option<f64> {
    let mut total = 0.0;
    for balance in snapshot.balances.iter().filter(|b| b.amount > 0.0) {
        total += match (prices.get(&balance.token_id), balance.usd_value) {
            (Some(price), _) => balance.amount * price,
            (None, Some(usd_value)) => usd_value,
            (None, None) if gaps.contains(&balance.token_id) => return None,
            (None, None) => 0.0,
        };
    }
    Some(total)
}

/// Keeps the cache warm for the monitor set between risk cycles.
pub struct PriceRefresher {
    fetcher: PriceFetcher,
    set_builder: MonitorSetBuilder,
    interval: Duration,
}

impl PriceRefresher {
    pub fn new(fetcher: PriceFetcher, set_builder: MonitorSetBuilder, interval: Duration) -> Self {
        Self {
            fetcher,
            set_builder,
            interval: interval.max(Duration::from_secs(30)),
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let set = self.set_builder.build().await;
                for token_id in &set.tokens {
                    if let Err(err) = self.fetcher.get_price(token_id).await {
                        warn!(error = %err, token = %token_id, "price refresh failed");
                    }
                }
                sleep(self.interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::InMemoryPositionRepository;
    use crate::services::clock::ManualClock;
    use crate::services::price_fetcher::PriceFetcherConfig;
    use crate::services::price_sources::{PriceSource, SourceError, StaticPriceSource};
    use action_engine::{LoggingExecutor, RecordingExecutor};
    use domain::{Action, RiskLimit};
    use indexer::{MonitorLists, StaticWalletProvider};
    use risk_engine::{RiskLimits, ThresholdEvaluator};

    struct Harness {
        monitor: RiskMonitor,
        positions: Arc<InMemoryPositionRepository>,
        actions: Arc<RecordingExecutor>,
        clock: Arc<ManualClock>,
    }

    fn harness(limits: RiskLimits, dynamic: bool) -> Harness {
        let lists = MonitorLists {
            monitored_tokens: vec!["AAA".into(), "BBB".into(), "CCC".into()],
            excluded_tokens: vec!["USDC".into()],
            ..MonitorLists::default()
        };
        let wallet: Arc<dyn WalletProvider> = Arc::new(StaticWalletProvider::new(
            Some("wallet".into()),
            BTreeMap::from([
                ("AAA".to_string(), 10.0),
                ("BBB".to_string(), 5.0),
                ("DDD".to_string(), 2.0),
                ("USDC".to_string(), 50.0),
            ]),
        ));
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(StaticPriceSource::new(
            HashMap::from([
                ("AAA".to_string(), 1.0),
                ("BBB".to_string(), 2.0),
                ("DDD".to_string(), 4.0),
                ("USDC".to_string(), 1.0),
            ]),
        ))];
        let clock = Arc::new(ManualClock::new());
        let fetcher = PriceFetcher::new(sources, PriceFetcherConfig::default(), clock.clone());
        let positions = Arc::new(InMemoryPositionRepository::default());
        let actions = Arc::new(RecordingExecutor::new(Arc::new(LoggingExecutor), 16));

        let builder = if dynamic {
            MonitorSetBuilder::new(lists, Some(wallet.clone()))
        } else {
            MonitorSetBuilder::new(lists, None)
        };
        let monitor = RiskMonitor::new(
            builder,
            fetcher,
            Arc::new(ThresholdEvaluator::new(limits)),
            actions.clone(),
            positions.clone(),
            MonitorSettings::default(),
        )
        .with_balance_provider(wallet)
        .with_clock(clock.clone());
        Harness {
            monitor,
            positions,
            actions,
            clock,
        }
    }

    fn limits() -> RiskLimits {
        RiskLimits::new(RiskLimit::percentage(20.0, 50.0))
    }

    #[tokio::test]
    async fn first_cycle_records_entries_without_acting() {
        let h = harness(limits(), false);
        let report = h.monitor.run_cycle().await.unwrap();

        assert_eq!(report.tokens, vec!["AAA", "BBB", "CCC"]);
        assert_eq!(report.gaps, vec!["CCC"]);
        assert!(report.actions.is_empty());
        // Static mode prices only listed tokens; DDD and USDC fall back to their usd_value (none).
        assert_eq!(report.portfolio_value_usd, Some(20.0));
        assert_eq!(h.positions.entry_price("AAA").await.unwrap(), Some(1.0));
        assert_eq!(h.positions.entry_price("BBB").await.unwrap(), Some(2.0));
        assert_eq!(
            h.positions.latest_balance().await.unwrap().map(|b| b.balance_usd),
            Some(20.0)
        );
    }

    #[tokio::test]
    async fn loss_breach_closes_once_per_cooldown() {
        let h = harness(limits(), false);
        h.positions.record_entry("AAA", 2.0).await.unwrap();

        let report = h.monitor.run_cycle().await.unwrap();
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].token_id, "AAA");
        assert_eq!(report.actions[0].action, Action::Close);
        assert_eq!(
            report.actions[0].breach.as_ref().map(|b| b.kind),
            Some(BreachKind::MaxLoss)
        );

        let report = h.monitor.run_cycle().await.unwrap();
        assert!(report.actions.is_empty());
        assert_eq!(report.suppressed, vec!["AAA"]);

        h.clock.advance(Duration::from_secs(900));
        let report = h.monitor.run_cycle().await.unwrap();
        assert_eq!(report.actions.len(), 1);
        assert_eq!(h.actions.recent().await.len(), 2);
    }

    #[tokio::test]
    async fn ai_confirmation_turns_breaches_into_consultations() {
        let h = harness(limits().with_ai_confirmation(true), false);
        h.positions.record_entry("BBB", 1.0).await.unwrap();

        let report = h.monitor.run_cycle().await.unwrap();
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].token_id, "BBB");
        assert_eq!(report.actions[0].action, Action::ConsultAi);
    }

    #[tokio::test]
    async fn low_balance_triggers_portfolio_close() {
        let h = harness(limits().with_minimum_balance(100.0), false);
        let report = h.monitor.run_cycle().await.unwrap();

        assert_eq!(report.actions.len(), 1);
        let request = &report.actions[0];
        assert_eq!(request.token_id, PORTFOLIO_TOKEN);
        assert_eq!(
            request.breach.as_ref().map(|b| b.kind),
            Some(BreachKind::MinimumBalance)
        );
    }

    #[tokio::test]
    async fn portfolio_drop_against_recorded_balance_closes() {
        let h = harness(limits(), false);
        h.positions.record_balance(100.0).await.unwrap();

        let report = h.monitor.run_cycle().await.unwrap();
        let portfolio: Vec<_> = report
            .actions
            .iter()
            .filter(|r| r.token_id == PORTFOLIO_TOKEN)
            .collect();
        assert_eq!(portfolio.len(), 1);
        assert_eq!(
            portfolio[0].breach.as_ref().map(|b| b.kind),
            Some(BreachKind::MaxLoss)
        );
        // Balance history is only appended once per logging interval.
        assert_eq!(
            h.positions.latest_balance().await.unwrap().map(|b| b.balance_usd),
            Some(100.0)
        );
    }

    #[tokio::test]
    async fn dynamic_mode_monitors_wallet_tokens() {
        let h = harness(limits(), true);
        let report = h.monitor.run_cycle().await.unwrap();

        assert_eq!(report.tokens, vec!["AAA", "BBB", "CCC", "DDD"]);
        assert_eq!(report.prices.get("DDD"), Some(&4.0));
        assert_eq!(report.portfolio_value_usd, Some(28.0));
    }

    struct DownSource;

    #[async_trait::async_trait]
    impl PriceSource for DownSource {
        fn id(&self) -> &str {
            "down"
        }

        async fn fetch_price(&self, _token_id: &str) -> Result<f64, SourceError> {
            Err(SourceError::Status(502))
        }
    }

    fn outage_monitor(positions: Arc<InMemoryPositionRepository>) -> RiskMonitor {
        let lists = MonitorLists {
            monitored_tokens: vec!["AAA".into()],
            ..MonitorLists::default()
        };
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(DownSource)];
        RiskMonitor::new(
            MonitorSetBuilder::new(lists, None),
            PriceFetcher::new(sources, PriceFetcherConfig::default(), Arc::new(ManualClock::new())),
            Arc::new(ThresholdEvaluator::new(limits().with_minimum_balance(100.0))),
            Arc::new(LoggingExecutor),
            positions,
            MonitorSettings::default(),
        )
        .with_balance_provider(Arc::new(StaticWalletProvider::new(
            None,
            BTreeMap::from([("AAA".to_string(), 1000.0)]),
        )))
    }

    #[tokio::test]
    async fn price_outage_takes_no_portfolio_action() {
        let positions = Arc::new(InMemoryPositionRepository::default());
        let monitor = outage_monitor(positions.clone());

        let report = monitor.run_cycle().await.unwrap();
        assert_eq!(report.gaps, vec!["AAA"]);
        assert_eq!(report.portfolio_value_usd, None);
        assert!(report.actions.is_empty());
        assert!(positions.latest_balance().await.unwrap().is_none());

        positions.record_balance(1000.0).await.unwrap();
        let report = monitor.run_cycle().await.unwrap();
        assert!(report.actions.is_empty());
        assert_eq!(
            positions.latest_balance().await.unwrap().map(|b| b.balance_usd),
            Some(1000.0)
        );
    }

    #[test]
    fn gaps_with_wallet_value_still_count() {
        let snapshot = WalletSnapshot {
            wallet: None,
            balances: vec![
                domain::TokenBalance {
                    token_id: "AAA".into(),
                    amount: 2.0,
                    usd_value: Some(7.0),
                },
                domain::TokenBalance {
                    token_id: "BBB".into(),
                    amount: 1.0,
                    usd_value: None,
                },
            ],
            taken_at: Utc::now(),
        };
        let prices = BTreeMap::from([("BBB".to_string(), 3.0)]);
        assert_eq!(
            portfolio_value(&snapshot, &prices, &["AAA".to_string()]),
            Some(10.0)
        );
        assert_eq!(
            portfolio_value(&snapshot, &BTreeMap::new(), &["BBB".to_string()]),
            None
        );
    }

    #[tokio::test]
    async fn sold_tokens_lose_their_entry_price() {
        let lists = MonitorLists {
            monitored_tokens: vec!["AAA".into()],
            ..MonitorLists::default()
        };
        let sources: Vec<Arc<dyn PriceSource>> = vec![Arc::new(StaticPriceSource::new(
            HashMap::from([("AAA".to_string(), 1.0)]),
        ))];
        let positions = Arc::new(InMemoryPositionRepository::default());
        positions.record_entry("AAA", 3.0).await.unwrap();
        let monitor = RiskMonitor::new(
            MonitorSetBuilder::new(lists, None),
            PriceFetcher::new(sources, PriceFetcherConfig::default(), Arc::new(ManualClock::new())),
            Arc::new(ThresholdEvaluator::new(limits())),
            Arc::new(LoggingExecutor),
            positions.clone(),
            MonitorSettings::default(),
        )
        .with_balance_provider(Arc::new(StaticWalletProvider::new(None, BTreeMap::new())));

        let report = monitor.run_cycle().await.unwrap();
        assert!(report.actions.is_empty());
        assert_eq!(positions.entry_price("AAA").await.unwrap(), None);
    }
}
