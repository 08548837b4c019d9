use std::sync::Arc;

use action_engine::RecordingExecutor;
use indexer::MonitorSetBuilder;
use risk_engine::RiskEvaluator;

use crate::{
    config::AppConfig,
    repositories::PositionRepository,
    services::{PriceFetcher, RiskMonitor},
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub fetcher: PriceFetcher,
    pub set_builder: MonitorSetBuilder,
    pub evaluator: Arc<dyn RiskEvaluator>,
    pub actions: Arc<RecordingExecutor>,
    pub positions: Arc<dyn PositionRepository>,
    pub monitor: Arc<RiskMonitor>,
}

#[allow(dead_code)]
fn _assert_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
