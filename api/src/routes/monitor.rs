use std::collections::BTreeSet;

use action_engine::ActionRequest;
use axum::{extract::State, routing::get, routing::post, Json, Router};
use domain::TokenId;
use risk_engine::RiskLimits;
use serde::Serialize;

use crate::{error::ApiError, services::CycleReport, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tokens", get(list_tokens))
        .route("/risk/limits", get(get_limits))
        .route("/risk/actions", get(list_actions))
        .route("/risk/run", post(run_cycle))
}

#[derive(Debug, Serialize)]
struct TokensResponse {
    dynamic: bool,
    tokens: BTreeSet<TokenId>,
}

async fn list_tokens(State(state): State<AppState>) -> Json<TokensResponse> {
    let set = state.set_builder.build().await;
    Json(TokensResponse {
        dynamic: state.set_builder.is_dynamic(),
        tokens: set.tokens,
    })
}

async fn get_limits(State(state): State<AppState>) -> Json<RiskLimits> {
    Json(state.evaluator.limits().clone())
}

async fn list_actions(State(state): State<AppState>) -> Json<Vec<ActionRequest>> {
    Json(state.actions.recent().await)
}

async fn run_cycle(State(state): State<AppState>) -> Result<Json<CycleReport>, ApiError> {
    Ok(Json(state.monitor.run_cycle().await?))
}
