use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use domain::CircuitState;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ready while at least one price source is not tripped.
async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let serving = state
        .fetcher
        .source_health()
        .iter()
        .any(|source| source.state != CircuitState::Open);
    if serving {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "all price sources open")
    }
}
