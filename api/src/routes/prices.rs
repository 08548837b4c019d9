use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use domain::{PriceQuote, SourceHealthView};
use serde::Deserialize;

use crate::{error::ApiError, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/prices/:token", get(get_price))
        .route("/sources", get(list_sources))
}

#[derive(Debug, Deserialize)]
struct PriceQuery {
    #[serde(default)]
    fresh: bool,
}

async fn get_price(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<PriceQuery>,
) -> Result<Json<PriceQuote>, ApiError> {
    if !is_token_id(&token) {
        return Err(ApiError::InvalidToken(token));
    }
    let quote = if params.fresh {
        state.fetcher.get_price_fresh(&token).await?
    } else {
        state.fetcher.get_price(&token).await?
    };
    Ok(Json(quote))
}

async fn list_sources(State(state): State<AppState>) -> Json<Vec<SourceHealthView>> {
    Json(state.fetcher.source_health())
}

/// Mint addresses and ticker symbols are short ASCII alphanumeric strings.
fn is_token_id(token: &str) -> bool {
    (1..=MAX_TOKEN_ID_LEN).contains(&token.len())
        && token.bytes().all(|b| b.is_ascii_alphanumeric())
}

const MAX_TOKEN_ID_LEN: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_ids_are_mints_or_symbols() {
        assert!(is_token_id("So11111111111111111111111111111111111111112"));
        assert!(is_token_id("BONK"));
        assert!(!is_token_id(""));
        assert!(!is_token_id("../etc"));
        assert!(!is_token_id("bad token"));
        assert!(!is_token_id(&"A".repeat(MAX_TOKEN_ID_LEN + 1)));
    }
}
