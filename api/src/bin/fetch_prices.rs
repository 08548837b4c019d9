use api::{bootstrap::build_state, config::split_list, config::AppConfig, telemetry};
use serde_json::json;

/// Prices `PRICE_TOKENS` (or the current monitor set) once and prints one JSON line per token.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;
    let config = AppConfig::from_env()?;
    let state = build_state(&config).await?;

    let tokens = match std::env::var("PRICE_TOKENS") {
        Ok(raw) => split_list(&raw),
        Err(_) => state.set_builder.build().await.tokens.into_iter().collect(),
    };

    let mut failures = 0usize;
    for token in &tokens {
        match state.fetcher.get_price(token).await {
            Ok(quote) => println!("{}", serde_json::to_string(&quote)?),
            Err(err) => {
                failures += 1;
                println!("{}", json!({ "token_id": token, "error": err.to_string() }));
            }
        }
    }
    tracing::info!(
        tokens = tokens.len(),
        failures,
        sources = ?state.fetcher.source_health(),
        "price fetch finished"
    );
    Ok(())
}
