use api::{bootstrap::build_state, config::AppConfig, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;

    let config = AppConfig::from_env()?;
    let state = build_state(&config).await?;
    tracing::info!(
        interval_secs = config.monitor.interval.as_secs(),
        dynamic = state.set_builder.is_dynamic(),
        "risk worker started"
    );

    state.monitor.clone().spawn().await?;
    Ok(())
}
