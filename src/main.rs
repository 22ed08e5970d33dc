mod agent;
mod config;
mod llm_client;
mod memory;
mod scheduler;
mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::unbounded;
use tracing_subscriber::EnvFilter;

use agent::Agent;
use config::BotConfig;
use llm_client::LlmClient;
use telegram::TelegramApi;

fn main() -> Result<()> {
    // .env must load before the filter below reads RUST_LOG.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kibitz=debug")),
        )
        .init();

    let config = BotConfig::load().context("configuration error")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: BotConfig) -> Result<()> {
    let api = Arc::new(TelegramApi::new(&config.telegram_token)?);
    let backend = Arc::new(LlmClient::new(
        config.llm_api_url.clone(),
        config.groq_api_key.clone(),
        config.llm_model.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = unbounded();
    let agent = Arc::new(Agent::new(config, api.clone(), backend, shutdown_tx));

    tracing::info!("Kibitz starting up");
    tokio::spawn(telegram::run_bot(api, agent));

    shutdown_rx
        .recv_async()
        .await
        .context("shutdown channel closed unexpectedly")?;

    // One second for the farewell to flush, then exit without draining
    // pending timers or the poll loop.
    tracing::info!("Shutting down");
    tokio::time::sleep(Duration::from_secs(1)).await;
    std::process::exit(0);
}
