mod bot;
mod config;
mod error;
mod platform;
mod scheduler;
mod stats;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::Dispatcher;
use crate::config::Config;
use crate::platform::telegram::TelegramClient;
use crate::scheduler::Scheduler;
use crate::stats::PollStats;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pollbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Missing token ends the process here with a non-zero exit code
    let config = Config::load().context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  API base: {}", config.telegram.api_base);
    info!("  Long-poll timeout: {}s", config.telegram.poll_timeout_secs);
    info!("  Voice downloads: {}", config.downloads.directory.display());

    let stats = Arc::new(PollStats::default());

    let mut scheduler = Scheduler::new().await?;
    if config.heartbeat.enabled {
        scheduler::tasks::register_heartbeat(&scheduler, stats.clone(), &config.heartbeat.cron)
            .await?;
    }
    scheduler.start().await?;

    let client = TelegramClient::new(config.telegram.clone());
    let mut dispatcher = Dispatcher::new(
        client,
        config.polling.clone(),
        config.downloads.directory.clone(),
        stats.clone(),
    );

    info!("Bot is starting...");
    tokio::select! {
        _ = dispatcher.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            info!(
                "Shutdown signal received, last offset: {:?}",
                stats.snapshot().cursor
            );
        }
    }

    scheduler.shutdown().await?;
    Ok(())
}
