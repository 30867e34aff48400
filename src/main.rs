mod bridge;
mod commands;
mod config;
mod describe;
mod platform;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::Bridge;
use crate::config::Config;
use crate::platform::discord::DiscordClient;
use crate::platform::matrix::MatrixClient;
use crate::platform::telegram::TelegramClient;
use crate::platform::ChatClient;
use crate::store::BridgeStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatbridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Discord: {}", if config.discord.is_some() { "enabled" } else { "disabled" });
    info!(
        "  Matrix: {}",
        config
            .matrix
            .as_ref()
            .map(|m| m.base_url())
            .unwrap_or_else(|| "disabled".to_string())
    );
    info!("  Matrix rooms: {}", config.bridge.matrix_rooms.len());

    let store = BridgeStore::open(&config.database.path)?;
    let links = store.get_discord_links().await?;
    info!("  Discord links: {}", links.len());
    for link in &links {
        debug!("    {} -> {}", link.chat_id, link.discord_channel_id);
    }

    let telegram: Arc<dyn ChatClient> = Arc::new(TelegramClient::new(&config.telegram.bot_token));
    let discord = config
        .discord
        .as_ref()
        .map(|d| Arc::new(DiscordClient::new(&d.bot_token)) as Arc<dyn ChatClient>);
    let matrix = config
        .matrix
        .as_ref()
        .map(|m| Arc::new(MatrixClient::new(m)) as Arc<dyn ChatClient>);

    let bridge = Bridge::new(store, config.bridge.clone(), telegram, discord, matrix);
    bridge.attach();

    info!("Bridge is starting...");
    bridge.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    bridge.stop().await;
    Ok(())
}
