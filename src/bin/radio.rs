//! FX Radio Application
//!
//! Streams an audio file to every connected listener over HTTP and splices
//! sound effects into the live stream on command.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fx_radio::{
    audio::SystemSox,
    config::AppConfig,
    playback::Engine,
    ui::{AssetStore, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting FX Radio");

    // Config path from args, then the platform config dir, then defaults
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())
        .context("failed to load configuration")?;

    tracing::info!(
        "Source {}, effects in {}, sox at {}",
        config.paths.default_source.display(),
        config.paths.effects_dir.display(),
        config.audio.sox_path.display()
    );

    let sox = Arc::new(SystemSox::new(config.audio.sox_path.clone()));
    let engine = Engine::new(&config, sox);

    let web_server = WebServer::new(
        config.server.clone(),
        engine.clone(),
        AssetStore::new(config.paths.public_dir.clone()),
    );
    let addr = web_server.addr()?;
    let web_handle = web_server.start_background();

    tracing::info!("Listen at http://{}/stream, control at http://{}/controller", addr, addr);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            tracing::info!("Shutting down");
        }
        _ = web_handle => {
            tracing::error!("Web server stopped");
        }
    }

    engine.stop().await;
    Ok(())
}
