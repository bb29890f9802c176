//! # API Data Plane - Main Entry Point
//!
//! Startup order:
//!
//! 1. settings from the CLI argument, `GATEWAY_CONFIG_PATH` or `config/gateway.yaml`
//! 2. logging
//! 3. the durable store, replaced with a full fetch from the config feed
//! 4. the first routing table, built before the listener opens
//! 5. background tasks: store event consumer, feed watcher, reload orchestrator; the watcher first
//!    re-diffs the resource file, so edits made after step 3 are not lost
//! 6. the HTTP server, until a shutdown signal cancels the shared token

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use api_dataplane::feed::{ConfigFeed, StandaloneFeed};
use api_dataplane::gateway::shutdown_signal;
use api_dataplane::observability::init_logging;
use api_dataplane::plugins::PluginRegistry;
use api_dataplane::store::event_pool;
use api_dataplane::{
    ActiveTable, ConfigStore, GatewayContext, GatewayServer, GatewaySettings, ReloadOrchestrator,
};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATEWAY_CONFIG_PATH").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config_missing = !config_path.exists();
    let settings = if config_missing {
        let mut settings = GatewaySettings::default();
        settings.apply_env_overrides()?;
        settings.validate()?;
        settings
    } else {
        GatewaySettings::load(&config_path)
            .await
            .with_context(|| format!("loading settings from {}", config_path.display()))?
    };

    init_logging(&settings.logging)?;
    if config_missing {
        warn!(path = %config_path.display(), "Settings file not found, using defaults");
    }
    info!(version = env!("CARGO_PKG_VERSION"), "🚀 Starting API data plane");

    let store = Arc::new(match &settings.store.path {
        Some(path) => ConfigStore::open(path)
            .with_context(|| format!("opening store {}", path.display()))?,
        None => ConfigStore::open_in_memory(),
    });

    let feed = Arc::new(StandaloneFeed::new(
        settings.feed.file.clone(),
        settings.feed.prefix.clone(),
    ));
    let events = feed
        .fetch_all()
        .await
        .with_context(|| format!("fetching resources from {}", feed.path().display()))?;
    store
        .replace_all(&events)
        .context("applying the initial resource snapshot")?;
    info!(resources = events.len(), "Initial resource snapshot applied");

    let ctx = GatewayContext::new(
        settings.clone(),
        Arc::clone(&store),
        PluginRegistry::with_defaults(),
    )?;
    let active = Arc::new(ActiveTable::default());
    let (orchestrator, reload_hook) = ReloadOrchestrator::new(&ctx, Arc::clone(&active));
    orchestrator
        .reload()
        .await
        .context("building the initial routing table")?;
    store.add_hook(Arc::new(reload_hook));

    let shutdown = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(settings.feed.event_buffer);

    let store_task = tokio::spawn(Arc::clone(&store).run(event_rx, shutdown.clone()));
    let feed_task = {
        let feed = Arc::clone(&feed);
        let pool = event_pool(settings.store.event_pool_size);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = feed.watch(pool, event_tx, shutdown).await {
                error!(error = %e, "Config feed stopped");
            }
        })
    };
    let reload_task = tokio::spawn(orchestrator.run(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let server = GatewayServer::new(ctx, active);
    info!(listen = %server.listen_addr(), "🌐 Data plane ready");
    let served = server.run(shutdown.clone()).await;

    shutdown.cancel();
    let (store_done, feed_done, reload_done) = tokio::join!(store_task, feed_task, reload_task);
    for (task, result) in [("store", store_done), ("feed", feed_done), ("reload", reload_done)] {
        if let Err(e) = result {
            error!(task, error = %e, "Background task ended abnormally");
        }
    }

    served?;
    info!("✅ API data plane shutdown complete");
    Ok(())
}
