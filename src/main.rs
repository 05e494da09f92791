//! Elidune Sync - live-data synchronization service
//!
//! Keeps the admin's caches and live feeds in sync with the realtime backend
//! and serves their state over a small JSON API.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use elidune_sync::{
    api,
    config::AppConfig,
    realtime::{memory::MemoryProvider, websocket::WebSocketProvider, RealtimeProvider},
    repository::Repository,
    services::{
        drafts::{DraftStore, MemoryDraftStore},
        notifications::NotificationBackend,
        redis::RedisDraftStore,
        rest::RestClient,
        stats::StatsSource,
        Backends, Services,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("elidune_sync={},tower_http=debug", config.logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting Elidune Sync v{}", env!("CARGO_PKG_VERSION"));

    // Drafts survive restarts when Redis is reachable
    let drafts: Arc<dyn DraftStore> =
        match RedisDraftStore::new(&config.redis.url, config.redis.draft_ttl_secs).await {
            Ok(store) => {
                tracing::info!("Connected to Redis");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!("{}; form drafts will be kept in memory", e);
                Arc::new(MemoryDraftStore::new())
            }
        };

    let provider: Arc<dyn RealtimeProvider> = if config.realtime.url.trim().is_empty() {
        tracing::warn!("No realtime url configured, using the in-process provider");
        Arc::new(MemoryProvider::new().with_auto_subscribe())
    } else {
        let provider = WebSocketProvider::new(&config.realtime)?;
        tracing::info!("Realtime endpoint {}", provider.endpoint());
        Arc::new(provider)
    };

    let backends = match RestClient::new(&config.realtime) {
        Ok(client) => {
            let client = Arc::new(client);
            let notifications: Arc<dyn NotificationBackend> = client.clone();
            let stats: Arc<dyn StatsSource> = client;
            Backends {
                notifications: Some(notifications),
                stats: Some(stats),
            }
        }
        Err(e) => {
            tracing::info!("REST backend disabled: {}", e);
            Backends::default()
        }
    };

    // Save server address before moving config
    let addr = SocketAddr::new(
        config
            .server
            .host
            .parse()
            .with_context(|| format!("Invalid host address '{}'", config.server.host))?,
        config.server.port,
    );

    let services = Arc::new(Services::new(
        Repository::global().clone(),
        provider,
        drafts,
        backends,
        &config.sync,
        &config.session,
    ));
    services.start().await;

    let state = AppState {
        config: Arc::new(config),
        services: services.clone(),
    };
    let app = api::create_router(state);

    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown();
    tracing::info!("Elidune Sync stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
