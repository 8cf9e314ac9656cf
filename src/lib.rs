//! trafficlens -- anomaly detection and investigation over CDN request logs.
//!
//! Step detection over per-status-class request series, stable anomaly ids,
//! facet investigation against ClickHouse and a scoped result cache.

pub mod api;
pub mod cache;
pub mod config;
pub mod detect;
pub mod filters;
pub mod identity;
pub mod investigate;
pub mod report;
pub mod storage;

use anyhow::{Context, Result};

use crate::api::state::AppState;
use crate::cache::InvestigationCache;
use crate::config::EngineConfig;
use crate::storage::SqliteStore;

/// Open the investigation cache described by `config`.
pub fn open_cache(config: &EngineConfig) -> Result<InvestigationCache<SqliteStore>> {
    let db_path = config.cache.db_path.to_string_lossy();
    tracing::info!(%db_path, "opening investigation cache");
    let store = SqliteStore::open(&db_path, config.cache.max_value_bytes)
        .with_context(|| format!("failed to open cache database: {}", db_path))?;
    Ok(InvestigationCache::from_config(store, &config.cache))
}

/// Start the HTTP API.
pub async fn serve(config: EngineConfig) -> Result<()> {
    let cache = open_cache(&config)?;
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;

    let app = api::router(AppState::new(config, cache));

    tracing::info!(%addr, "trafficlens listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
