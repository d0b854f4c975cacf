use std::sync::Arc;
use std::time::Duration;

use anchor_core::HttpEmbeddingProvider;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod http;
mod service;
mod storage;
mod store;

use config::Config;
use service::FaceService;
use storage::{ImageStorage, LocalBlobStore};
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("anchord starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        addr = %config.bind_addr(),
        db = %config.db_path.display(),
        storage = %config.storage_dir.display(),
        embedding_url = %config.embedding_url,
        embedding_dim = config.embedding_dim,
        threshold = config.similarity_threshold,
        "configuration loaded"
    );

    // Fail fast if any dependency cannot be constructed.
    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;

    let provider = HttpEmbeddingProvider::new(
        &config.embedding_url,
        config.embedding_dim,
        Duration::from_secs(config.provider_timeout_secs),
    )
    .context("failed to build embedding provider client")?;

    let blobs = Arc::new(LocalBlobStore::new(
        &config.storage_dir,
        &config.public_base_url(),
    ));
    let images = ImageStorage::new(&config.temp_dir, blobs);

    let service = FaceService::new(
        store,
        Arc::new(provider),
        images,
        config.similarity_threshold,
    );

    let app = http::router(service, &config.storage_dir, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;

    tracing::info!(addr = %config.bind_addr(), "anchord ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("anchord shutting down");
        })
        .await
        .context("server error")?;

    Ok(())
}
