use anyhow::{Context, Result};
use logferry_cloud::metadata::MetadataServer;
use logferry_cloud::staging::GcsStagingStore;
use logferry_cloud::target::S3TargetStore;
use logferry_cloud::trust::StsTrustExchange;
use logferry_cloud::{CleanupSweeper, CredentialBroker, FerryConfig, TransferWorker};
use logferry_functions::{AppState, router};
use std::sync::Arc;
use tracing::info;

fn init_tracing(format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = if format == "json" {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = FerryConfig::load().context("failed to load configuration")?;
    init_tracing(&config.log_format);

    let metadata = Arc::new(MetadataServer::new(config.metadata_base_url.clone())?);
    let staging = Arc::new(GcsStagingStore::new(
        config.gcs_base_url.clone(),
        metadata.clone(),
    )?);
    let target = Arc::new(S3TargetStore::new(
        config.target_bucket.clone(),
        config.target_region.clone(),
        config.target_endpoint_override.clone(),
    ));
    let exchange = Arc::new(StsTrustExchange::new(config.target_region.clone(), None));
    let broker = Arc::new(CredentialBroker::from_config(metadata, exchange, &config));

    let worker = Arc::new(TransferWorker::from_config(staging, target, broker, &config));
    let sweeper = Arc::new(CleanupSweeper::from_config(worker.clone(), &config));
    let state = AppState::new(
        worker,
        sweeper,
        config.max_concurrent_transfers,
        config.staleness_threshold,
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        addr = %config.listen_addr,
        staging_bucket = %config.staging_bucket,
        target_bucket = %config.target_bucket,
        "logferry listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
