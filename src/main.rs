//! Preview Cache Server
//!
//! Loads configuration, sets up logging, and serves the preview API until
//! interrupted.

use anyhow::Context;
use preview_cache::{
    AppState, CredentialStore, DirectMediaResolver, MetricsEndpoint, OriginClient, PreviewProxy,
    ProxyConfig,
};
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "preview_cache.yaml";

/// # Usage
/// ```bash
/// # Start with preview_cache.yaml if present, defaults otherwise
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Preview Cache Server");

    let config = Arc::new(load_config()?);
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Cache directory: {}", config.cache_dir().display());
    info!("  - Stream chunk size: {} KB", config.stream_chunk_size / 1024);
    info!("  - Fetch chunk size: {} KB", config.fetch_chunk_size / 1024);
    info!("  - Origin timeout: {}s", config.origin_timeout_secs);
    match config.max_cache_bytes {
        Some(cap) => info!("  - Cache admission cap: {} bytes", cap),
        None => info!("  - Cache admission cap: none"),
    }

    let credentials = match &config.credentials_file {
        Some(path) => CredentialStore::from_file(path).context("loading credentials")?,
        None => CredentialStore::default(),
    };

    let proxy = PreviewProxy::new(config.clone()).context("creating proxy")?;
    let resolver = DirectMediaResolver::new(
        OriginClient::new(config.origin_timeout()).context("creating resolver client")?,
        config.default_user_agent.clone(),
    );
    let state = AppState::new(proxy.clone())
        .with_resolver(Arc::new(resolver))
        .with_credentials(credentials);

    if let Some(endpoint) = config.metrics_endpoint.as_ref().filter(|e| e.enabled) {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .context("parsing metrics endpoint address")?;
        let metrics = MetricsEndpoint::new(proxy.metrics_arc(), addr);
        tokio::spawn(async move {
            if let Err(e) = metrics.start().await {
                error!("Metrics endpoint failed: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("binding {}", config.listen_address))?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(preview_cache::server::serve(listener, state, shutdown.clone()));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    server.await.context("joining server task")??;
    proxy.shutdown().await;

    info!("Preview Cache Server stopped");
    Ok(())
}

/// First CLI argument, else `preview_cache.yaml` if present, else defaults
fn load_config() -> anyhow::Result<ProxyConfig> {
    if let Some(path) = env::args().nth(1) {
        info!("Loading configuration from: {}", path);
        return ProxyConfig::from_file(&path).with_context(|| format!("loading {}", path));
    }

    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        info!("Loading configuration from: {}", DEFAULT_CONFIG_PATH);
        return ProxyConfig::from_file(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("loading {}", DEFAULT_CONFIG_PATH));
    }

    info!("No configuration file found, using defaults");
    Ok(ProxyConfig::default())
}
