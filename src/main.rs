use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mflix_stream::access::gate::AccessGate;
use mflix_stream::access::token::JwtVerifier;
use mflix_stream::catalog::memory::CatalogSeed;
use mflix_stream::config::ServerConfig;
use mflix_stream::engine::proxy::StreamProxy;
use mflix_stream::engine::transport::TransportSelector;
use mflix_stream::server::handler::ProxyServer;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ServerConfig::from_env()?;
    if config.jwt_secret.is_empty() {
        bail!("JWT_SECRET must be set");
    }

    let seed = match &config.catalog_path {
        Some(path) => CatalogSeed::from_file(path)?,
        None => {
            info!("CATALOG_PATH not set, starting with an empty catalog");
            CatalogSeed::default()
        }
    };
    let (catalog, subscriptions) = seed.into_stores();

    let proxy_config = config.proxy_config();
    let gate = AccessGate::new(Arc::new(JwtVerifier::new(&config.jwt_secret)), subscriptions);
    let transports = TransportSelector::from_config(&proxy_config)?;
    let proxy = Arc::new(StreamProxy::new(catalog, gate, transports, &proxy_config));

    let server = ProxyServer::start(proxy, config.socket_addr()).await?;
    info!(
        "serving streams on port {} (allow-origin {})",
        server.port(),
        config.client_url
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.shutdown_and_wait().await;
    Ok(())
}
