use std::sync::Arc;
use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod proxy;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let settings: Arc<config::Settings> = Arc::new(config::init());
    let upstream = settings.resolve_upstream()?;

    let server = proxy::ProxyServer::new(settings.clone());
    server.start(settings.listen_port, upstream)?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop();

    info!("exiting");

    Ok(())
}
