//! echo-relay WebSocket server entry point.

use echo_relay::config::Config;
use echo_relay::session::server::start_server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    tracing::info!("starting echo-relay on {}", config.bind_addr);

    start_server(config).await?;
    Ok(())
}
