use anyhow::Context;
use clap::Parser;
use tracing::info;

use mlgen_relay::{state::AppState, telemetry, Config, JobRelay};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    telemetry::init(config.log_format)?;

    let addr = config.bind_addr()?;
    let settings = config.relay_settings()?;
    info!(backend = %settings.backend_url, policy = ?config.on_disconnect, "Relay configured");

    let relay = JobRelay::new(settings).context("failed to build HTTP client")?;
    let app = mlgen_relay::app(AppState::new(relay, config.on_disconnect));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("MCP relay listening on {addr}");
    axum::serve(listener, app).await.context("relay server")?;
    Ok(())
}
