//! Stitching gateway server
//!
//! Usage: `stitch-gateway [CONFIG]`. Without an argument the config path is
//! read from `STITCH_GATEWAY_CONFIG`.

use anyhow::Context;
use grpc_stitch_gateway::GatewayConfig;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "STITCH_GATEWAY_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .with_context(|| format!("usage: stitch-gateway <config.json> (or set {CONFIG_ENV})"))?;

    let config = GatewayConfig::from_file(&path)
        .with_context(|| format!("failed to load config from {path}"))?;
    let pool = config
        .load_descriptors()
        .context("failed to load descriptor sets")?;
    let builder = config
        .builder(&pool)
        .context("invalid gateway configuration")?
        .with_graceful_shutdown(config.shutdown_config().unwrap_or_default());

    tracing::info!(
        services = config.services.len(),
        relations = config.relations.len(),
        "Starting stitch gateway"
    );

    builder
        .serve(config.listen.clone())
        .await
        .context("gateway server failed")?;
    Ok(())
}
