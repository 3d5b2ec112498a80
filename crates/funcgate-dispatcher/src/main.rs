use anyhow::Context;
use clap::Parser;
use funcgate_core::{iron::IronClient, JobQueue};
use funcgate_dispatcher::{config::GatewayConfig, GatewayServer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,funcgate_dispatcher=debug")),
        )
        .init();

    let cfg = GatewayConfig::parse();
    tracing::debug!(config = ?cfg, "loaded configuration");
    let bind = cfg.bind_addr()?;
    let iron = cfg.iron_config()?;
    let dispatcher_cfg = cfg.dispatcher_config().context("dispatcher config")?;

    let client = IronClient::new(&iron).context("build job-queue client")?;
    match client.list_codes().await {
        Ok(codes) => {
            for code in &codes {
                tracing::info!(
                    event = "funcgate.server.code",
                    code_id = %code.id,
                    code_name = %code.name,
                    "registered code"
                );
            }
            tracing::info!(event = "funcgate.server.inventory", codes = codes.len(), "code inventory");
        }
        Err(err) => tracing::warn!(
            event = "funcgate.server.inventory_failed",
            error = %err,
            "failed to list codes"
        ),
    }

    let queue: Arc<dyn JobQueue> = Arc::new(client);
    let server = GatewayServer::start(dispatcher_cfg, queue, bind)
        .await
        .context("start gateway")?;

    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;
    tracing::info!(event = "funcgate.server.shutdown", "shutting down");
    server.shutdown().await
}
