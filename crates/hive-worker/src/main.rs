mod config;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use libhive::store;
use tokio::sync::watch;
use tracing::info;

use crate::config::{Args, load_runtime_config};
use crate::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hive_worker=info,libhive=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;
    let store = store::connect(cfg.redis_url.as_deref())
        .await
        .context("failed to open state store")?;
    if cfg.redis_url.is_none() {
        info!("no redis url configured; jobs can only arrive from this process");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_tx.send_replace(true);
    });

    info!(
        agent_id = %cfg.agent_id,
        worker_type = %cfg.worker_type,
        "hive-worker started pid={}",
        std::process::id()
    );
    Worker::new(cfg, store).run(shutdown_rx).await
}
