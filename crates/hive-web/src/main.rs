use anyhow::{Context, Result};
use clap::Parser;
use hive_web::config::{Args, build_cors, load_runtime_config};
use hive_web::{AppState, router};
use libhive::store;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hive_web=info,libhive=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;
    let cors = build_cors(&cfg.allow_origins)?;

    let store = store::connect(cfg.redis_url.as_deref())
        .await
        .context("failed to open state store")?;
    let state = AppState::new(&cfg, store).await?;
    let app = router(state, cors);

    let listener = tokio::net::TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("failed to bind web listener on {}", cfg.listen))?;

    info!(
        listen = %cfg.listen,
        job_timeout_secs = cfg.job_timeout.as_secs(),
        overflow_policy = ?cfg.overflow_policy,
        "hive-web listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}
