use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rowguard_core::RowguardConfig;
use rowguard_server::{router, AppState};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rowguard-server", version, about = "Row-level data policy sidecar")]
struct Args {
    /// Path to the rowguard YAML configuration
    #[arg(short, long, env = "ROWGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, overrides `server.bind`
    #[arg(long, env = "ROWGUARD_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RowguardConfig::from_file(path)?,
        None => {
            tracing::warn!("no configuration given; no table is governed");
            RowguardConfig::default()
        }
    };
    let addr = args.bind.clone().unwrap_or_else(|| config.server.bind.clone());

    let state = Arc::new(AppState::from_config(config));
    let app = router(state);

    tracing::info!("rowguard-server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
