use clap::Parser;
use roomlink::config::Config;
use roomlink::interface::api::{build_router, init_metrics, SignalingState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// RoomLink signaling relay
#[derive(Debug, Parser)]
#[command(name = "roomlink", version, about)]
struct Args {
    /// Configuration file (defaults to ./roomlink.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!("Configuration loaded: {:?}", config);

    let prometheus_handle = if config.server.enable_metrics {
        Some(init_metrics()?)
    } else {
        None
    };

    let state = Arc::new(SignalingState::new());
    let app = build_router(state, prometheus_handle, &config.server.allowed_origin);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!(
        "Signaling relay listening on {} (allowed origin {})",
        listener.local_addr()?,
        config.server.allowed_origin
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Signaling relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
