//! kinmate-cs - Elder companion coordination service
//!
//! Accepts conversation turns over HTTP, coordinates them through the shared
//! store and streams companion events over SSE.

use anyhow::{Context, Result};
use clap::Parser;
use kinmate_common::config::{ConfigOverrides, ServiceConfig};
use kinmate_common::events::EventBus;
use kinmate_cs::collaborators::Collaborators;
use kinmate_cs::keyword_guard::KeywordGuard;
use kinmate_cs::llm_client::ChatClient;
use kinmate_cs::{build_router, AppState, CompanionService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kinmate-cs")]
#[command(about = "Elder companion coordination service")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "KINMATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:5731
    #[arg(short, long)]
    bind: Option<String>,

    /// Store URL (`memory://` or `sqlite://<path>`)
    #[arg(long)]
    store_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::resolve(&ConfigOverrides {
        config_path: args.config,
        bind_addr: args.bind,
        store_url: args.store_url,
    })
    .context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.as_str().into()),
        )
        .init();

    info!("Starting kinmate-cs v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Chunk size {}, idle timeout {}s, store {}",
        config.summary_chunk_size, config.idle_timeout_secs, config.store_url
    );

    let store = kinmate_common::store::connect(&config.store_url)
        .await
        .context("Failed to open store")?;

    let chat = Arc::new(ChatClient::new(&config.llm).context("Failed to build chat client")?);
    info!("Chat model: {}", chat.model());

    let collaborators = Collaborators::new(Arc::new(KeywordGuard::default()), chat.clone(), chat);
    let event_bus = EventBus::new(100);
    let bind_addr = config.bind_addr.clone();
    let service = Arc::new(CompanionService::new(config, store, event_bus, collaborators));

    let app = build_router(AppState::new(Arc::clone(&service))).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    info!("Listening on http://{}", bind_addr);
    info!("Health check: http://{}/health", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let closed = service.shutdown().await;
    info!("Finalized {} open session(s), shutdown complete", closed);
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
