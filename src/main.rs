use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber;

use tollgate::admission::{Gatekeeper, TokenBucketLimiter};
use tollgate::config::{StoreConfig, TollgateConfig};
use tollgate::error::Result;
use tollgate::http::HttpServer;
use tollgate::resolver::StaticTokenResolver;
use tollgate::store::{BucketStore, MemoryStore, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "API gateway request-admission filter")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Tollgate Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = match args.config {
        Some(path) => TollgateConfig::from_file(&path)?,
        None => TollgateConfig::default(),
    };
    info!(
        listen_addr = %config.server.listen_addr,
        capacity = config.rate_limit.capacity,
        refill_interval_ms = config.rate_limit.refill_interval_ms,
        fail_policy = ?config.admission.fail_policy,
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;
    let resolver = Arc::new(StaticTokenResolver::new(config.identity.tokens.clone()));
    let limiter = TokenBucketLimiter::new(store, &config.rate_limit, &config.admission);
    let gatekeeper = Arc::new(Gatekeeper::new(resolver, limiter, &config.admission));
    info!("Admission filter initialized");

    let server = HttpServer::new(config.server.listen_addr, gatekeeper);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate Admission Service stopped");
    Ok(())
}

/// Construct the bucket store backend named by the configuration.
async fn build_store(config: &StoreConfig) -> Result<Arc<dyn BucketStore>> {
    match config {
        StoreConfig::Memory => {
            info!("Using in-memory bucket store (single-instance only)");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreConfig::Redis { url } => Ok(Arc::new(RedisStore::connect(url).await?)),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
