//! HMS External API Gateway Entry Point
//!
//! Runs the signed-request gateway in front of the hospital resource service
//! together with the admin API used to issue and manage client credentials.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default configuration
//! hms-gateway
//!
//! # Run with custom config file
//! hms-gateway --config /etc/hms/gateway.toml
//!
//! # Point at a different resource service and share counters through Redis
//! hms-gateway --upstream http://10.0.0.5:8000 --redis-url redis://cache:6379
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hms_gateway::app::{open_cache, GatewayApp};
use hms_gateway::clock::{Clock, SystemClock};
use hms_gateway::config::{CacheBackend, GatewayConfig};
use hms_gateway::gateway::HttpUpstream;
use hms_gateway::store::GatewayStore;

/// HMS External API Gateway
#[derive(Parser, Debug)]
#[command(name = "hms-gateway")]
#[command(version)]
#[command(about = "Signed-request API gateway for third-party hospital integrations", long_about = None)]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Gateway listen address (overrides config)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Admin API listen address (overrides config)
    #[arg(long)]
    admin_listen: Option<SocketAddr>,

    /// Base URL of the resource service (overrides config)
    #[arg(long)]
    upstream: Option<String>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Use Redis for the shared cache
    #[arg(long)]
    redis_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };

    if let Some(addr) = args.listen {
        config.server.listen_addr = addr.to_string();
    }
    if let Some(addr) = args.admin_listen {
        config.server.admin_listen_addr = addr.to_string();
    }
    if let Some(upstream) = &args.upstream {
        config.server.upstream_url = upstream.clone();
    }
    if let Some(db) = &args.db {
        config.storage.database_path = db.clone();
    }
    if let Some(url) = &args.redis_url {
        config.cache.backend = CacheBackend::Redis;
        config.cache.redis_url = url.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting HMS gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = Arc::new(GatewayStore::new(&config.storage.database_path)?);
    let cache = open_cache(&config, clock.clone()).await?;
    info!(
        "Database: {}, cache backend: {:?}",
        config.storage.database_path.display(),
        config.cache.backend
    );

    let upstream = Arc::new(HttpUpstream::new(&config.server.upstream_url));
    info!("Forwarding to {}", config.server.upstream_url);

    let app = GatewayApp::assemble(&config, store, cache, upstream, clock);

    let served = app
        .serve(&config, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await;

    app.logger.flush().await;
    let stats = app.logger.stats();
    info!(
        "Access log flushed: {} written, {} dropped, {} failed",
        stats.written.load(std::sync::atomic::Ordering::Relaxed),
        stats.dropped.load(std::sync::atomic::Ordering::Relaxed),
        stats.failed.load(std::sync::atomic::Ordering::Relaxed)
    );

    served.context("Gateway stopped with an error")?;
    Ok(())
}
