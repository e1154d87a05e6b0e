//! # Group Federation Server
//!
//! Exchanges signed events with other domains and keeps replicas of shared
//! groups consistent with their owning domain.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use groupfed_server::config::{FederationCliArgs, FederationConfig};
use groupfed_server::federation::maintenance::spawn_federation_maintenance;
use groupfed_server::federation::{EVENT_PATH, KEY_PATH};
use groupfed_server::handlers::federation_router;
use groupfed_server::state::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Domain other servers know this one by (overrides the config file)
    #[arg(long)]
    domain: Option<String>,

    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(short = 'd', long, default_value = "groupfed.db")]
    database: String,

    /// Reach peers over plain HTTP. Development only.
    #[arg(long)]
    insecure_http: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FederationConfig::load(path)?,
        None => FederationConfig::default(),
    };
    config.apply_cli(&FederationCliArgs {
        domain: args.domain.clone(),
        insecure_http: args.insecure_http,
    });

    info!("Starting group federation server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Domain: {}", config.domain);
    info!("Bind address: {}:{}", args.host, args.port);
    if config.scheme == "http" {
        warn!("Reaching peers over plain HTTP - only use for development!");
    }

    // Initialize shared state with database
    info!("Initializing database: {}", args.database);
    let state = AppState::new(&args.database, config).await?;
    let key = state.keys.current_key().await?;
    info!(
        "Signing key {} valid until {}",
        groupfed_server::federation::keys::fingerprint(&key.public_key),
        key.expires_at
    );

    spawn_federation_maintenance(state.clone());

    let app = federation_router(state);

    let listener = tokio::net::TcpListener::bind(&format!("{}:{}", args.host, args.port)).await?;
    info!("Server successfully bound to {}:{}", args.host, args.port);
    info!("  POST {}", EVENT_PATH);
    info!("  GET  {}", KEY_PATH);
    info!("  GET  /health");

    axum::serve(listener, app).await?;

    info!("Shutting down server...");
    Ok(())
}
