//! Application state shared across handlers

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::config::FederationConfig;
use crate::db::Database;
use crate::federation::{build_registry, EventRegistry, FederationClient, KeyManager};

/// Application state shared across handlers
pub struct AppState {
    /// Database connection for persistent storage
    pub db: Database,
    pub config: Arc<FederationConfig>,
    /// Local signing key and remote key cache
    pub keys: Arc<KeyManager>,
    /// Outbound signed delivery
    pub client: FederationClient,
    /// Inbound event routing, built once at startup
    pub registry: Arc<EventRegistry<SharedState>>,
    /// Server start time
    pub start_time: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db", &"<Database>")
            .field("domain", &self.config.domain)
            .field("registry", &self.registry)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    /// Create new application state with database connection
    pub async fn new(db_path: &str, config: FederationConfig) -> Result<SharedState> {
        config.validate()?;
        let db = Database::new(db_path).await?;
        let config = Arc::new(config);
        let http = reqwest::Client::builder()
            .user_agent(concat!("groupfed/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let keys = Arc::new(KeyManager::new(db.clone(), config.clone(), http.clone()));
        let client = FederationClient::new(http, config.clone(), keys.clone());

        Ok(Arc::new(Self {
            db,
            config,
            keys,
            client,
            registry: Arc::new(build_registry()),
            start_time: Instant::now(),
        }))
    }

    /// Create new application state with in-memory database (for testing)
    pub async fn new_in_memory(config: FederationConfig) -> Result<SharedState> {
        Self::new(":memory:", config).await
    }

    pub fn uptime(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Shared application state type
pub type SharedState = Arc<AppState>;
