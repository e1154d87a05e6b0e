//! Federation configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the federation subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Hostname (optionally `host:port`) other domains know us by.
    pub domain: String,
    /// URL scheme used to reach peers. Only tests and local meshes use `http`.
    pub scheme: String,
    /// Lifetime of a freshly generated signing key.
    pub key_validity_secs: u64,
    /// Rotate the signing key once less than this much validity remains.
    pub key_rotation_margin_secs: u64,
    /// Timeout for each outbound event delivery.
    pub request_timeout_secs: u64,
    /// Timeout for fetching a peer's public key on first contact.
    pub key_fetch_timeout_secs: u64,
    /// Timeout for fetching a group snapshot during resync.
    pub snapshot_timeout_secs: u64,
    /// How long processed event ids are kept for replay protection.
    pub event_retention_secs: u64,
    /// Interval of the maintenance task.
    pub maintenance_interval_secs: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            scheme: "https".to_string(),
            key_validity_secs: 7 * 24 * 3600,
            key_rotation_margin_secs: 24 * 3600,
            request_timeout_secs: 10,
            key_fetch_timeout_secs: 5,
            snapshot_timeout_secs: 10,
            event_retention_secs: 7 * 24 * 3600,
            maintenance_interval_secs: 300,
        }
    }
}

/// CLI overrides for the federation config.
#[derive(Debug, Clone, Default)]
pub struct FederationCliArgs {
    pub domain: Option<String>,
    pub insecure_http: bool,
}

impl FederationConfig {
    /// Config for a domain with every other setting at its default.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI arguments into this config (CLI takes precedence).
    pub fn apply_cli(&mut self, args: &FederationCliArgs) {
        if let Some(domain) = &args.domain {
            self.domain = domain.clone();
        }
        if args.insecure_http {
            self.scheme = "http".to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            anyhow::bail!("domain must not be empty");
        }
        if self.scheme != "https" && self.scheme != "http" {
            anyhow::bail!("scheme must be http or https, got {}", self.scheme);
        }
        if self.key_rotation_margin_secs >= self.key_validity_secs {
            anyhow::bail!("key_rotation_margin_secs must be shorter than key_validity_secs");
        }
        // Event ids must outlive every signature that could still carry them.
        if self.event_retention_secs < self.key_validity_secs {
            anyhow::bail!("event_retention_secs must be at least key_validity_secs");
        }
        Ok(())
    }

    /// Latest key expiry accepted on inbound requests evaluated at `now`.
    pub fn max_accepted_expire(&self, now: i64) -> i64 {
        now.saturating_add(i64::try_from(self.event_retention_secs).unwrap_or(i64::MAX))
    }

    /// Base URL of a peer domain.
    pub fn peer_url(&self, domain: &str, path: &str) -> String {
        format!("{}://{}{}", self.scheme, domain, path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn key_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.key_fetch_timeout_secs)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = FederationConfig::default();
        assert_eq!(cfg.scheme, "https");
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_apply_cli() {
        let mut cfg = FederationConfig::default();
        cfg.apply_cli(&FederationCliArgs {
            domain: Some("chat.example".into()),
            insecure_http: true,
        });
        assert_eq!(cfg.domain, "chat.example");
        assert_eq!(
            cfg.peer_url("b.example", "/_federation/v1/event"),
            "http://b.example/_federation/v1/event"
        );
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, r#"{"domain": "a.example", "request_timeout_secs": 3}"#).unwrap();

        let cfg = FederationConfig::load(&path).unwrap();
        assert_eq!(cfg.domain, "a.example");
        assert_eq!(cfg.request_timeout_secs, 3);
        assert_eq!(cfg.snapshot_timeout_secs, 10);
    }

    #[test]
    fn test_rejects_margin_longer_than_validity() {
        let cfg = FederationConfig {
            key_validity_secs: 60,
            key_rotation_margin_secs: 120,
            ..FederationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_retention_shorter_than_key_validity() {
        let cfg = FederationConfig {
            event_retention_secs: 60,
            ..FederationConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = FederationConfig {
            key_validity_secs: 60,
            key_rotation_margin_secs: 10,
            event_retention_secs: 60,
            ..FederationConfig::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_accepted_expire(1_000), 1_060);
    }
}
