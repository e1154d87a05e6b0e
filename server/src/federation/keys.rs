//! Key manager: local Ed25519 signing keys and the remote key cache.
//!
//! The local key is rotated once it gets within the configured margin of its
//! expiry. Rotated-out keys stay in the table and stay published until their
//! own expiry, so signatures already in flight keep verifying.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::header::{format_expire, parse_expire, FederationAuth};
use super::KEY_PATH;
use crate::config::FederationConfig;
use crate::db::Database;
use crate::error::{FederationError, FederationResult};
use crate::models::{KeyResponse, RemoteServerKey, ServerKey};

/// Short, stable identifier of a public key for log lines.
pub fn fingerprint(public_key: &str) -> String {
    let hash = Sha256::digest(public_key.as_bytes());
    hex::encode(hash)[..16].to_string()
}

/// Sign `data` with a stored key; returns the base64 signature.
pub fn sign_bytes(key: &ServerKey, data: &[u8]) -> Result<String> {
    let seed = STANDARD
        .decode(&key.private_key)
        .context("Corrupt signing key encoding")?;
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| anyhow::anyhow!("invalid signing key length"))?;
    let signing_key = SigningKey::from_bytes(&seed);
    Ok(STANDARD.encode(signing_key.sign(data).to_bytes()))
}

/// Verify a base64 signature against a base64 public key. Any decoding
/// problem counts as a failed verification.
pub fn verify_signature(public_key: &str, data: &[u8], signature: &str) -> bool {
    let Some(verifying_key) = decode_public_key(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = STANDARD.decode(signature) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    verifying_key
        .verify(data, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

fn decode_public_key(public_key: &str) -> Option<VerifyingKey> {
    let bytes = STANDARD.decode(public_key).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

pub struct KeyManager {
    db: Database,
    config: Arc<FederationConfig>,
    http: reqwest::Client,
    current: RwLock<Option<ServerKey>>,
    rotation: Mutex<()>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("domain", &self.config.domain)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    pub fn new(db: Database, config: Arc<FederationConfig>, http: reqwest::Client) -> Self {
        Self {
            db,
            config,
            http,
            current: RwLock::new(None),
            rotation: Mutex::new(()),
        }
    }

    // ── Local keys ──

    /// Newest signing key, rotated first if it is missing or about to expire.
    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub async fn current_key(&self) -> Result<ServerKey> {
        self.current_key_at(Utc::now().timestamp()).await
    }

    /// [`Self::current_key`] evaluated at an explicit clock.
    pub async fn current_key_at(&self, now: i64) -> Result<ServerKey> {
        if let Some(key) = self.current.read().await.as_ref() {
            if self.is_fresh(key, now) {
                return Ok(key.clone());
            }
        }

        // Concurrent callers queue here; the first one rotates.
        let _guard = self.rotation.lock().await;

        if let Some(key) = self.current.read().await.as_ref() {
            if self.is_fresh(key, now) {
                return Ok(key.clone());
            }
        }
        if let Some(key) = self.db.newest_server_key().await? {
            if self.is_fresh(&key, now) {
                *self.current.write().await = Some(key.clone());
                return Ok(key);
            }
        }

        let key = self.generate_key(now);
        self.db.insert_server_key(&key).await?;
        info!(
            "Federation: generated signing key {} valid until {}",
            fingerprint(&key.public_key),
            key.expires_at
        );
        *self.current.write().await = Some(key.clone());
        Ok(key)
    }

    /// Key served at the key endpoint: the still-valid key with exactly the
    /// requested expiry, or the current key when no expiry is given.
    pub async fn published_key(&self, expire: Option<i64>) -> Result<Option<ServerKey>> {
        let now = Utc::now().timestamp();
        match expire {
            Some(expires_at) => Ok(self
                .db
                .server_key_by_expiry(expires_at)
                .await?
                .filter(|key| key.expires_at > now)),
            None => self.current_key_at(now).await.map(Some),
        }
    }

    /// Sign a request body with the current key and build its header.
    pub async fn sign_body(&self, body: &[u8]) -> Result<FederationAuth> {
        let key = self.current_key().await?;
        let signature = sign_bytes(&key, body)?;
        Ok(FederationAuth::new(
            signature,
            key.expires_at,
            self.config.domain.clone(),
        )?)
    }

    fn is_fresh(&self, key: &ServerKey, now: i64) -> bool {
        key.expires_at - self.config.key_rotation_margin_secs as i64 > now
    }

    fn generate_key(&self, now: i64) -> ServerKey {
        let signing_key = SigningKey::generate(&mut OsRng);
        ServerKey {
            public_key: STANDARD.encode(signing_key.verifying_key().to_bytes()),
            private_key: STANDARD.encode(signing_key.to_bytes()),
            issued_at: now,
            expires_at: now + self.config.key_validity_secs as i64,
        }
    }

    // ── Remote keys ──

    /// Cached key of `domain` with the given expiry, fetching it on a miss.
    /// The boolean is true when the key came from the cache. Fetched keys are
    /// not cached here; the caller caches them once a signature verifies.
    pub async fn resolve_remote_key(
        &self,
        domain: &str,
        expire: &DateTime<Utc>,
    ) -> FederationResult<(RemoteServerKey, bool)> {
        if let Some(key) = self.db.get_remote_key(domain, expire.timestamp()).await? {
            return Ok((key, true));
        }
        let key = self.fetch_remote_key(domain, expire).await?;
        Ok((key, false))
    }

    /// Ask `domain` for its key with the given expiry.
    pub async fn fetch_remote_key(
        &self,
        domain: &str,
        expire: &DateTime<Utc>,
    ) -> FederationResult<RemoteServerKey> {
        let url = self.config.peer_url(domain, KEY_PATH);
        let expire_str = format_expire(expire);
        debug!("Federation: fetching key of {} expiring {}", domain, expire_str);

        let response = self
            .http
            .get(&url)
            .query(&[("expire", expire_str.as_str())])
            .timeout(self.config.key_fetch_timeout())
            .send()
            .await
            .map_err(|e| {
                warn!("Federation: key fetch from {} failed: {}", domain, e);
                FederationError::Authentication(format!("could not fetch key of {}", domain))
            })?;

        if !response.status().is_success() {
            return Err(FederationError::Authentication(format!(
                "{} has no key expiring {} ({})",
                domain,
                expire_str,
                response.status()
            )));
        }

        let body: KeyResponse = response.json().await.map_err(|e| {
            FederationError::Authentication(format!("malformed key response from {}: {}", domain, e))
        })?;

        if body.domain != domain {
            return Err(FederationError::Authentication(format!(
                "key response from {} names domain {}",
                domain, body.domain
            )));
        }
        if parse_expire(&body.expire).map(|e| e.timestamp()) != Some(expire.timestamp()) {
            return Err(FederationError::Authentication(format!(
                "key response from {} has a different expiry",
                domain
            )));
        }
        if decode_public_key(&body.public_key).is_none() {
            return Err(FederationError::Authentication(format!(
                "key response from {} carries an invalid key",
                domain
            )));
        }

        Ok(RemoteServerKey {
            domain: domain.to_string(),
            public_key: body.public_key,
            expires_at: expire.timestamp(),
            fetched_at: Utc::now().timestamp(),
        })
    }

    pub async fn cache_remote_key(&self, key: &RemoteServerKey) -> Result<()> {
        self.db.insert_remote_key_if_absent(key).await?;
        info!(
            "Federation: cached key {} of {}",
            fingerprint(&key.public_key),
            key.domain
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> KeyManager {
        let db = Database::new_in_memory().await.unwrap();
        let config = FederationConfig {
            key_validity_secs: 1000,
            key_rotation_margin_secs: 100,
            ..FederationConfig::for_domain("a.example")
        };
        KeyManager::new(db, Arc::new(config), reqwest::Client::new())
    }

    #[test]
    fn test_sign_and_verify() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let key = ServerKey {
            public_key: STANDARD.encode(signing_key.verifying_key().to_bytes()),
            private_key: STANDARD.encode(signing_key.to_bytes()),
            issued_at: 0,
            expires_at: 1,
        };
        let signature = sign_bytes(&key, b"{\"event\":\"x\"}").unwrap();

        assert!(verify_signature(&key.public_key, b"{\"event\":\"x\"}", &signature));
        assert!(!verify_signature(&key.public_key, b"{\"event\":\"y\"}", &signature));
        assert!(!verify_signature("not-base64!", b"{\"event\":\"x\"}", &signature));
        assert!(!verify_signature(&key.public_key, b"{\"event\":\"x\"}", "AAAA"));
    }

    #[test]
    fn test_fingerprint_is_short_and_stable() {
        assert_eq!(fingerprint("abc").len(), 16);
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }

    #[tokio::test]
    async fn test_current_key_is_reused_while_fresh() {
        let keys = manager().await;
        let first = keys.current_key_at(10_000).await.unwrap();
        let again = keys.current_key_at(10_500).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.expires_at, 11_000);
    }

    #[tokio::test]
    async fn test_rotation_inside_margin() {
        let keys = manager().await;
        let old = keys.current_key_at(10_000).await.unwrap();
        let new = keys.current_key_at(10_950).await.unwrap();

        assert_ne!(old.public_key, new.public_key);
        assert_eq!(new.expires_at, 11_950);
        assert_eq!(
            keys.db.server_key_by_expiry(old.expires_at).await.unwrap(),
            Some(old)
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_rotate_once() {
        let keys = Arc::new(manager().await);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let keys = keys.clone();
                tokio::spawn(async move { keys.current_key_at(10_000).await.unwrap() })
            })
            .collect();

        let mut public_keys = std::collections::BTreeSet::new();
        for handle in handles {
            public_keys.insert(handle.await.unwrap().public_key);
        }
        assert_eq!(public_keys.len(), 1);
    }

    #[tokio::test]
    async fn test_published_key_by_expiry() {
        let keys = manager().await;
        let now = Utc::now().timestamp();
        let current = keys.current_key_at(now).await.unwrap();

        let published = keys.published_key(Some(current.expires_at)).await.unwrap();
        assert_eq!(published, Some(current.clone()));
        assert_eq!(keys.published_key(Some(current.expires_at + 1)).await.unwrap(), None);
        assert_eq!(keys.published_key(None).await.unwrap(), Some(current));
    }

    #[tokio::test]
    async fn test_signed_body_verifies_with_published_key() {
        let keys = manager().await;
        let auth = keys.sign_body(b"payload").await.unwrap();
        let key = keys.published_key(Some(auth.expires_at())).await.unwrap().unwrap();

        assert_eq!(auth.origin, "a.example");
        assert!(verify_signature(&key.public_key, b"payload", &auth.signature));
    }
}
