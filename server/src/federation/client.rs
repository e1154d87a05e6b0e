//! Outbound federation client.
//!
//! An envelope is serialised and signed once, then POSTed to every target
//! domain concurrently. Each delivery has its own timeout and its own
//! outcome; one slow or broken peer never fails the others. No retries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::envelope::Envelope;
use super::events::SnapshotRequest;
use super::keys::KeyManager;
use super::EVENT_PATH;
use crate::config::FederationConfig;
use crate::error::{FederationError, FederationResult};
use crate::models::{ErrorResponse, GroupSnapshot};

/// Outcome of delivering one envelope to one domain.
#[derive(Debug)]
pub struct Delivery {
    pub domain: String,
    pub result: FederationResult<Value>,
}

impl Delivery {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct FederationClient {
    http: reqwest::Client,
    config: Arc<FederationConfig>,
    keys: Arc<KeyManager>,
}

impl FederationClient {
    pub fn new(http: reqwest::Client, config: Arc<FederationConfig>, keys: Arc<KeyManager>) -> Self {
        Self { http, config, keys }
    }

    /// Deliver `envelope` to every distinct domain in `domains` except our
    /// own. Returns one [`Delivery`] per contacted domain.
    pub async fn send<I, D>(&self, envelope: &Envelope, domains: I) -> Vec<Delivery>
    where
        I: IntoIterator<Item = D>,
        D: AsRef<str>,
    {
        let targets: BTreeSet<String> = domains
            .into_iter()
            .map(|d| d.as_ref().to_string())
            .filter(|d| !d.is_empty() && *d != self.config.domain)
            .collect();
        if targets.is_empty() {
            return Vec::new();
        }

        let (body, auth) = match self.sign(envelope).await {
            Ok(signed) => signed,
            Err(e) => {
                warn!("Federation: could not sign {}: {}", envelope.event, e);
                return targets
                    .into_iter()
                    .map(|domain| Delivery {
                        domain,
                        result: Err(FederationError::Internal(anyhow::anyhow!(
                            "signing failed: {}",
                            e
                        ))),
                    })
                    .collect();
            }
        };

        let timeout = self.config.request_timeout();
        let deliveries = join_all(targets.into_iter().map(|domain| {
            let body = body.clone();
            let auth = auth.as_str();
            async move {
                let result = self.post(&domain, body, auth, timeout).await;
                Delivery { domain, result }
            }
        }))
        .await;

        let failed = deliveries.iter().filter(|d| !d.is_ok()).count();
        for delivery in deliveries.iter() {
            if let Err(e) = &delivery.result {
                warn!(
                    "Federation: delivering {} to {} failed: {}",
                    envelope.event, delivery.domain, e
                );
            }
        }
        info!(
            "Federation: sent {} ({}) to {} domain(s), {} failed",
            envelope.event,
            envelope.event_id,
            deliveries.len(),
            failed
        );
        deliveries
    }

    /// Deliver `envelope` to a single domain and return its response body.
    pub async fn send_to(&self, domain: &str, envelope: &Envelope) -> FederationResult<Value> {
        let (body, auth) = self.sign(envelope).await?;
        self.post(domain, body, &auth, self.config.request_timeout())
            .await
    }

    /// One-shot fetch of the authoritative state of a group from its owner.
    pub async fn fetch_snapshot(&self, domain: &str, group_id: &str) -> FederationResult<GroupSnapshot> {
        let envelope = Envelope::new(&SnapshotRequest {
            group_id: group_id.to_string(),
        })?;
        let (body, auth) = self.sign(&envelope).await?;
        let response = self
            .post(domain, body, &auth, self.config.snapshot_timeout())
            .await?;
        serde_json::from_value(response).map_err(|e| {
            FederationError::Transport(format!("malformed snapshot of {} from {}: {}", group_id, domain, e))
        })
    }

    async fn sign(&self, envelope: &Envelope) -> FederationResult<(Vec<u8>, String)> {
        let body = envelope.to_bytes()?;
        let auth = self.keys.sign_body(&body).await?;
        Ok((body, auth.to_string()))
    }

    async fn post(
        &self,
        domain: &str,
        body: Vec<u8>,
        auth: &str,
        timeout: Duration,
    ) -> FederationResult<Value> {
        let url = self.config.peer_url(domain, EVENT_PATH);
        debug!("Federation: POST {}", url);

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, auth)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FederationError::Transport(format!("{}: {}", domain, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorResponse>().await {
                Ok(body) => body.error,
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string(),
            };
            return Err(FederationError::Remote {
                domain: domain.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| FederationError::Transport(format!("malformed response from {}: {}", domain, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::federation::events::GroupCreate;

    async fn client() -> FederationClient {
        let config = Arc::new(FederationConfig {
            scheme: "http".into(),
            request_timeout_secs: 2,
            ..FederationConfig::for_domain("a.example")
        });
        let db = Database::new_in_memory().await.unwrap();
        let http = reqwest::Client::new();
        let keys = Arc::new(KeyManager::new(db, config.clone(), http.clone()));
        FederationClient::new(http, config, keys)
    }

    #[tokio::test]
    async fn test_send_skips_self_and_duplicates() {
        let client = client().await;
        let envelope = Envelope::new(&GroupCreate {
            group_id: "g1".into(),
        })
        .unwrap();

        let deliveries = client
            .send(&envelope, ["a.example", "a.example", ""])
            .await;
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_a_transport_error() {
        let client = client().await;
        let envelope = Envelope::new(&GroupCreate {
            group_id: "g1".into(),
        })
        .unwrap();

        let deliveries = client
            .send(&envelope, ["127.0.0.1:1", "127.0.0.1:1", "a.example"])
            .await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].domain, "127.0.0.1:1");
        assert!(matches!(
            deliveries[0].result,
            Err(FederationError::Transport(_))
        ));
    }
}
