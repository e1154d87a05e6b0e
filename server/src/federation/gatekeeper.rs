//! Authentication gate for inbound federation requests.
//!
//! A request passes when its `Authorization` header parses, the key it names
//! has not expired, the body verifies against the origin's key for that
//! expiry, and `(origin, eventId)` has not been processed before. The event
//! id is recorded only after the handler succeeded, so a failed attempt can
//! be retried with the same id.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::Utc;
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::header::FederationAuth;
use super::keys::{verify_signature, KeyManager};
use crate::db::Database;
use crate::error::{FederationError, FederationResult};
use crate::validation::validate_domain;

/// An authenticated, not yet processed event.
#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub origin: String,
    pub event_id: String,
    pub envelope: Envelope,
}

pub async fn authenticate(
    keys: &KeyManager,
    db: &Database,
    headers: &HeaderMap,
    body: &[u8],
) -> FederationResult<VerifiedRequest> {
    let raw = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| FederationError::Authentication("missing Authorization header".into()))?
        .to_str()
        .map_err(|_| FederationError::Authentication("non-ASCII Authorization header".into()))?;

    let auth = FederationAuth::parse(raw)?;
    validate_domain(&auth.origin).map_err(FederationError::Authentication)?;
    let now = Utc::now();
    if auth.is_expired_at(now) {
        return Err(FederationError::Authentication(format!(
            "signing key of {} has expired",
            auth.origin
        )));
    }
    // A key outliving the replay window would let pruned event ids be replayed.
    if auth.expire.timestamp() > keys.config().max_accepted_expire(now.timestamp()) {
        return Err(FederationError::Authentication(format!(
            "signing key of {} expires {} beyond the replay window",
            auth.origin, auth.expire
        )));
    }

    let (key, cached) = keys.resolve_remote_key(&auth.origin, &auth.expire).await?;
    if !verify_signature(&key.public_key, body, &auth.signature) {
        warn!("Federation: bad signature from {}", auth.origin);
        return Err(FederationError::Authentication(format!(
            "signature from {} does not verify",
            auth.origin
        )));
    }
    if !cached {
        keys.cache_remote_key(&key).await?;
    }

    let envelope = Envelope::from_slice(body)?;
    if db.event_id_exists(&auth.origin, &envelope.event_id).await? {
        debug!(
            "Federation: replayed event {} from {}",
            envelope.event_id, auth.origin
        );
        return Err(FederationError::Replay(envelope.event_id));
    }

    Ok(VerifiedRequest {
        origin: auth.origin,
        event_id: envelope.event_id.clone(),
        envelope,
    })
}

/// Remember a successfully handled event.
///
/// The replay check in [`authenticate`] and this insert are not atomic, so two
/// concurrent deliveries of one event can both reach the handler. Handlers
/// stay idempotent under that race: sync events go through the token
/// compare-and-set and inserts are insert-if-absent.
pub async fn record_event(db: &Database, request: &VerifiedRequest) -> FederationResult<()> {
    let inserted = db
        .insert_event_id_if_absent(&request.origin, &request.event_id)
        .await?;
    if !inserted {
        debug!(
            "Federation: event {} from {} was handled concurrently",
            request.event_id, request.origin
        );
    }
    Ok(())
}
