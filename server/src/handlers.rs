//! HTTP handlers for the federation server

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::{FederationError, FederationResult};
use crate::federation::header::{format_expires_at, parse_expire};
use crate::federation::{authenticate, record_event, EventContext, EVENT_PATH, KEY_PATH};
use crate::models::{HealthResponse, KeyResponse};
use crate::state::SharedState;

/// Router with every endpoint this server exposes.
pub fn federation_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(EVENT_PATH, post(event_handler))
        .route(KEY_PATH, get(key_handler))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Health check endpoint
pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        domain: state.config.domain.clone(),
        uptime_seconds: state.uptime(),
    })
}

/// Inbound federation event: authenticate, dispatch, then record the event id.
pub async fn event_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> FederationResult<Json<Value>> {
    let request = authenticate(&state.keys, &state.db, &headers, &body).await?;
    let ctx = EventContext {
        origin: request.origin.clone(),
        event_id: request.event_id.clone(),
    };

    let response = state
        .registry
        .dispatch(state.clone(), ctx, request.envelope.clone())
        .await?;

    record_event(&state.db, &request).await?;
    info!(
        "Federation: handled {} ({}) from {}",
        request.envelope.event, request.event_id, request.origin
    );
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub expire: Option<String>,
}

/// Public key endpoint. With `?expire=` only the key with exactly that expiry
/// is served, so peers can verify headers signed before a rotation.
pub async fn key_handler(
    State(state): State<SharedState>,
    Query(query): Query<KeyQuery>,
) -> FederationResult<Json<KeyResponse>> {
    let expires_at = match query.expire.as_deref() {
        Some(raw) => Some(
            parse_expire(raw)
                .ok_or_else(|| FederationError::validation(format!("invalid expire {:?}", raw)))?
                .timestamp(),
        ),
        None => None,
    };
    debug!("Federation: key requested for expiry {:?}", expires_at);

    let key = state
        .keys
        .published_key(expires_at)
        .await?
        .ok_or_else(|| FederationError::not_found("signing key"))?;
    let expire = format_expires_at(key.expires_at).ok_or_else(|| {
        FederationError::Internal(anyhow::anyhow!("key expiry {} out of range", key.expires_at))
    })?;

    Ok(Json(KeyResponse {
        domain: state.config.domain.clone(),
        public_key: key.public_key,
        expire,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use crate::state::AppState;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    async fn state() -> SharedState {
        AppState::new_in_memory(FederationConfig::for_domain("a.example"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_key_handler_serves_current_key() {
        let state = state().await;
        let Json(body) = key_handler(State(state.clone()), Query(KeyQuery { expire: None }))
            .await
            .unwrap();

        let key = state.keys.current_key().await.unwrap();
        assert_eq!(body.domain, "a.example");
        assert_eq!(body.public_key, key.public_key);
        assert_eq!(parse_expire(&body.expire).unwrap().timestamp(), key.expires_at);
    }

    #[tokio::test]
    async fn test_key_handler_unknown_expiry_is_404() {
        let state = state().await;
        let err = key_handler(
            State(state),
            Query(KeyQuery {
                expire: Some("2030-03-17T17:46:40Z".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_without_header_is_401() {
        let state = state().await;
        let err = event_handler(State(state), HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }
}
