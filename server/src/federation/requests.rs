//! Cross-domain requests (friend requests, group invites).
//!
//! A request lives on both ends: the sender's domain stores it with
//! `local = true`, the receiver's with `local = false`. Either side may
//! withdraw it, which removes the row on both.

use tracing::{info, warn};
use uuid::Uuid;

use super::envelope::Envelope;
use super::events::{RequestCreate, RequestRemove, SyncResponse, SyncStatus};
use super::registry::{EventContext, EventRegistry};
use crate::error::{FederationError, FederationResult};
use crate::models::{user_domain, Request, RequestType};
use crate::state::{AppState, SharedState};
use crate::validation::validate_user_id;

pub fn register_handlers(registry: &mut EventRegistry<SharedState>) {
    registry.register(handle_request_create);
    registry.register(handle_request_remove);
}

fn is_local(state: &AppState, user_id: &str) -> bool {
    user_domain(user_id) == Some(state.config.domain.as_str())
}

/// Create a request from a local user. A remote receiver's domain has to
/// accept it before anything is stored here.
pub async fn send_request(
    state: &AppState,
    sender: &str,
    receiver: &str,
    request_type: RequestType,
    group_id: Option<&str>,
) -> FederationResult<Request> {
    validate_user_id(sender).map_err(FederationError::Validation)?;
    validate_user_id(receiver).map_err(FederationError::Validation)?;
    if !is_local(state, sender) {
        return Err(FederationError::validation(format!(
            "{} is not a user of this domain",
            sender
        )));
    }
    if request_type == RequestType::Group && group_id.is_none() {
        return Err(FederationError::validation("group request without groupId"));
    }

    let request = Request {
        id: Uuid::now_v7().to_string(),
        sender: sender.to_string(),
        receiver: receiver.to_string(),
        request_type,
        group_id: group_id.map(str::to_string),
        local: true,
    };

    if let Some(domain) = user_domain(receiver).filter(|_| !is_local(state, receiver)) {
        let envelope = Envelope::new(&RequestCreate {
            id: request.id.clone(),
            sender: request.sender.clone(),
            receiver: request.receiver.clone(),
            request_type,
            group_id: request.group_id.clone(),
        })?;
        state.client.send_to(domain, &envelope).await?;
    }

    state.db.insert_request(&request).await?;
    info!(
        "Federation: {} request {} from {} to {}",
        request_type.as_str(),
        request.id,
        sender,
        receiver
    );
    Ok(request)
}

/// Withdraw or answer a request. The other party's domain is told about it;
/// a failed notification is logged and does not bring the row back.
pub async fn remove_request(state: &AppState, id: &str) -> FederationResult<Request> {
    let request = state
        .db
        .get_request(id)
        .await?
        .ok_or_else(|| FederationError::not_found(format!("request {}", id)))?;
    state.db.delete_request(id).await?;

    let remote = [&request.sender, &request.receiver]
        .into_iter()
        .filter(|user| !is_local(state, user))
        .filter_map(|user| user_domain(user));
    let envelope = Envelope::new(&RequestRemove { id: id.to_string() })?;
    for delivery in state.client.send(&envelope, remote).await {
        if let Err(e) = delivery.result {
            warn!(
                "Federation: {} was not told that request {} is gone: {}",
                delivery.domain, id, e
            );
        }
    }

    info!("Federation: removed request {}", id);
    Ok(request)
}

async fn handle_request_create(
    state: SharedState,
    ctx: EventContext,
    payload: RequestCreate,
) -> FederationResult<SyncResponse> {
    if user_domain(&payload.sender) != Some(ctx.origin.as_str()) {
        return Err(FederationError::authorization(format!(
            "{} cannot send requests for {}",
            ctx.origin, payload.sender
        )));
    }
    if !is_local(&state, &payload.receiver) {
        return Err(FederationError::validation(format!(
            "{} is not a user of this domain",
            payload.receiver
        )));
    }

    let request = Request {
        id: payload.id,
        sender: payload.sender,
        receiver: payload.receiver,
        request_type: payload.request_type,
        group_id: payload.group_id,
        local: false,
    };
    if !state.db.insert_request(&request).await? {
        return Ok(SyncResponse {
            status: SyncStatus::Ignored,
        });
    }
    info!(
        "Federation: received {} request {} from {} for {}",
        request.request_type.as_str(),
        request.id,
        request.sender,
        request.receiver
    );
    Ok(SyncResponse {
        status: SyncStatus::Created,
    })
}

async fn handle_request_remove(
    state: SharedState,
    ctx: EventContext,
    payload: RequestRemove,
) -> FederationResult<SyncResponse> {
    let Some(request) = state.db.get_request(&payload.id).await? else {
        return Ok(SyncResponse {
            status: SyncStatus::Ignored,
        });
    };
    let origin = Some(ctx.origin.as_str());
    if user_domain(&request.sender) != origin && user_domain(&request.receiver) != origin {
        return Err(FederationError::authorization(format!(
            "{} is not a party to request {}",
            ctx.origin, payload.id
        )));
    }

    state.db.delete_request(&payload.id).await?;
    info!("Federation: request {} withdrawn by {}", payload.id, ctx.origin);
    Ok(SyncResponse {
        status: SyncStatus::Deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;

    async fn state() -> SharedState {
        let config = FederationConfig {
            scheme: "http".into(),
            request_timeout_secs: 2,
            ..FederationConfig::for_domain("b.example")
        };
        AppState::new_in_memory(config).await.unwrap()
    }

    fn ctx(origin: &str) -> EventContext {
        EventContext {
            origin: origin.into(),
            event_id: Uuid::now_v7().to_string(),
        }
    }

    fn friend_request(id: &str, sender: &str) -> RequestCreate {
        RequestCreate {
            id: id.into(),
            sender: sender.into(),
            receiver: "bob@b.example".into(),
            request_type: RequestType::Friend,
            group_id: None,
        }
    }

    #[tokio::test]
    async fn test_inbound_request_is_stored_once() {
        let state = state().await;

        let first = handle_request_create(
            state.clone(),
            ctx("a.example"),
            friend_request("r1", "alice@a.example"),
        )
        .await
        .unwrap();
        assert_eq!(first.status, SyncStatus::Created);
        let again = handle_request_create(
            state.clone(),
            ctx("a.example"),
            friend_request("r1", "alice@a.example"),
        )
        .await
        .unwrap();
        assert_eq!(again.status, SyncStatus::Ignored);

        let stored = state.db.get_request("r1").await.unwrap().unwrap();
        assert!(!stored.local);
        assert_eq!(stored.sender, "alice@a.example");
    }

    #[tokio::test]
    async fn test_inbound_request_must_come_from_sender_domain() {
        let state = state().await;

        let err = handle_request_create(
            state.clone(),
            ctx("evil.example"),
            friend_request("r1", "alice@a.example"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FederationError::Authorization(_)));
        assert!(state.db.get_request("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_parties_may_withdraw() {
        let state = state().await;
        handle_request_create(
            state.clone(),
            ctx("a.example"),
            friend_request("r1", "alice@a.example"),
        )
        .await
        .unwrap();

        let err = handle_request_remove(
            state.clone(),
            ctx("evil.example"),
            RequestRemove { id: "r1".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FederationError::Authorization(_)));

        let removed = handle_request_remove(
            state.clone(),
            ctx("a.example"),
            RequestRemove { id: "r1".into() },
        )
        .await
        .unwrap();
        assert_eq!(removed.status, SyncStatus::Deleted);

        let gone = handle_request_remove(
            state.clone(),
            ctx("a.example"),
            RequestRemove { id: "r1".into() },
        )
        .await
        .unwrap();
        assert_eq!(gone.status, SyncStatus::Ignored);
    }

    #[tokio::test]
    async fn test_send_request_between_local_users() {
        let state = state().await;

        let request = send_request(&state, "bob@b.example", "carol@b.example", RequestType::Friend, None)
            .await
            .unwrap();
        assert!(request.local);
        assert_eq!(state.db.get_requests_for_user("carol@b.example").await.unwrap().len(), 1);

        remove_request(&state, &request.id).await.unwrap();
        assert!(state.db.get_request(&request.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_request_to_unreachable_domain_stores_nothing() {
        let state = state().await;

        let err = send_request(&state, "bob@b.example", "dave@127.0.0.1:1", RequestType::Friend, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Transport(_)));
        assert!(state.db.get_requests_for_user("bob@b.example").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_request_requires_local_sender() {
        let state = state().await;

        let err = send_request(&state, "alice@a.example", "bob@b.example", RequestType::Friend, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));
    }
}
