//! Group consistency engine: the mirror side of group replication.
//!
//! A sync event names the token its sender had before the change. When it
//! matches the local replica the change is applied and the token moves to the
//! event's id in one transaction. Anything else means the replica drifted,
//! and it is replaced wholesale by a snapshot fetched from the owning domain.

use tracing::{debug, info, warn};

use super::events::{
    GroupCreate, GroupDelete, SyncCategoryAdd, SyncCategoryRemove, SyncChannelAdd,
    SyncChannelRemove, SyncEvent, SyncMemberRoleAdd, SyncMemberRoleRemove, SyncResponse,
    SyncRoleAdd, SyncRoleRemove, SyncStatus, SyncUpdate, SyncUserAdd, SyncUserRemove,
};
use super::registry::{EventContext, EventRegistry};
use crate::db::{ApplyOutcome, GroupMutation};
use crate::error::{FederationError, FederationResult};
use crate::models::{user_domain, Group, GroupSnapshot};
use crate::state::{AppState, SharedState};

pub fn register_handlers(registry: &mut EventRegistry<SharedState>) {
    registry.register(apply_sync::<SyncUserAdd>);
    registry.register(apply_sync::<SyncUserRemove>);
    registry.register(apply_sync::<SyncRoleAdd>);
    registry.register(apply_sync::<SyncRoleRemove>);
    registry.register(apply_sync::<SyncMemberRoleAdd>);
    registry.register(apply_sync::<SyncMemberRoleRemove>);
    registry.register(apply_sync::<SyncChannelAdd>);
    registry.register(apply_sync::<SyncChannelRemove>);
    registry.register(apply_sync::<SyncCategoryAdd>);
    registry.register(apply_sync::<SyncCategoryRemove>);
    registry.register(apply_sync::<SyncUpdate>);
    registry.register(handle_group_create);
    registry.register(handle_group_delete);
}

fn respond(status: SyncStatus) -> FederationResult<SyncResponse> {
    Ok(SyncResponse { status })
}

/// Status for a resync that either refreshed the mirror or dropped it.
fn resynced(snapshot: Option<GroupSnapshot>) -> FederationResult<SyncResponse> {
    match snapshot {
        Some(_) => respond(SyncStatus::Resynced),
        None => respond(SyncStatus::Deleted),
    }
}

/// Only the owning domain may drive a mirror, and an owned group is never
/// driven from outside.
fn check_trust(group: &Group, origin: &str) -> FederationResult<()> {
    if group.is_owner {
        return Err(FederationError::authorization(format!(
            "group {} is owned by this domain",
            group.group_id
        )));
    }
    if group.domain != origin {
        return Err(FederationError::authorization(format!(
            "{} does not own group {}",
            origin, group.group_id
        )));
    }
    Ok(())
}

/// Shared handler for every chain-tracked sync event.
pub async fn apply_sync<P: SyncEvent>(
    state: SharedState,
    ctx: EventContext,
    payload: P,
) -> FederationResult<SyncResponse> {
    let group_id = payload.group_id();
    let mutation = payload.mutation();

    let Some(group) = state.db.get_group(group_id).await? else {
        if matches!(mutation, GroupMutation::RemoveMember { .. }) {
            debug!("Federation: {} for unknown group {}, ignoring", P::NAME, group_id);
            return respond(SyncStatus::Ignored);
        }
        info!(
            "Federation: {} for unknown group {}, bootstrapping from {}",
            P::NAME,
            group_id,
            ctx.origin
        );
        let snapshot = install_snapshot(&state, &ctx.origin, group_id).await?;
        return resynced(snapshot);
    };
    check_trust(&group, &ctx.origin)?;

    let outcome = state
        .db
        .apply_group_mutation(group_id, payload.before_event_id(), &ctx.event_id, &mutation)
        .await?;

    match outcome {
        ApplyOutcome::Applied => {
            debug!(
                "Federation: applied {} to group {} ({} -> {})",
                P::NAME,
                group_id,
                payload.before_event_id(),
                ctx.event_id
            );
            if matches!(mutation, GroupMutation::RemoveMember { .. }) {
                drop_if_orphaned(&state, group_id).await?;
            }
            respond(SyncStatus::Applied)
        }
        ApplyOutcome::Diverged { reason } => {
            // The owner no longer serves a snapshot to a domain without members.
            if let GroupMutation::RemoveMember { user_id } = &mutation {
                if removes_last_local_member(&state, group_id, user_id).await? {
                    state.db.delete_group(group_id).await?;
                    info!(
                        "Federation: group {} diverged on the removal of its last local member {}, dropped mirror",
                        group_id, user_id
                    );
                    return respond(SyncStatus::Deleted);
                }
            }
            warn!(
                "Federation: group {} diverged on {} from {} ({}), resyncing",
                group_id,
                P::NAME,
                ctx.origin,
                reason
            );
            let snapshot = resync_group(&state, &group).await?;
            resynced(snapshot)
        }
    }
}

/// Replace a mirror with the owner's current snapshot. `None` means the
/// mirror was dropped because the owner no longer shares the group with this
/// domain.
pub async fn resync_group(
    state: &AppState,
    group: &Group,
) -> FederationResult<Option<GroupSnapshot>> {
    match install_snapshot(state, &group.domain, &group.group_id).await {
        Err(FederationError::Remote {
            domain,
            status: 401 | 404,
            message,
        }) if domain == group.domain => {
            // A dropped mirror is rebuilt by the next event the owner sends.
            state.db.delete_group(&group.group_id).await?;
            warn!(
                "Federation: {} refused the snapshot of group {} ({}), dropped mirror",
                domain, group.group_id, message
            );
            Ok(None)
        }
        other => other,
    }
}

/// Fetch the snapshot of `group_id` from `owner_domain` and install it as a
/// mirror. A failed fetch leaves local state untouched.
///
/// A mirror is only created when the snapshot lists a member of this domain.
/// An existing mirror whose fresh snapshot lists none is dropped and `None`
/// is returned.
pub async fn install_snapshot(
    state: &AppState,
    owner_domain: &str,
    group_id: &str,
) -> FederationResult<Option<GroupSnapshot>> {
    let mut snapshot = state.client.fetch_snapshot(owner_domain, group_id).await?;

    if snapshot.group.group_id != group_id {
        return Err(FederationError::Transport(format!(
            "{} answered with a snapshot of group {}",
            owner_domain, snapshot.group.group_id
        )));
    }
    if snapshot.group.domain != owner_domain {
        return Err(FederationError::Transport(format!(
            "{} served group {} owned by {}",
            owner_domain, group_id, snapshot.group.domain
        )));
    }

    let existing = state.db.get_group(group_id).await?;
    if let Some(existing) = &existing {
        check_trust(existing, owner_domain)?;
    }

    let hosts_local = snapshot
        .members
        .iter()
        .any(|m| user_domain(&m.user_id) == Some(state.config.domain.as_str()));
    if !hosts_local {
        if existing.is_none() {
            return Err(FederationError::authorization(format!(
                "group {} from {} has no member on {}",
                group_id, owner_domain, state.config.domain
            )));
        }
        state.db.delete_group(group_id).await?;
        info!(
            "Federation: snapshot of group {} from {} has no local members, dropped mirror",
            group_id, owner_domain
        );
        return Ok(None);
    }

    snapshot.group.is_owner = false;
    state.db.replace_group(&snapshot).await?;
    info!(
        "Federation: installed snapshot of group {} from {} at {} ({} members)",
        group_id,
        owner_domain,
        snapshot.token(),
        snapshot.members.len()
    );
    Ok(Some(snapshot))
}

/// Whether removing `user_id` leaves this domain without members of the group.
async fn removes_last_local_member(
    state: &AppState,
    group_id: &str,
    user_id: &str,
) -> FederationResult<bool> {
    let local = state
        .db
        .count_members_from_domain(group_id, &state.config.domain)
        .await?;
    let removed_here = user_domain(user_id) == Some(state.config.domain.as_str())
        && state.db.get_member(group_id, user_id).await?.is_some();
    Ok(local == 0 || (local == 1 && removed_here))
}

/// A mirror is only kept while this domain hosts one of its members.
async fn drop_if_orphaned(state: &AppState, group_id: &str) -> FederationResult<()> {
    let local = state
        .db
        .count_members_from_domain(group_id, &state.config.domain)
        .await?;
    if local == 0 {
        state.db.delete_group(group_id).await?;
        info!(
            "Federation: dropped mirror of group {}, no local members left",
            group_id
        );
    }
    Ok(())
}

/// The owner added a member from this domain: bootstrap or refresh the mirror.
async fn handle_group_create(
    state: SharedState,
    ctx: EventContext,
    payload: GroupCreate,
) -> FederationResult<SyncResponse> {
    if let Some(existing) = state.db.get_group(&payload.group_id).await? {
        check_trust(&existing, &ctx.origin)?;
    }
    match install_snapshot(&state, &ctx.origin, &payload.group_id).await? {
        Some(_) => respond(SyncStatus::Created),
        None => respond(SyncStatus::Deleted),
    }
}

/// The owner deleted the group.
async fn handle_group_delete(
    state: SharedState,
    ctx: EventContext,
    payload: GroupDelete,
) -> FederationResult<SyncResponse> {
    let Some(group) = state.db.get_group(&payload.group_id).await? else {
        return respond(SyncStatus::Ignored);
    };
    check_trust(&group, &ctx.origin)?;

    state.db.delete_group(&payload.group_id).await?;
    info!(
        "Federation: group {} deleted by its owner {}",
        payload.group_id, ctx.origin
    );
    respond(SyncStatus::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use crate::models::{GroupType, Member, Role, EVERYONE_ROLE};
    use crate::permissions::default_everyone_permissions;

    // Owner domain is unreachable in these tests, so any resync fails with a
    // transport error and must leave the replica untouched.
    const OWNER: &str = "127.0.0.1:1";

    async fn mirror_state() -> SharedState {
        let config = FederationConfig {
            scheme: "http".into(),
            snapshot_timeout_secs: 2,
            ..FederationConfig::for_domain("b.example")
        };
        let state = AppState::new_in_memory(config).await.unwrap();
        state
            .db
            .replace_group(&GroupSnapshot {
                group: Group {
                    group_id: "g1".into(),
                    domain: OWNER.into(),
                    name: "Rust".into(),
                    description: None,
                    icon: None,
                    owner: format!("alice@{}", OWNER),
                    group_type: GroupType::Public,
                    allow_join: true,
                    is_owner: false,
                    before_event_id: "e1".into(),
                    invites: vec![],
                    requests: vec![],
                    bans: vec![],
                },
                members: vec![
                    Member {
                        group_id: "g1".into(),
                        user_id: format!("alice@{}", OWNER),
                        roles: vec![],
                    },
                    Member {
                        group_id: "g1".into(),
                        user_id: "bob@b.example".into(),
                        roles: vec![],
                    },
                ],
                roles: vec![Role {
                    group_id: "g1".into(),
                    role_id: EVERYONE_ROLE.into(),
                    name: "everyone".into(),
                    color: None,
                    permissions: default_everyone_permissions(),
                }],
                channels: vec![],
                categories: vec![],
                channel_permissions: vec![],
                category_permissions: vec![],
            })
            .await
            .unwrap();
        state
    }

    fn ctx(origin: &str, event_id: &str) -> EventContext {
        EventContext {
            origin: origin.into(),
            event_id: event_id.into(),
        }
    }

    fn add(user_id: &str, before: &str) -> SyncUserAdd {
        SyncUserAdd {
            group_id: "g1".into(),
            user_id: user_id.into(),
            roles: vec![],
            before_event_id: before.into(),
        }
    }

    #[tokio::test]
    async fn test_matching_event_advances_chain() {
        let state = mirror_state().await;

        let response = apply_sync(state.clone(), ctx(OWNER, "e2"), add("carol@c.example", "e1"))
            .await
            .unwrap();
        assert_eq!(response.status, SyncStatus::Applied);

        let group = state.db.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.before_event_id, "e2");
        assert!(state.db.get_member("g1", "carol@c.example").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_foreign_origin_is_not_trusted() {
        let state = mirror_state().await;

        let err = apply_sync(state.clone(), ctx("evil.example", "e2"), add("carol@c.example", "e1"))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Authorization(_)));
        let group = state.db.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.before_event_id, "e1");
    }

    #[tokio::test]
    async fn test_failed_resync_leaves_replica_untouched() {
        let state = mirror_state().await;

        let err = apply_sync(state.clone(), ctx(OWNER, "e9"), add("carol@c.example", "e0"))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Transport(_)));

        let group = state.db.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.before_event_id, "e1");
        assert!(state.db.get_member("g1", "carol@c.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_local_member_leaving_drops_mirror() {
        let state = mirror_state().await;

        let response = apply_sync(
            state.clone(),
            ctx(OWNER, "e2"),
            SyncUserRemove {
                group_id: "g1".into(),
                user_id: "bob@b.example".into(),
                before_event_id: "e1".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(response.status, SyncStatus::Applied);
        assert!(state.db.get_group("g1").await.unwrap().is_none());

        // A late removal for the dropped group is harmless.
        let response = apply_sync(
            state.clone(),
            ctx(OWNER, "e3"),
            SyncUserRemove {
                group_id: "g1".into(),
                user_id: format!("alice@{}", OWNER),
                before_event_id: "e2".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(response.status, SyncStatus::Ignored);
    }

    #[tokio::test]
    async fn test_diverged_removal_of_last_local_member_drops_mirror() {
        let state = mirror_state().await;

        // Off-chain, and the owner is unreachable: no resync is attempted.
        let response = apply_sync(
            state.clone(),
            ctx(OWNER, "e5"),
            SyncUserRemove {
                group_id: "g1".into(),
                user_id: "bob@b.example".into(),
                before_event_id: "e4".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(response.status, SyncStatus::Deleted);
        assert!(state.db.get_group("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_diverged_removal_of_remote_member_still_resyncs() {
        let state = mirror_state().await;

        let err = apply_sync(
            state.clone(),
            ctx(OWNER, "e5"),
            SyncUserRemove {
                group_id: "g1".into(),
                user_id: format!("alice@{}", OWNER),
                before_event_id: "e4".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FederationError::Transport(_)));
        assert!(state.db.get_group("g1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_group_delete_from_owner() {
        let state = mirror_state().await;

        let err = handle_group_delete(
            state.clone(),
            ctx("evil.example", "d1"),
            GroupDelete {
                group_id: "g1".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FederationError::Authorization(_)));

        let response = handle_group_delete(
            state.clone(),
            ctx(OWNER, "d2"),
            GroupDelete {
                group_id: "g1".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(response.status, SyncStatus::Deleted);
        assert!(state.db.get_group("g1").await.unwrap().is_none());
    }
}
