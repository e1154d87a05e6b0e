//! Owner side of group replication.
//!
//! Every change to an owned group goes through [`publish`]: the mutation is
//! applied locally under the same compare-and-set as on mirrors, then the
//! matching sync event goes to every domain that mirrored the group before
//! the change, and `t.group.create` goes to domains that just gained their
//! first member.
//!
//! The second half of the module handles group actions that member domains
//! send on behalf of their users (join, leave, kick, channel and role
//! management) and serves snapshots to mirrors.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::client::Delivery;
use super::envelope::Envelope;
use super::events::{
    validate_category, validate_channel, validate_role, validate_settings, ChannelCreate,
    ChannelDelete, GroupCreate, GroupDelete, GroupJoin, GroupKick, GroupLeave, RoleAssign,
    RoleUnassign, SnapshotRequest, SyncCategoryAdd, SyncCategoryRemove, SyncChannelAdd,
    SyncChannelRemove, SyncEvent, SyncMemberRoleAdd, SyncMemberRoleRemove, SyncRoleAdd,
    SyncRoleRemove, SyncStatus, SyncUpdate, SyncUserAdd, SyncUserRemove,
};
use super::registry::{EventContext, EventRegistry};
use super::requests::send_request;
use crate::db::ApplyOutcome;
use crate::error::{FederationError, FederationResult};
use crate::models::{
    user_domain, Category, CategoryPermission, Channel, ChannelPermission, Group,
    GroupSettings, GroupSnapshot, GroupType, Member, Request, RequestType, Role, EVERYONE_ROLE,
};
use crate::permissions::{allows, default_everyone_permissions, get_user_permission, Permission};
use crate::state::{AppState, SharedState};
use crate::validation::validate_user_id;

/// Attempts at the compare-and-set before giving up on a busy group.
const MAX_CAS_ATTEMPTS: usize = 3;

/// A change that was applied locally and fanned out.
#[derive(Debug)]
pub struct Published {
    pub event_id: String,
    pub deliveries: Vec<Delivery>,
}

/// Body returned by group action handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl ActionResponse {
    fn applied(published: &Published) -> Self {
        Self {
            status: SyncStatus::Applied,
            event_id: Some(published.event_id.clone()),
            channel_id: None,
        }
    }

    fn ignored() -> Self {
        Self {
            status: SyncStatus::Ignored,
            event_id: None,
            channel_id: None,
        }
    }
}

fn invalid(e: String) -> FederationError {
    FederationError::Validation(e)
}

async fn load_owned(state: &AppState, group_id: &str) -> FederationResult<Group> {
    let group = state
        .db
        .get_group(group_id)
        .await?
        .ok_or_else(|| FederationError::not_found(format!("group {}", group_id)))?;
    if !group.is_owner {
        return Err(FederationError::authorization(format!(
            "group {} is owned by {}",
            group_id, group.domain
        )));
    }
    Ok(group)
}

/// Apply a sync event to an owned group and fan it out. `build` receives the
/// current token and returns the payload to apply and send.
async fn publish<P, F>(state: &AppState, group_id: &str, build: F) -> FederationResult<Published>
where
    P: SyncEvent,
    F: Fn(String) -> P,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let group = load_owned(state, group_id).await?;
        let before_domains = state.db.member_domains(group_id).await?;
        let event_id = Uuid::now_v7().to_string();
        let payload = build(group.before_event_id.clone());

        let outcome = state
            .db
            .apply_group_mutation(group_id, &group.before_event_id, &event_id, &payload.mutation())
            .await?;

        if let ApplyOutcome::Diverged { reason } = outcome {
            let current = state.db.get_group(group_id).await?;
            if current.map(|g| g.before_event_id) == Some(group.before_event_id) {
                // Token did not move, so the mutation itself referenced a missing row.
                return Err(FederationError::not_found(reason));
            }
            debug!(
                "Federation: group {} advanced concurrently, retrying {} (attempt {})",
                group_id,
                P::NAME,
                attempt
            );
            continue;
        }

        let after_domains = state.db.member_domains(group_id).await?;
        let envelope = Envelope::with_id(event_id.clone(), &payload)?;
        let mut deliveries = state.client.send(&envelope, &before_domains).await;

        let gained: Vec<&String> = after_domains.difference(&before_domains).collect();
        if !gained.is_empty() {
            let create = Envelope::new(&GroupCreate {
                group_id: group_id.to_string(),
            })?;
            deliveries.extend(state.client.send(&create, gained).await);
        }

        info!(
            "Federation: published {} for group {} as {}",
            P::NAME,
            group_id,
            event_id
        );
        return Ok(Published {
            event_id,
            deliveries,
        });
    }

    Err(FederationError::Internal(anyhow::anyhow!(
        "group {} kept changing, gave up after {} attempts",
        group_id,
        MAX_CAS_ATTEMPTS
    )))
}

// ── Publisher operations ──

/// Create a group owned by a local user. The group starts with its owner as
/// sole member and an `everyone` role with the default permissions.
pub async fn create_group(
    state: &AppState,
    owner: &str,
    settings: GroupSettings,
) -> FederationResult<GroupSnapshot> {
    validate_user_id(owner).map_err(invalid)?;
    validate_settings(&settings).map_err(invalid)?;
    if user_domain(owner) != Some(state.config.domain.as_str()) {
        return Err(FederationError::validation(format!(
            "{} is not a user of this domain",
            owner
        )));
    }

    let group_id = Uuid::now_v7().to_string();
    let snapshot = GroupSnapshot {
        group: Group {
            group_id: group_id.clone(),
            domain: state.config.domain.clone(),
            name: settings.name,
            description: settings.description,
            icon: settings.icon,
            owner: owner.to_string(),
            group_type: settings.group_type,
            allow_join: settings.allow_join,
            is_owner: true,
            before_event_id: Uuid::now_v7().to_string(),
            invites: vec![],
            requests: vec![],
            bans: vec![],
        },
        members: vec![Member {
            group_id: group_id.clone(),
            user_id: owner.to_string(),
            roles: vec![],
        }],
        roles: vec![Role {
            group_id: group_id.clone(),
            role_id: EVERYONE_ROLE.to_string(),
            name: EVERYONE_ROLE.to_string(),
            color: None,
            permissions: default_everyone_permissions(),
        }],
        channels: vec![],
        categories: vec![],
        channel_permissions: vec![],
        category_permissions: vec![],
    };

    state.db.replace_group(&snapshot).await?;
    info!("Federation: {} created group {}", owner, group_id);
    Ok(snapshot)
}

/// Delete an owned group and tell every mirror to drop it.
pub async fn delete_group(state: &AppState, group_id: &str) -> FederationResult<Vec<Delivery>> {
    load_owned(state, group_id).await?;
    let domains = state.db.member_domains(group_id).await?;

    state.db.delete_group(group_id).await?;
    info!("Federation: deleted group {}", group_id);

    let envelope = Envelope::new(&GroupDelete {
        group_id: group_id.to_string(),
    })?;
    Ok(state.client.send(&envelope, &domains).await)
}

pub async fn update_group(
    state: &AppState,
    group_id: &str,
    settings: GroupSettings,
) -> FederationResult<Published> {
    validate_settings(&settings).map_err(invalid)?;
    publish(state, group_id, |before_event_id| SyncUpdate {
        group_id: group_id.to_string(),
        settings: settings.clone(),
        before_event_id,
    })
    .await
}

pub async fn add_member(
    state: &AppState,
    group_id: &str,
    user_id: &str,
    roles: Vec<String>,
) -> FederationResult<Published> {
    validate_user_id(user_id).map_err(invalid)?;
    let group = load_owned(state, group_id).await?;
    if group.bans.iter().any(|b| b == user_id) {
        return Err(FederationError::authorization(format!(
            "{} is banned from group {}",
            user_id, group_id
        )));
    }
    if state.db.get_member(group_id, user_id).await?.is_some() {
        return Err(FederationError::validation(format!(
            "{} is already a member of group {}",
            user_id, group_id
        )));
    }
    for role_id in &roles {
        if role_id != EVERYONE_ROLE && state.db.get_role(group_id, role_id).await?.is_none() {
            return Err(FederationError::not_found(format!("role {}", role_id)));
        }
    }

    let published = publish(state, group_id, |before_event_id| SyncUserAdd {
        group_id: group_id.to_string(),
        user_id: user_id.to_string(),
        roles: roles.clone(),
        before_event_id,
    })
    .await?;

    // A used invite is spent.
    let group = load_owned(state, group_id).await?;
    if group.invites.iter().any(|i| i == user_id) {
        let invites: Vec<String> = group.invites.into_iter().filter(|i| i != user_id).collect();
        state
            .db
            .update_group_lists(group_id, &invites, &group.requests, &group.bans)
            .await?;
    }
    Ok(published)
}

pub async fn remove_member(
    state: &AppState,
    group_id: &str,
    user_id: &str,
) -> FederationResult<Published> {
    let group = load_owned(state, group_id).await?;
    if group.owner == user_id {
        return Err(FederationError::validation(format!(
            "{} owns group {} and cannot be removed",
            user_id, group_id
        )));
    }
    if state.db.get_member(group_id, user_id).await?.is_none() {
        return Err(FederationError::not_found(format!("member {}", user_id)));
    }

    publish(state, group_id, |before_event_id| SyncUserRemove {
        group_id: group_id.to_string(),
        user_id: user_id.to_string(),
        before_event_id,
    })
    .await
}

/// Ban a user, removing them first if they are a member.
pub async fn ban_member(
    state: &AppState,
    group_id: &str,
    user_id: &str,
) -> FederationResult<Option<Published>> {
    validate_user_id(user_id).map_err(invalid)?;
    let group = load_owned(state, group_id).await?;
    if group.owner == user_id {
        return Err(FederationError::validation(format!(
            "{} owns group {} and cannot be banned",
            user_id, group_id
        )));
    }

    let published = if state.db.get_member(group_id, user_id).await?.is_some() {
        Some(remove_member(state, group_id, user_id).await?)
    } else {
        None
    };

    let group = load_owned(state, group_id).await?;
    let mut bans = group.bans;
    if !bans.iter().any(|b| b == user_id) {
        bans.push(user_id.to_string());
    }
    let invites: Vec<String> = group.invites.into_iter().filter(|i| i != user_id).collect();
    state
        .db
        .update_group_lists(group_id, &invites, &group.requests, &bans)
        .await?;
    info!("Federation: {} banned from group {}", user_id, group_id);
    Ok(published)
}

/// Invite a user on behalf of a local member holding `CREATE_INVITE`. The
/// invitee's domain receives a group request.
pub async fn invite_user(
    state: &AppState,
    group_id: &str,
    inviter: &str,
    user_id: &str,
) -> FederationResult<Request> {
    validate_user_id(user_id).map_err(invalid)?;
    let group = load_owned(state, group_id).await?;
    let permissions = get_user_permission(&state.db, inviter, group_id, None).await?;
    if !allows(&permissions, Permission::CreateInvite) {
        return Err(FederationError::authorization(format!(
            "{} may not invite to group {}",
            inviter, group_id
        )));
    }
    if group.bans.iter().any(|b| b == user_id) {
        return Err(FederationError::authorization(format!(
            "{} is banned from group {}",
            user_id, group_id
        )));
    }
    if state.db.get_member(group_id, user_id).await?.is_some() {
        return Err(FederationError::validation(format!(
            "{} is already a member of group {}",
            user_id, group_id
        )));
    }

    let request = send_request(state, inviter, user_id, RequestType::Group, Some(group_id)).await?;

    let mut invites = group.invites;
    if !invites.iter().any(|i| i == user_id) {
        invites.push(user_id.to_string());
    }
    state
        .db
        .update_group_lists(group_id, &invites, &group.requests, &group.bans)
        .await?;
    Ok(request)
}

pub async fn put_role(state: &AppState, group_id: &str, role: Role) -> FederationResult<Published> {
    validate_role(group_id, &role).map_err(invalid)?;
    publish(state, group_id, |before_event_id| SyncRoleAdd {
        group_id: group_id.to_string(),
        role: role.clone(),
        before_event_id,
    })
    .await
}

pub async fn remove_role(
    state: &AppState,
    group_id: &str,
    role_id: &str,
) -> FederationResult<Published> {
    if role_id == EVERYONE_ROLE {
        return Err(FederationError::validation("the everyone role cannot be removed"));
    }
    if state.db.get_role(group_id, role_id).await?.is_none() {
        return Err(FederationError::not_found(format!("role {}", role_id)));
    }
    publish(state, group_id, |before_event_id| SyncRoleRemove {
        group_id: group_id.to_string(),
        role_id: role_id.to_string(),
        before_event_id,
    })
    .await
}

pub async fn assign_role(
    state: &AppState,
    group_id: &str,
    user_id: &str,
    role_id: &str,
) -> FederationResult<Published> {
    if role_id == EVERYONE_ROLE {
        return Err(FederationError::validation("everyone is held implicitly"));
    }
    if state.db.get_role(group_id, role_id).await?.is_none() {
        return Err(FederationError::not_found(format!("role {}", role_id)));
    }
    if state.db.get_member(group_id, user_id).await?.is_none() {
        return Err(FederationError::not_found(format!("member {}", user_id)));
    }
    publish(state, group_id, |before_event_id| SyncMemberRoleAdd {
        group_id: group_id.to_string(),
        user_id: user_id.to_string(),
        role_id: role_id.to_string(),
        before_event_id,
    })
    .await
}

pub async fn unassign_role(
    state: &AppState,
    group_id: &str,
    user_id: &str,
    role_id: &str,
) -> FederationResult<Published> {
    if state.db.get_member(group_id, user_id).await?.is_none() {
        return Err(FederationError::not_found(format!("member {}", user_id)));
    }
    publish(state, group_id, |before_event_id| SyncMemberRoleRemove {
        group_id: group_id.to_string(),
        user_id: user_id.to_string(),
        role_id: role_id.to_string(),
        before_event_id,
    })
    .await
}

pub async fn put_channel(
    state: &AppState,
    group_id: &str,
    channel: Channel,
    permissions: Vec<ChannelPermission>,
) -> FederationResult<Published> {
    validate_channel(group_id, &channel).map_err(invalid)?;
    if permissions
        .iter()
        .any(|p| p.group_id != group_id || p.channel_id != channel.channel_id)
    {
        return Err(FederationError::validation("permission override does not match the channel"));
    }
    if let Some(category_id) = &channel.category_id {
        if state.db.get_category(group_id, category_id).await?.is_none() {
            return Err(FederationError::not_found(format!("category {}", category_id)));
        }
    }
    publish(state, group_id, |before_event_id| SyncChannelAdd {
        group_id: group_id.to_string(),
        channel: channel.clone(),
        permissions: permissions.clone(),
        before_event_id,
    })
    .await
}

pub async fn remove_channel(
    state: &AppState,
    group_id: &str,
    channel_id: &str,
) -> FederationResult<Published> {
    if state.db.get_channel(group_id, channel_id).await?.is_none() {
        return Err(FederationError::not_found(format!("channel {}", channel_id)));
    }
    publish(state, group_id, |before_event_id| SyncChannelRemove {
        group_id: group_id.to_string(),
        channel_id: channel_id.to_string(),
        before_event_id,
    })
    .await
}

pub async fn put_category(
    state: &AppState,
    group_id: &str,
    category: Category,
    permissions: Vec<CategoryPermission>,
) -> FederationResult<Published> {
    validate_category(group_id, &category).map_err(invalid)?;
    if permissions
        .iter()
        .any(|p| p.group_id != group_id || p.category_id != category.category_id)
    {
        return Err(FederationError::validation("permission override does not match the category"));
    }
    publish(state, group_id, |before_event_id| SyncCategoryAdd {
        group_id: group_id.to_string(),
        category: category.clone(),
        permissions: permissions.clone(),
        before_event_id,
    })
    .await
}

pub async fn remove_category(
    state: &AppState,
    group_id: &str,
    category_id: &str,
) -> FederationResult<Published> {
    if state.db.get_category(group_id, category_id).await?.is_none() {
        return Err(FederationError::not_found(format!("category {}", category_id)));
    }
    publish(state, group_id, |before_event_id| SyncCategoryRemove {
        group_id: group_id.to_string(),
        category_id: category_id.to_string(),
        before_event_id,
    })
    .await
}

// ── Inbound group actions ──

pub fn register_handlers(registry: &mut EventRegistry<SharedState>) {
    registry.register(handle_snapshot_request);
    registry.register(handle_join);
    registry.register(handle_leave);
    registry.register(handle_kick);
    registry.register(handle_channel_create);
    registry.register(handle_channel_delete);
    registry.register(handle_role_assign);
    registry.register(handle_role_unassign);
}

/// A domain may only act for its own users.
fn check_origin(user_id: &str, origin: &str) -> FederationResult<()> {
    if user_domain(user_id) != Some(origin) {
        return Err(FederationError::authorization(format!(
            "{} cannot act for {}",
            origin, user_id
        )));
    }
    Ok(())
}

async fn require_permission(
    state: &AppState,
    group_id: &str,
    actor_id: &str,
    permission: Permission,
) -> FederationResult<()> {
    let granted = get_user_permission(&state.db, actor_id, group_id, None).await?;
    if !allows(&granted, permission) {
        return Err(FederationError::authorization(format!(
            "{} lacks {:?} in group {}",
            actor_id, permission, group_id
        )));
    }
    Ok(())
}

async fn handle_snapshot_request(
    state: SharedState,
    ctx: EventContext,
    payload: SnapshotRequest,
) -> FederationResult<GroupSnapshot> {
    load_owned(&state, &payload.group_id).await?;
    let hosted = state
        .db
        .count_members_from_domain(&payload.group_id, &ctx.origin)
        .await?;
    if hosted == 0 {
        return Err(FederationError::authorization(format!(
            "{} hosts no member of group {}",
            ctx.origin, payload.group_id
        )));
    }
    state
        .db
        .get_group_snapshot(&payload.group_id)
        .await?
        .ok_or_else(|| FederationError::not_found(format!("group {}", payload.group_id)))
}

async fn handle_join(
    state: SharedState,
    ctx: EventContext,
    payload: GroupJoin,
) -> FederationResult<ActionResponse> {
    check_origin(&payload.user_id, &ctx.origin)?;
    let group = load_owned(&state, &payload.group_id).await?;

    if state.db.get_member(&group.group_id, &payload.user_id).await?.is_some() {
        return Ok(ActionResponse::ignored());
    }
    let invited = group.invites.iter().any(|i| i == &payload.user_id);
    let open = group.group_type == GroupType::Public && group.allow_join;
    if !invited && !open {
        return Err(FederationError::authorization(format!(
            "group {} requires an invite",
            group.group_id
        )));
    }

    let published = add_member(&state, &group.group_id, &payload.user_id, vec![]).await?;
    Ok(ActionResponse::applied(&published))
}

async fn handle_leave(
    state: SharedState,
    ctx: EventContext,
    payload: GroupLeave,
) -> FederationResult<ActionResponse> {
    check_origin(&payload.user_id, &ctx.origin)?;
    load_owned(&state, &payload.group_id).await?;

    if state.db.get_member(&payload.group_id, &payload.user_id).await?.is_none() {
        return Ok(ActionResponse::ignored());
    }
    let published = remove_member(&state, &payload.group_id, &payload.user_id).await?;
    Ok(ActionResponse::applied(&published))
}

async fn handle_kick(
    state: SharedState,
    ctx: EventContext,
    payload: GroupKick,
) -> FederationResult<ActionResponse> {
    check_origin(&payload.actor_id, &ctx.origin)?;
    let group = load_owned(&state, &payload.group_id).await?;
    require_permission(&state, &group.group_id, &payload.actor_id, Permission::KickMembers).await?;
    if group.owner == payload.user_id {
        return Err(FederationError::authorization("the owner cannot be kicked"));
    }

    let published = remove_member(&state, &group.group_id, &payload.user_id).await?;
    Ok(ActionResponse::applied(&published))
}

async fn handle_channel_create(
    state: SharedState,
    ctx: EventContext,
    payload: ChannelCreate,
) -> FederationResult<ActionResponse> {
    check_origin(&payload.actor_id, &ctx.origin)?;
    load_owned(&state, &payload.group_id).await?;
    require_permission(&state, &payload.group_id, &payload.actor_id, Permission::ManageChannels)
        .await?;

    let channel = Channel {
        group_id: payload.group_id.clone(),
        channel_id: Uuid::now_v7().to_string(),
        name: payload.name,
        category_id: payload.category_id,
    };
    let channel_id = channel.channel_id.clone();
    let published = put_channel(&state, &payload.group_id, channel, vec![]).await?;
    Ok(ActionResponse {
        channel_id: Some(channel_id),
        ..ActionResponse::applied(&published)
    })
}

async fn handle_channel_delete(
    state: SharedState,
    ctx: EventContext,
    payload: ChannelDelete,
) -> FederationResult<ActionResponse> {
    check_origin(&payload.actor_id, &ctx.origin)?;
    load_owned(&state, &payload.group_id).await?;
    require_permission(&state, &payload.group_id, &payload.actor_id, Permission::ManageChannels)
        .await?;

    let published = remove_channel(&state, &payload.group_id, &payload.channel_id).await?;
    Ok(ActionResponse::applied(&published))
}

async fn handle_role_assign(
    state: SharedState,
    ctx: EventContext,
    payload: RoleAssign,
) -> FederationResult<ActionResponse> {
    check_origin(&payload.actor_id, &ctx.origin)?;
    load_owned(&state, &payload.group_id).await?;
    require_permission(&state, &payload.group_id, &payload.actor_id, Permission::ManageRoles).await?;

    let published =
        assign_role(&state, &payload.group_id, &payload.user_id, &payload.role_id).await?;
    Ok(ActionResponse::applied(&published))
}

async fn handle_role_unassign(
    state: SharedState,
    ctx: EventContext,
    payload: RoleUnassign,
) -> FederationResult<ActionResponse> {
    check_origin(&payload.actor_id, &ctx.origin)?;
    load_owned(&state, &payload.group_id).await?;
    require_permission(&state, &payload.group_id, &payload.actor_id, Permission::ManageRoles).await?;

    let published =
        unassign_role(&state, &payload.group_id, &payload.user_id, &payload.role_id).await?;
    Ok(ActionResponse::applied(&published))
}
