//! Event payloads, one struct per event name.
//!
//! Sync events flow owner -> mirror and carry the sender's version token in
//! `beforeEventId`. Group action events flow member domain -> owner and name
//! the acting user, whose home domain must be the sending origin.

use serde::{Deserialize, Serialize};

use super::envelope::EventPayload;
use crate::db::GroupMutation;
use crate::models::{
    Category, CategoryPermission, Channel, ChannelPermission, GroupSettings, Member, Role,
    RequestType,
};
use crate::validation::{
    validate_channel_name, validate_color, validate_description, validate_group_name,
    validate_identifier, validate_label, validate_user_id,
};

/// A chain-tracked mutation of a mirrored group.
pub trait SyncEvent: EventPayload {
    fn group_id(&self) -> &str;
    fn before_event_id(&self) -> &str;
    fn mutation(&self) -> GroupMutation;
}

fn validate_chain(group_id: &str, before_event_id: &str) -> Result<(), String> {
    validate_identifier("Group id", group_id)?;
    validate_identifier("Before event id", before_event_id)
}

pub(crate) fn validate_role(group_id: &str, role: &Role) -> Result<(), String> {
    if role.group_id != group_id {
        return Err(format!("role {} belongs to another group", role.role_id));
    }
    validate_identifier("Role id", &role.role_id)?;
    validate_label("Role", &role.name)?;
    if let Some(color) = &role.color {
        validate_color(color)?;
    }
    Ok(())
}

pub(crate) fn validate_channel(group_id: &str, channel: &Channel) -> Result<(), String> {
    if channel.group_id != group_id {
        return Err(format!("channel {} belongs to another group", channel.channel_id));
    }
    validate_identifier("Channel id", &channel.channel_id)?;
    validate_channel_name(&channel.name)?;
    if let Some(category_id) = &channel.category_id {
        validate_identifier("Category id", category_id)?;
    }
    Ok(())
}

pub(crate) fn validate_category(group_id: &str, category: &Category) -> Result<(), String> {
    if category.group_id != group_id {
        return Err(format!("category {} belongs to another group", category.category_id));
    }
    validate_identifier("Category id", &category.category_id)?;
    validate_label("Category", &category.name)
}

// ── Sync events (owner -> mirror) ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUserAdd {
    pub group_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub before_event_id: String,
}

impl EventPayload for SyncUserAdd {
    const NAME: &'static str = "t.group.sync.user.add";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_user_id(&self.user_id)?;
        self.roles
            .iter()
            .try_for_each(|role_id| validate_identifier("Role id", role_id))
    }
}

impl SyncEvent for SyncUserAdd {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::AddMember(Member {
            group_id: self.group_id.clone(),
            user_id: self.user_id.clone(),
            roles: self.roles.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUserRemove {
    pub group_id: String,
    pub user_id: String,
    pub before_event_id: String,
}

impl EventPayload for SyncUserRemove {
    const NAME: &'static str = "t.group.sync.user.remove";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_user_id(&self.user_id)
    }
}

impl SyncEvent for SyncUserRemove {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::RemoveMember {
            user_id: self.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRoleAdd {
    pub group_id: String,
    pub role: Role,
    pub before_event_id: String,
}

impl EventPayload for SyncRoleAdd {
    const NAME: &'static str = "t.group.sync.role.add";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_role(&self.group_id, &self.role)
    }
}

impl SyncEvent for SyncRoleAdd {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::PutRole(self.role.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRoleRemove {
    pub group_id: String,
    pub role_id: String,
    pub before_event_id: String,
}

impl EventPayload for SyncRoleRemove {
    const NAME: &'static str = "t.group.sync.role.remove";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_identifier("Role id", &self.role_id)
    }
}

impl SyncEvent for SyncRoleRemove {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::RemoveRole {
            role_id: self.role_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMemberRoleAdd {
    pub group_id: String,
    pub user_id: String,
    pub role_id: String,
    pub before_event_id: String,
}

impl EventPayload for SyncMemberRoleAdd {
    const NAME: &'static str = "t.group.sync.member.role.add";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_user_id(&self.user_id)?;
        validate_identifier("Role id", &self.role_id)
    }
}

impl SyncEvent for SyncMemberRoleAdd {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::AssignRole {
            user_id: self.user_id.clone(),
            role_id: self.role_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMemberRoleRemove {
    pub group_id: String,
    pub user_id: String,
    pub role_id: String,
    pub before_event_id: String,
}

impl EventPayload for SyncMemberRoleRemove {
    const NAME: &'static str = "t.group.sync.member.role.remove";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_user_id(&self.user_id)?;
        validate_identifier("Role id", &self.role_id)
    }
}

impl SyncEvent for SyncMemberRoleRemove {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::UnassignRole {
            user_id: self.user_id.clone(),
            role_id: self.role_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChannelAdd {
    pub group_id: String,
    pub channel: Channel,
    #[serde(default)]
    pub permissions: Vec<ChannelPermission>,
    pub before_event_id: String,
}

impl EventPayload for SyncChannelAdd {
    const NAME: &'static str = "t.group.sync.channel.add";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_channel(&self.group_id, &self.channel)?;
        for grant in &self.permissions {
            if grant.group_id != self.group_id || grant.channel_id != self.channel.channel_id {
                return Err("permission override does not match the channel".to_string());
            }
            validate_identifier("Role id", &grant.role_id)?;
        }
        Ok(())
    }
}

impl SyncEvent for SyncChannelAdd {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::PutChannel {
            channel: self.channel.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChannelRemove {
    pub group_id: String,
    pub channel_id: String,
    pub before_event_id: String,
}

impl EventPayload for SyncChannelRemove {
    const NAME: &'static str = "t.group.sync.channel.remove";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_identifier("Channel id", &self.channel_id)
    }
}

impl SyncEvent for SyncChannelRemove {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::RemoveChannel {
            channel_id: self.channel_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCategoryAdd {
    pub group_id: String,
    pub category: Category,
    #[serde(default)]
    pub permissions: Vec<CategoryPermission>,
    pub before_event_id: String,
}

impl EventPayload for SyncCategoryAdd {
    const NAME: &'static str = "t.group.sync.category.add";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_category(&self.group_id, &self.category)?;
        for grant in &self.permissions {
            if grant.group_id != self.group_id || grant.category_id != self.category.category_id {
                return Err("permission override does not match the category".to_string());
            }
            validate_identifier("Role id", &grant.role_id)?;
        }
        Ok(())
    }
}

impl SyncEvent for SyncCategoryAdd {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::PutCategory {
            category: self.category.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCategoryRemove {
    pub group_id: String,
    pub category_id: String,
    pub before_event_id: String,
}

impl EventPayload for SyncCategoryRemove {
    const NAME: &'static str = "t.group.sync.category.remove";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_identifier("Category id", &self.category_id)
    }
}

impl SyncEvent for SyncCategoryRemove {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::RemoveCategory {
            category_id: self.category_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUpdate {
    pub group_id: String,
    pub settings: GroupSettings,
    pub before_event_id: String,
}

impl EventPayload for SyncUpdate {
    const NAME: &'static str = "t.group.sync.update";

    fn validate(&self) -> Result<(), String> {
        validate_chain(&self.group_id, &self.before_event_id)?;
        validate_settings(&self.settings)
    }
}

impl SyncEvent for SyncUpdate {
    fn group_id(&self) -> &str {
        &self.group_id
    }
    fn before_event_id(&self) -> &str {
        &self.before_event_id
    }
    fn mutation(&self) -> GroupMutation {
        GroupMutation::UpdateGroup(self.settings.clone())
    }
}

pub fn validate_settings(settings: &GroupSettings) -> Result<(), String> {
    validate_group_name(&settings.name)?;
    if let Some(description) = &settings.description {
        validate_description(description)?;
    }
    Ok(())
}

// ── Mirror lifecycle (owner -> mirror) ──

/// Sent to a domain that just gained its first member of the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreate {
    pub group_id: String,
}

impl EventPayload for GroupCreate {
    const NAME: &'static str = "t.group.create";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDelete {
    pub group_id: String,
}

impl EventPayload for GroupDelete {
    const NAME: &'static str = "t.group.sync.delete";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)
    }
}

// ── Group actions (member domain -> owner) ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub group_id: String,
}

impl EventPayload for SnapshotRequest {
    const NAME: &'static str = "t.group.snapshot";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupJoin {
    pub group_id: String,
    pub user_id: String,
}

impl EventPayload for GroupJoin {
    const NAME: &'static str = "t.group.join";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)?;
        validate_user_id(&self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupLeave {
    pub group_id: String,
    pub user_id: String,
}

impl EventPayload for GroupLeave {
    const NAME: &'static str = "t.group.leave";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)?;
        validate_user_id(&self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKick {
    pub group_id: String,
    pub actor_id: String,
    pub user_id: String,
}

impl EventPayload for GroupKick {
    const NAME: &'static str = "t.group.kick";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)?;
        validate_user_id(&self.actor_id)?;
        validate_user_id(&self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreate {
    pub group_id: String,
    pub actor_id: String,
    pub name: String,
    #[serde(default)]
    pub category_id: Option<String>,
}

impl EventPayload for ChannelCreate {
    const NAME: &'static str = "t.group.channel.create";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)?;
        validate_user_id(&self.actor_id)?;
        validate_channel_name(&self.name)?;
        if let Some(category_id) = &self.category_id {
            validate_identifier("Category id", category_id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDelete {
    pub group_id: String,
    pub actor_id: String,
    pub channel_id: String,
}

impl EventPayload for ChannelDelete {
    const NAME: &'static str = "t.group.channel.delete";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)?;
        validate_user_id(&self.actor_id)?;
        validate_identifier("Channel id", &self.channel_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssign {
    pub group_id: String,
    pub actor_id: String,
    pub user_id: String,
    pub role_id: String,
}

impl EventPayload for RoleAssign {
    const NAME: &'static str = "t.group.role.assign";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)?;
        validate_user_id(&self.actor_id)?;
        validate_user_id(&self.user_id)?;
        validate_identifier("Role id", &self.role_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleUnassign {
    pub group_id: String,
    pub actor_id: String,
    pub user_id: String,
    pub role_id: String,
}

impl EventPayload for RoleUnassign {
    const NAME: &'static str = "t.group.role.unassign";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Group id", &self.group_id)?;
        validate_user_id(&self.actor_id)?;
        validate_user_id(&self.user_id)?;
        validate_identifier("Role id", &self.role_id)
    }
}

// ── Requests ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCreate {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl EventPayload for RequestCreate {
    const NAME: &'static str = "t.request.create";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Request id", &self.id)?;
        validate_user_id(&self.sender)?;
        validate_user_id(&self.receiver)?;
        match (&self.request_type, &self.group_id) {
            (RequestType::Group, None) => Err("group request without groupId".to_string()),
            (_, Some(group_id)) => validate_identifier("Group id", group_id),
            (RequestType::Friend, None) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRemove {
    pub id: String,
}

impl EventPayload for RequestRemove {
    const NAME: &'static str = "t.request.remove";

    fn validate(&self) -> Result<(), String> {
        validate_identifier("Request id", &self.id)
    }
}

/// Body returned by sync and lifecycle handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Applied,
    Resynced,
    Created,
    Deleted,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub status: SyncStatus,
}
