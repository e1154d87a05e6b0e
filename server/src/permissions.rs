//! Permission model and resolution for group members
//!
//! Resolution is a plain set union: the owner gets `{ADMIN}`, a member gets
//! everything granted to the roles it holds plus the implicit `everyone`
//! role, widened by the channel's and the channel category's per-role grants.
//! There are no deny overrides.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::models::{CategoryPermission, Channel, ChannelPermission, Member, Role, EVERYONE_ROLE};

/// Permissions that can be granted to roles within a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    /// Implies every other permission
    Admin,
    /// Rename the group, change its icon, visibility and join policy
    ManageGroup,
    /// Create, delete and reorganise channels and categories
    ManageChannels,
    /// Create roles and hand them out
    ManageRoles,
    /// Invite members on behalf of the group
    ManageMembers,
    KickMembers,
    BanMembers,
    CreateInvite,
    ReadMessages,
    SendMessages,
}

/// Effective permissions of a user
pub type PermissionSet = BTreeSet<Permission>;

/// Permissions the `everyone` role gets when a group is created
pub fn default_everyone_permissions() -> Vec<Permission> {
    vec![Permission::ReadMessages, Permission::SendMessages]
}

/// Whether `set` satisfies `permission`, counting `ADMIN` as a wildcard.
pub fn allows(set: &PermissionSet, permission: Permission) -> bool {
    set.contains(&Permission::Admin) || set.contains(&permission)
}

/// Everything a resolution needs, loaded from the store.
#[derive(Debug, Default)]
pub struct PermissionContext<'a> {
    pub is_owner: bool,
    pub member: Option<&'a Member>,
    pub roles: &'a [Role],
    pub channel: Option<&'a Channel>,
    pub channel_permissions: &'a [ChannelPermission],
    pub category_permissions: &'a [CategoryPermission],
}

/// Compute the effective permission set.
pub fn resolve(ctx: &PermissionContext<'_>) -> PermissionSet {
    if ctx.is_owner {
        return [Permission::Admin].into_iter().collect();
    }
    let Some(member) = ctx.member else {
        return PermissionSet::new();
    };

    let held: BTreeSet<&str> = member
        .roles
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(EVERYONE_ROLE))
        .collect();

    let mut effective: PermissionSet = ctx
        .roles
        .iter()
        .filter(|role| held.contains(role.role_id.as_str()))
        .flat_map(|role| role.permissions.iter().copied())
        .collect();

    if let Some(channel) = ctx.channel {
        effective.extend(
            ctx.channel_permissions
                .iter()
                .filter(|grant| grant.channel_id == channel.channel_id)
                .filter(|grant| held.contains(grant.role_id.as_str()))
                .flat_map(|grant| grant.permissions.iter().copied()),
        );

        if let Some(category_id) = &channel.category_id {
            effective.extend(
                ctx.category_permissions
                    .iter()
                    .filter(|grant| &grant.category_id == category_id)
                    .filter(|grant| held.contains(grant.role_id.as_str()))
                    .flat_map(|grant| grant.permissions.iter().copied()),
            );
        }
    }

    effective
}

/// Effective permissions of `user_id` in `group_id`, optionally scoped to a
/// channel. Unknown groups and channels resolve to the empty set.
pub async fn get_user_permission(
    db: &Database,
    user_id: &str,
    group_id: &str,
    channel_id: Option<&str>,
) -> Result<PermissionSet> {
    let Some(group) = db.get_group(group_id).await? else {
        return Ok(PermissionSet::new());
    };
    let member = db.get_member(group_id, user_id).await?;
    let roles = db.get_roles(group_id).await?;

    let (channel, channel_permissions, category_permissions) = match channel_id {
        Some(channel_id) => {
            let Some(channel) = db.get_channel(group_id, channel_id).await? else {
                return Ok(PermissionSet::new());
            };
            let channel_permissions = db.get_channel_permissions(group_id, channel_id).await?;
            let category_permissions = match &channel.category_id {
                Some(category_id) => db.get_category_permissions(group_id, category_id).await?,
                None => Vec::new(),
            };
            (Some(channel), channel_permissions, category_permissions)
        }
        None => (None, Vec::new(), Vec::new()),
    };

    Ok(resolve(&PermissionContext {
        is_owner: group.owner == user_id,
        member: member.as_ref(),
        roles: &roles,
        channel: channel.as_ref(),
        channel_permissions: &channel_permissions,
        category_permissions: &category_permissions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(id: &str, permissions: &[Permission]) -> Role {
        Role {
            group_id: "g".into(),
            role_id: id.into(),
            name: id.into(),
            color: None,
            permissions: permissions.to_vec(),
        }
    }

    fn member(roles: &[&str]) -> Member {
        Member {
            group_id: "g".into(),
            user_id: "bob@b.example".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn owner_is_admin_only() {
        let roles = vec![role(EVERYONE_ROLE, &[Permission::SendMessages])];
        let set = resolve(&PermissionContext {
            is_owner: true,
            roles: &roles,
            ..Default::default()
        });
        assert_eq!(set, [Permission::Admin].into_iter().collect());
        assert!(allows(&set, Permission::BanMembers));
    }

    #[test]
    fn non_member_has_nothing() {
        let roles = vec![role(EVERYONE_ROLE, &[Permission::ReadMessages])];
        let set = resolve(&PermissionContext {
            roles: &roles,
            ..Default::default()
        });
        assert!(set.is_empty());
    }

    #[test]
    fn member_gets_union_of_held_roles_and_everyone() {
        let roles = vec![
            role(EVERYONE_ROLE, &[Permission::ReadMessages]),
            role("mod", &[Permission::KickMembers, Permission::ReadMessages]),
            role("dj", &[Permission::SendMessages]),
            role("admin", &[Permission::Admin]),
        ];
        let m = member(&["mod", "dj"]);
        let set = resolve(&PermissionContext {
            member: Some(&m),
            roles: &roles,
            ..Default::default()
        });
        let expected: PermissionSet = [
            Permission::ReadMessages,
            Permission::KickMembers,
            Permission::SendMessages,
        ]
        .into_iter()
        .collect();
        assert_eq!(set, expected);
        assert!(!allows(&set, Permission::ManageRoles));
    }

    #[test]
    fn union_is_independent_of_role_order() {
        let mut roles = vec![
            role(EVERYONE_ROLE, &[Permission::ReadMessages]),
            role("a", &[Permission::ManageChannels]),
            role("b", &[Permission::CreateInvite, Permission::SendMessages]),
        ];
        let forward = member(&["a", "b"]);
        let backward = member(&["b", "a"]);

        let first = resolve(&PermissionContext {
            member: Some(&forward),
            roles: &roles,
            ..Default::default()
        });
        roles.reverse();
        let second = resolve(&PermissionContext {
            member: Some(&backward),
            roles: &roles,
            ..Default::default()
        });
        assert_eq!(first, second);
    }

    #[test]
    fn channel_and_category_grants_widen_the_set() {
        let roles = vec![role(EVERYONE_ROLE, &[Permission::ReadMessages])];
        let m = member(&["mod"]);
        let channel = Channel {
            group_id: "g".into(),
            channel_id: "c1".into(),
            name: "general".into(),
            category_id: Some("cat1".into()),
        };
        let channel_permissions = vec![
            ChannelPermission {
                group_id: "g".into(),
                channel_id: "c1".into(),
                role_id: EVERYONE_ROLE.into(),
                permissions: vec![Permission::SendMessages],
            },
            ChannelPermission {
                group_id: "g".into(),
                channel_id: "c1".into(),
                role_id: "stranger".into(),
                permissions: vec![Permission::BanMembers],
            },
        ];
        let category_permissions = vec![CategoryPermission {
            group_id: "g".into(),
            category_id: "cat1".into(),
            role_id: "mod".into(),
            permissions: vec![Permission::ManageChannels],
        }];

        let set = resolve(&PermissionContext {
            member: Some(&m),
            roles: &roles,
            channel: Some(&channel),
            channel_permissions: &channel_permissions,
            category_permissions: &category_permissions,
            ..Default::default()
        });
        let expected: PermissionSet = [
            Permission::ReadMessages,
            Permission::SendMessages,
            Permission::ManageChannels,
        ]
        .into_iter()
        .collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn permissions_use_screaming_case_on_the_wire() {
        let json = serde_json::to_string(&vec![Permission::Admin, Permission::KickMembers]).unwrap();
        assert_eq!(json, r#"["ADMIN","KICK_MEMBERS"]"#);
        let parsed: Vec<Permission> = serde_json::from_str(r#"["MANAGE_CHANNELS"]"#).unwrap();
        assert_eq!(parsed, vec![Permission::ManageChannels]);
    }
}
