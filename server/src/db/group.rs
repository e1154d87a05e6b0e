//! Group replica writes under the version chain.
//!
//! Every chain-tracked write goes through [`Database::apply_group_mutation`]:
//! a conditional `UPDATE` on `groups.before_event_id` and the mutation itself
//! share one transaction, so a replica either moves to the new token with the
//! change applied or stays exactly where it was.

use anyhow::{Context, Result};
use sqlx::SqliteConnection;
use tracing::debug;

use super::{
    fetch_all_category_permissions, fetch_all_channel_permissions, fetch_categories,
    fetch_channels, fetch_group, fetch_members, fetch_roles, now, to_json_list, Database,
};
use crate::models::{
    Category, CategoryPermission, Channel, ChannelPermission, Group, GroupSettings,
    GroupSnapshot, Member, Role, EVERYONE_ROLE,
};

/// A single change to a group replica, as carried by one sync event.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupMutation {
    AddMember(Member),
    RemoveMember {
        user_id: String,
    },
    PutRole(Role),
    /// Also strips the role from members and permission overrides.
    RemoveRole {
        role_id: String,
    },
    AssignRole {
        user_id: String,
        role_id: String,
    },
    UnassignRole {
        user_id: String,
        role_id: String,
    },
    /// Upsert the channel and replace its overrides.
    PutChannel {
        channel: Channel,
        permissions: Vec<ChannelPermission>,
    },
    RemoveChannel {
        channel_id: String,
    },
    /// Upsert the category and replace its overrides.
    PutCategory {
        category: Category,
        permissions: Vec<CategoryPermission>,
    },
    /// Also detaches the category's channels.
    RemoveCategory {
        category_id: String,
    },
    UpdateGroup(GroupSettings),
}

/// Result of a compare-and-set on the version chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Token matched; mutation committed and token advanced.
    Applied,
    /// Nothing was written. The replica has drifted from the sender.
    Diverged { reason: String },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

impl Database {
    /// Apply `mutation` iff the replica's token equals `expected`, moving it
    /// to `new_event_id`.
    pub async fn apply_group_mutation(
        &self,
        group_id: &str,
        expected: &str,
        new_event_id: &str,
        mutation: &GroupMutation,
    ) -> Result<ApplyOutcome> {
        let mut tx = self.pool().begin().await.context("Failed to open transaction")?;

        let updated = sqlx::query(
            "UPDATE groups SET before_event_id = ?, updated_at = ? WHERE group_id = ? AND before_event_id = ?",
        )
        .bind(new_event_id)
        .bind(now())
        .bind(group_id)
        .bind(expected)
        .execute(&mut *tx)
        .await
        .context("Failed to advance group token")?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(ApplyOutcome::Diverged {
                reason: format!("token of group {} is not {}", group_id, expected),
            });
        }

        if let Some(missing) = apply_mutation(&mut tx, group_id, mutation).await? {
            tx.rollback().await?;
            debug!("Federation: group {} mutation rolled back, {} not found", group_id, missing);
            return Ok(ApplyOutcome::Diverged { reason: missing });
        }

        tx.commit().await.context("Failed to commit group mutation")?;
        Ok(ApplyOutcome::Applied)
    }

    /// Full authoritative state of a group, read in one transaction.
    pub async fn get_group_snapshot(&self, group_id: &str) -> Result<Option<GroupSnapshot>> {
        let mut tx = self.pool().begin().await?;

        let Some(group) = fetch_group(&mut *tx, group_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        let snapshot = GroupSnapshot {
            members: fetch_members(&mut *tx, group_id).await?,
            roles: fetch_roles(&mut *tx, group_id).await?,
            channels: fetch_channels(&mut *tx, group_id).await?,
            categories: fetch_categories(&mut *tx, group_id).await?,
            channel_permissions: fetch_all_channel_permissions(&mut *tx, group_id).await?,
            category_permissions: fetch_all_category_permissions(&mut *tx, group_id).await?,
            group,
        };

        tx.commit().await?;
        Ok(Some(snapshot))
    }

    /// Replace everything stored for the snapshot's group with the snapshot,
    /// token included. Running it twice leaves the same state.
    pub async fn replace_group(&self, snapshot: &GroupSnapshot) -> Result<()> {
        let group_id = snapshot.group.group_id.as_str();
        let mut tx = self.pool().begin().await?;

        delete_children(&mut tx, group_id).await?;
        upsert_group_row(&mut tx, &snapshot.group).await?;

        for member in &snapshot.members {
            upsert_member(&mut tx, group_id, member).await?;
        }
        for role in &snapshot.roles {
            upsert_role(&mut tx, group_id, role).await?;
        }
        for category in &snapshot.categories {
            upsert_category(&mut tx, group_id, category).await?;
        }
        for channel in &snapshot.channels {
            upsert_channel(&mut tx, group_id, channel).await?;
        }
        for grant in &snapshot.channel_permissions {
            insert_channel_permission(&mut tx, group_id, &grant.channel_id, grant).await?;
        }
        for grant in &snapshot.category_permissions {
            insert_category_permission(&mut tx, group_id, &grant.category_id, grant).await?;
        }

        tx.commit().await.context("Failed to commit group replacement")?;
        Ok(())
    }

    /// Drop a group and all of its rows. Returns whether it existed.
    pub async fn delete_group(&self, group_id: &str) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        delete_children(&mut tx, group_id).await?;
        let deleted = sqlx::query("DELETE FROM groups WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete group")?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Update the invite, join-request and ban lists. These lists are not
    /// chain-tracked; mirrors pick them up with the next snapshot.
    pub async fn update_group_lists(
        &self,
        group_id: &str,
        invites: &[String],
        requests: &[String],
        bans: &[String],
    ) -> Result<()> {
        sqlx::query(
            "UPDATE groups SET invites = ?, requests = ?, bans = ?, updated_at = ? WHERE group_id = ?",
        )
        .bind(to_json_list(invites)?)
        .bind(to_json_list(requests)?)
        .bind(to_json_list(bans)?)
        .bind(now())
        .bind(group_id)
        .execute(self.pool())
        .await
        .context("Failed to update group lists")?;
        Ok(())
    }
}

/// Returns `Some(description)` when the mutation references a row the
/// replica does not have.
async fn apply_mutation(
    conn: &mut SqliteConnection,
    group_id: &str,
    mutation: &GroupMutation,
) -> Result<Option<String>> {
    match mutation {
        GroupMutation::AddMember(member) => {
            for role_id in &member.roles {
                if !role_exists(conn, group_id, role_id).await? {
                    return Ok(Some(format!("role {}", role_id)));
                }
            }
            upsert_member(conn, group_id, member).await?;
        }
        GroupMutation::RemoveMember { user_id } => {
            let deleted = sqlx::query("DELETE FROM members WHERE group_id = ? AND user_id = ?")
                .bind(group_id)
                .bind(user_id)
                .execute(&mut *conn)
                .await?
                .rows_affected();
            if deleted == 0 {
                return Ok(Some(format!("member {}", user_id)));
            }
        }
        GroupMutation::PutRole(role) => {
            upsert_role(conn, group_id, role).await?;
        }
        GroupMutation::RemoveRole { role_id } => {
            let deleted = sqlx::query("DELETE FROM roles WHERE group_id = ? AND role_id = ?")
                .bind(group_id)
                .bind(role_id)
                .execute(&mut *conn)
                .await?
                .rows_affected();
            if deleted == 0 {
                return Ok(Some(format!("role {}", role_id)));
            }
            for mut member in fetch_members(&mut *conn, group_id).await? {
                if member.roles.iter().any(|r| r == role_id) {
                    member.roles.retain(|r| r != role_id);
                    set_member_roles(conn, group_id, &member).await?;
                }
            }
            sqlx::query("DELETE FROM channel_permissions WHERE group_id = ? AND role_id = ?")
                .bind(group_id)
                .bind(role_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query("DELETE FROM category_permissions WHERE group_id = ? AND role_id = ?")
                .bind(group_id)
                .bind(role_id)
                .execute(&mut *conn)
                .await?;
        }
        GroupMutation::AssignRole { user_id, role_id } => {
            if !role_exists(conn, group_id, role_id).await? {
                return Ok(Some(format!("role {}", role_id)));
            }
            let Some(mut member) = fetch_member(conn, group_id, user_id).await? else {
                return Ok(Some(format!("member {}", user_id)));
            };
            if !member.roles.iter().any(|r| r == role_id) {
                member.roles.push(role_id.clone());
                set_member_roles(conn, group_id, &member).await?;
            }
        }
        GroupMutation::UnassignRole { user_id, role_id } => {
            let Some(mut member) = fetch_member(conn, group_id, user_id).await? else {
                return Ok(Some(format!("member {}", user_id)));
            };
            member.roles.retain(|r| r != role_id);
            set_member_roles(conn, group_id, &member).await?;
        }
        GroupMutation::PutChannel {
            channel,
            permissions,
        } => {
            if let Some(category_id) = &channel.category_id {
                if !category_exists(conn, group_id, category_id).await? {
                    return Ok(Some(format!("category {}", category_id)));
                }
            }
            upsert_channel(conn, group_id, channel).await?;
            sqlx::query("DELETE FROM channel_permissions WHERE group_id = ? AND channel_id = ?")
                .bind(group_id)
                .bind(&channel.channel_id)
                .execute(&mut *conn)
                .await?;
            for grant in permissions {
                insert_channel_permission(conn, group_id, &channel.channel_id, grant).await?;
            }
        }
        GroupMutation::RemoveChannel { channel_id } => {
            let deleted = sqlx::query("DELETE FROM channels WHERE group_id = ? AND channel_id = ?")
                .bind(group_id)
                .bind(channel_id)
                .execute(&mut *conn)
                .await?
                .rows_affected();
            if deleted == 0 {
                return Ok(Some(format!("channel {}", channel_id)));
            }
            sqlx::query("DELETE FROM channel_permissions WHERE group_id = ? AND channel_id = ?")
                .bind(group_id)
                .bind(channel_id)
                .execute(&mut *conn)
                .await?;
        }
        GroupMutation::PutCategory {
            category,
            permissions,
        } => {
            upsert_category(conn, group_id, category).await?;
            sqlx::query("DELETE FROM category_permissions WHERE group_id = ? AND category_id = ?")
                .bind(group_id)
                .bind(&category.category_id)
                .execute(&mut *conn)
                .await?;
            for grant in permissions {
                insert_category_permission(conn, group_id, &category.category_id, grant).await?;
            }
        }
        GroupMutation::RemoveCategory { category_id } => {
            let deleted =
                sqlx::query("DELETE FROM categories WHERE group_id = ? AND category_id = ?")
                    .bind(group_id)
                    .bind(category_id)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected();
            if deleted == 0 {
                return Ok(Some(format!("category {}", category_id)));
            }
            sqlx::query("DELETE FROM category_permissions WHERE group_id = ? AND category_id = ?")
                .bind(group_id)
                .bind(category_id)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                "UPDATE channels SET category_id = NULL WHERE group_id = ? AND category_id = ?",
            )
            .bind(group_id)
            .bind(category_id)
            .execute(&mut *conn)
            .await?;
        }
        GroupMutation::UpdateGroup(settings) => {
            sqlx::query(
                "UPDATE groups SET name = ?, description = ?, icon = ?, group_type = ?, allow_join = ? WHERE group_id = ?",
            )
            .bind(&settings.name)
            .bind(&settings.description)
            .bind(&settings.icon)
            .bind(settings.group_type.as_str())
            .bind(settings.allow_join as i64)
            .bind(group_id)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(None)
}

// ── Row writers ──

async fn delete_children(conn: &mut SqliteConnection, group_id: &str) -> Result<()> {
    for table in [
        "members",
        "roles",
        "channels",
        "categories",
        "channel_permissions",
        "category_permissions",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE group_id = ?", table))
            .bind(group_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("Failed to clear {}", table))?;
    }
    Ok(())
}

async fn upsert_group_row(conn: &mut SqliteConnection, group: &Group) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO groups (group_id, domain, name, description, icon, owner, group_type,
                            allow_join, is_owner, before_event_id, invites, requests, bans, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(group_id) DO UPDATE SET
            domain = excluded.domain,
            name = excluded.name,
            description = excluded.description,
            icon = excluded.icon,
            owner = excluded.owner,
            group_type = excluded.group_type,
            allow_join = excluded.allow_join,
            is_owner = excluded.is_owner,
            before_event_id = excluded.before_event_id,
            invites = excluded.invites,
            requests = excluded.requests,
            bans = excluded.bans,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&group.group_id)
    .bind(&group.domain)
    .bind(&group.name)
    .bind(&group.description)
    .bind(&group.icon)
    .bind(&group.owner)
    .bind(group.group_type.as_str())
    .bind(group.allow_join as i64)
    .bind(group.is_owner as i64)
    .bind(&group.before_event_id)
    .bind(to_json_list(&group.invites)?)
    .bind(to_json_list(&group.requests)?)
    .bind(to_json_list(&group.bans)?)
    .bind(now())
    .execute(&mut *conn)
    .await
    .context("Failed to upsert group")?;
    Ok(())
}

async fn upsert_member(conn: &mut SqliteConnection, group_id: &str, member: &Member) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO members (group_id, user_id, roles, joined_at) VALUES (?, ?, ?, ?)
        ON CONFLICT(group_id, user_id) DO UPDATE SET roles = excluded.roles
        "#,
    )
    .bind(group_id)
    .bind(&member.user_id)
    .bind(to_json_list(&member.roles)?)
    .bind(now())
    .execute(&mut *conn)
    .await
    .context("Failed to upsert member")?;
    Ok(())
}

async fn set_member_roles(conn: &mut SqliteConnection, group_id: &str, member: &Member) -> Result<()> {
    sqlx::query("UPDATE members SET roles = ? WHERE group_id = ? AND user_id = ?")
        .bind(to_json_list(&member.roles)?)
        .bind(group_id)
        .bind(&member.user_id)
        .execute(&mut *conn)
        .await
        .context("Failed to update member roles")?;
    Ok(())
}

async fn upsert_role(conn: &mut SqliteConnection, group_id: &str, role: &Role) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO roles (group_id, role_id, name, color, permissions) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(group_id, role_id) DO UPDATE SET
            name = excluded.name, color = excluded.color, permissions = excluded.permissions
        "#,
    )
    .bind(group_id)
    .bind(&role.role_id)
    .bind(&role.name)
    .bind(&role.color)
    .bind(to_json_list(&role.permissions)?)
    .execute(&mut *conn)
    .await
    .context("Failed to upsert role")?;
    Ok(())
}

async fn upsert_channel(conn: &mut SqliteConnection, group_id: &str, channel: &Channel) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO channels (group_id, channel_id, name, category_id) VALUES (?, ?, ?, ?)
        ON CONFLICT(group_id, channel_id) DO UPDATE SET
            name = excluded.name, category_id = excluded.category_id
        "#,
    )
    .bind(group_id)
    .bind(&channel.channel_id)
    .bind(&channel.name)
    .bind(&channel.category_id)
    .execute(&mut *conn)
    .await
    .context("Failed to upsert channel")?;
    Ok(())
}

async fn upsert_category(
    conn: &mut SqliteConnection,
    group_id: &str,
    category: &Category,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO categories (group_id, category_id, name) VALUES (?, ?, ?)
        ON CONFLICT(group_id, category_id) DO UPDATE SET name = excluded.name
        "#,
    )
    .bind(group_id)
    .bind(&category.category_id)
    .bind(&category.name)
    .execute(&mut *conn)
    .await
    .context("Failed to upsert category")?;
    Ok(())
}

async fn insert_channel_permission(
    conn: &mut SqliteConnection,
    group_id: &str,
    channel_id: &str,
    grant: &ChannelPermission,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO channel_permissions (group_id, channel_id, role_id, permissions) VALUES (?, ?, ?, ?)",
    )
    .bind(group_id)
    .bind(channel_id)
    .bind(&grant.role_id)
    .bind(to_json_list(&grant.permissions)?)
    .execute(&mut *conn)
    .await
    .context("Failed to store channel permission")?;
    Ok(())
}

async fn insert_category_permission(
    conn: &mut SqliteConnection,
    group_id: &str,
    category_id: &str,
    grant: &CategoryPermission,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO category_permissions (group_id, category_id, role_id, permissions) VALUES (?, ?, ?, ?)",
    )
    .bind(group_id)
    .bind(category_id)
    .bind(&grant.role_id)
    .bind(to_json_list(&grant.permissions)?)
    .execute(&mut *conn)
    .await
    .context("Failed to store category permission")?;
    Ok(())
}

async fn fetch_member(
    conn: &mut SqliteConnection,
    group_id: &str,
    user_id: &str,
) -> Result<Option<Member>> {
    Ok(fetch_members(&mut *conn, group_id)
        .await?
        .into_iter()
        .find(|m| m.user_id == user_id))
}

async fn role_exists(conn: &mut SqliteConnection, group_id: &str, role_id: &str) -> Result<bool> {
    if role_id == EVERYONE_ROLE {
        return Ok(true);
    }
    let found: Option<(String,)> =
        sqlx::query_as("SELECT role_id FROM roles WHERE group_id = ? AND role_id = ?")
            .bind(group_id)
            .bind(role_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

async fn category_exists(
    conn: &mut SqliteConnection,
    group_id: &str,
    category_id: &str,
) -> Result<bool> {
    let found: Option<(String,)> =
        sqlx::query_as("SELECT category_id FROM categories WHERE group_id = ? AND category_id = ?")
            .bind(group_id)
            .bind(category_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GroupType;
    use crate::permissions::Permission;

    fn snapshot(token: &str) -> GroupSnapshot {
        GroupSnapshot {
            group: Group {
                group_id: "g1".into(),
                domain: "a.example".into(),
                name: "Rustaceans".into(),
                description: None,
                icon: None,
                owner: "alice@a.example".into(),
                group_type: GroupType::Public,
                allow_join: true,
                is_owner: false,
                before_event_id: token.into(),
                invites: vec![],
                requests: vec![],
                bans: vec!["mallory@c.example".into()],
            },
            members: vec![Member {
                group_id: "g1".into(),
                user_id: "alice@a.example".into(),
                roles: vec!["mod".into()],
            }],
            roles: vec![
                Role {
                    group_id: "g1".into(),
                    role_id: EVERYONE_ROLE.into(),
                    name: "everyone".into(),
                    color: None,
                    permissions: vec![Permission::ReadMessages],
                },
                Role {
                    group_id: "g1".into(),
                    role_id: "mod".into(),
                    name: "Moderator".into(),
                    color: Some("#ff0000".into()),
                    permissions: vec![Permission::KickMembers],
                },
            ],
            channels: vec![Channel {
                group_id: "g1".into(),
                channel_id: "c1".into(),
                name: "general".into(),
                category_id: Some("cat1".into()),
            }],
            categories: vec![Category {
                group_id: "g1".into(),
                category_id: "cat1".into(),
                name: "Text".into(),
            }],
            channel_permissions: vec![ChannelPermission {
                group_id: "g1".into(),
                channel_id: "c1".into(),
                role_id: "mod".into(),
                permissions: vec![Permission::ManageChannels],
            }],
            category_permissions: vec![CategoryPermission {
                group_id: "g1".into(),
                category_id: "cat1".into(),
                role_id: "mod".into(),
                permissions: vec![Permission::SendMessages],
            }],
        }
    }

    async fn seeded(token: &str) -> Database {
        let db = Database::new_in_memory().await.unwrap();
        db.replace_group(&snapshot(token)).await.unwrap();
        db
    }

    fn add_bob() -> GroupMutation {
        GroupMutation::AddMember(Member {
            group_id: "g1".into(),
            user_id: "bob@b.example".into(),
            roles: vec![],
        })
    }

    #[tokio::test]
    async fn test_matching_token_applies_and_advances() {
        let db = seeded("e1").await;

        let outcome = db.apply_group_mutation("g1", "e1", "e2", &add_bob()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let group = db.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.before_event_id, "e2");
        assert!(db.get_member("g1", "bob@b.example").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_token_changes_nothing() {
        let db = seeded("e1").await;

        let outcome = db.apply_group_mutation("g1", "e0", "e2", &add_bob()).await.unwrap();
        assert!(!outcome.is_applied());

        let group = db.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.before_event_id, "e1");
        assert!(db.get_member("g1", "bob@b.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_group_diverges() {
        let db = Database::new_in_memory().await.unwrap();
        let outcome = db.apply_group_mutation("nope", "e1", "e2", &add_bob()).await.unwrap();
        assert!(!outcome.is_applied());
    }

    #[tokio::test]
    async fn test_missing_reference_rolls_back_token() {
        let db = seeded("e1").await;

        let outcome = db
            .apply_group_mutation(
                "g1",
                "e1",
                "e2",
                &GroupMutation::AssignRole {
                    user_id: "alice@a.example".into(),
                    role_id: "ghost".into(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Diverged { .. }));

        let group = db.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.before_event_id, "e1");
    }

    #[tokio::test]
    async fn test_remove_role_strips_members_and_overrides() {
        let db = seeded("e1").await;

        let outcome = db
            .apply_group_mutation(
                "g1",
                "e1",
                "e2",
                &GroupMutation::RemoveRole {
                    role_id: "mod".into(),
                },
            )
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let alice = db.get_member("g1", "alice@a.example").await.unwrap().unwrap();
        assert!(alice.roles.is_empty());
        assert!(db.get_channel_permissions("g1", "c1").await.unwrap().is_empty());
        assert!(db.get_category_permissions("g1", "cat1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_category_detaches_channels() {
        let db = seeded("e1").await;

        db.apply_group_mutation(
            "g1",
            "e1",
            "e2",
            &GroupMutation::RemoveCategory {
                category_id: "cat1".into(),
            },
        )
        .await
        .unwrap();

        let channel = db.get_channel("g1", "c1").await.unwrap().unwrap();
        assert_eq!(channel.category_id, None);
        assert!(db.get_category("g1", "cat1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_group_is_idempotent() {
        let db = seeded("e1").await;
        db.apply_group_mutation("g1", "e1", "e2", &add_bob()).await.unwrap();

        let authoritative = snapshot("e5");
        db.replace_group(&authoritative).await.unwrap();
        db.replace_group(&authoritative).await.unwrap();

        let stored = db.get_group_snapshot("g1").await.unwrap().unwrap();
        assert_eq!(stored, authoritative);
        assert!(db.get_member("g1", "bob@b.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_group_removes_children() {
        let db = seeded("e1").await;
        assert!(db.delete_group("g1").await.unwrap());
        assert!(!db.delete_group("g1").await.unwrap());
        assert!(db.get_members("g1").await.unwrap().is_empty());
        assert!(db.get_roles("g1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_on_same_token_apply_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(dir.path().join("cas.db")).await.unwrap();
        db.replace_group(&snapshot("e1")).await.unwrap();

        let writers = (0..8).map(|i| {
            let db = db.clone();
            tokio::spawn(async move {
                let mutation = GroupMutation::AddMember(Member {
                    group_id: "g1".into(),
                    user_id: format!("user{}@b.example", i),
                    roles: vec![],
                });
                let outcome = db
                    .apply_group_mutation("g1", "e1", &format!("e2-{}", i), &mutation)
                    .await
                    .unwrap();
                (i, outcome)
            })
        });
        let outcomes: Vec<_> = futures_util::future::join_all(writers)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let winners: Vec<_> = outcomes.iter().filter(|(_, o)| o.is_applied()).collect();
        assert_eq!(winners.len(), 1);
        let winner = winners[0].0;

        let group = db.get_group("g1").await.unwrap().unwrap();
        assert_eq!(group.before_event_id, format!("e2-{}", winner));
        let members = db.get_members("g1").await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().any(|m| m.user_id == format!("user{}@b.example", winner)));
    }
}
