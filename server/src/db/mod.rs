//! Database layer for the federation server using SQLite
//!
//! Holds group replicas (groups, members, roles, channels, categories and
//! their permission grants) plus the federation bookkeeping tables: processed
//! event ids, local signing keys, cached remote keys and pending requests.
//!
//! Sub-modules:
//! - `group`: version-chain mutations, snapshots and resync replacement
//! - `federation`: replay cache, key tables, requests

pub mod federation;
pub mod group;

pub use group::{ApplyOutcome, GroupMutation};

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{Sqlite, SqlitePoolOptions, SqliteRow};
use sqlx::{Executor, Row, SqlitePool as Pool};

use crate::models::{
    user_domain, Category, CategoryPermission, Channel, ChannelPermission, Group, GroupType,
    Member, Role,
};

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Create a new database connection to the specified file path.
    /// `":memory:"` opens a private in-memory database.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let is_memory = db_path.as_ref().to_str() == Some(":memory:");

        let pool = if is_memory {
            // Every connection to `sqlite::memory:` is its own database, so the
            // pool must keep exactly one connection alive forever.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
                .context("Failed to open in-memory SQLite database")?
        } else {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
            SqlitePoolOptions::new()
                .max_connections(5)
                .min_connections(1)
                .idle_timeout(std::time::Duration::from_secs(300))
                .max_lifetime(std::time::Duration::from_secs(1800))
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        conn.execute("PRAGMA busy_timeout = 5000").await?;
                        conn.execute("PRAGMA journal_mode = WAL").await?;
                        Ok(())
                    })
                })
                .connect(&db_url)
                .await
                .context("Failed to connect to SQLite database")?
        };

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run database migrations to create or update schema
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                group_id TEXT PRIMARY KEY NOT NULL,
                domain TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                icon TEXT,
                owner TEXT NOT NULL,
                group_type TEXT NOT NULL DEFAULT 'private',
                allow_join INTEGER NOT NULL DEFAULT 0,
                is_owner INTEGER NOT NULL DEFAULT 0,
                before_event_id TEXT NOT NULL,
                invites TEXT NOT NULL DEFAULT '[]',
                requests TEXT NOT NULL DEFAULT '[]',
                bans TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create groups table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS members (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                roles TEXT NOT NULL DEFAULT '[]',
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create members table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS roles (
                group_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                name TEXT NOT NULL,
                color TEXT,
                permissions TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (group_id, role_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create roles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                group_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                name TEXT NOT NULL,
                category_id TEXT,
                PRIMARY KEY (group_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create channels table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                group_id TEXT NOT NULL,
                category_id TEXT NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (group_id, category_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create categories table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_permissions (
                group_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                permissions TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (group_id, channel_id, role_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create channel_permissions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS category_permissions (
                group_id TEXT NOT NULL,
                category_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                permissions TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (group_id, category_id, role_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create category_permissions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_ids (
                domain TEXT NOT NULL,
                event_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (domain, event_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create event_ids table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS server_keys (
                public_key TEXT PRIMARY KEY NOT NULL,
                private_key TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create server_keys table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS remote_server_keys (
                domain TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                public_key TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY (domain, expires_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create remote_server_keys table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY NOT NULL,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                request_type TEXT NOT NULL,
                group_id TEXT,
                local INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create requests table")?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_members_user ON members (user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_event_ids_timestamp ON event_ids (timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_server_keys_expiry ON server_keys (expires_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_receiver ON requests (receiver)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── Group replica reads ──

    pub async fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        fetch_group(&self.pool, group_id).await
    }

    pub async fn get_member(&self, group_id: &str, user_id: &str) -> Result<Option<Member>> {
        let row = sqlx::query("SELECT * FROM members WHERE group_id = ? AND user_id = ?")
            .bind(group_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load member")?;
        row.as_ref().map(member_from_row).transpose()
    }

    pub async fn get_members(&self, group_id: &str) -> Result<Vec<Member>> {
        fetch_members(&self.pool, group_id).await
    }

    pub async fn get_roles(&self, group_id: &str) -> Result<Vec<Role>> {
        fetch_roles(&self.pool, group_id).await
    }

    pub async fn get_role(&self, group_id: &str, role_id: &str) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE group_id = ? AND role_id = ?")
            .bind(group_id)
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load role")?;
        row.as_ref().map(role_from_row).transpose()
    }

    pub async fn get_channel(&self, group_id: &str, channel_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query("SELECT * FROM channels WHERE group_id = ? AND channel_id = ?")
            .bind(group_id)
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load channel")?;
        Ok(row.as_ref().map(channel_from_row))
    }

    pub async fn get_category(
        &self,
        group_id: &str,
        category_id: &str,
    ) -> Result<Option<Category>> {
        let row = sqlx::query("SELECT * FROM categories WHERE group_id = ? AND category_id = ?")
            .bind(group_id)
            .bind(category_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load category")?;
        Ok(row.as_ref().map(category_from_row))
    }

    pub async fn get_channel_permissions(
        &self,
        group_id: &str,
        channel_id: &str,
    ) -> Result<Vec<ChannelPermission>> {
        let rows = sqlx::query(
            "SELECT * FROM channel_permissions WHERE group_id = ? AND channel_id = ? ORDER BY role_id",
        )
        .bind(group_id)
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load channel permissions")?;
        rows.iter().map(channel_permission_from_row).collect()
    }

    pub async fn get_category_permissions(
        &self,
        group_id: &str,
        category_id: &str,
    ) -> Result<Vec<CategoryPermission>> {
        let rows = sqlx::query(
            "SELECT * FROM category_permissions WHERE group_id = ? AND category_id = ? ORDER BY role_id",
        )
        .bind(group_id)
        .bind(category_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load category permissions")?;
        rows.iter().map(category_permission_from_row).collect()
    }

    /// Domains hosting at least one member of the group.
    pub async fn member_domains(&self, group_id: &str) -> Result<BTreeSet<String>> {
        let members = self.get_members(group_id).await?;
        Ok(members
            .iter()
            .filter_map(|m| user_domain(&m.user_id))
            .map(str::to_string)
            .collect())
    }

    /// Number of members of the group whose home is `domain`.
    pub async fn count_members_from_domain(&self, group_id: &str, domain: &str) -> Result<usize> {
        let members = self.get_members(group_id).await?;
        Ok(members
            .iter()
            .filter(|m| user_domain(&m.user_id) == Some(domain))
            .count())
    }
}

// ── Executor-generic fetch helpers (shared by pool reads and transactions) ──

pub(crate) async fn fetch_group<'e, E>(executor: E, group_id: &str) -> Result<Option<Group>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT * FROM groups WHERE group_id = ?")
        .bind(group_id)
        .fetch_optional(executor)
        .await
        .context("Failed to load group")?;
    row.as_ref().map(group_from_row).transpose()
}

pub(crate) async fn fetch_members<'e, E>(executor: E, group_id: &str) -> Result<Vec<Member>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM members WHERE group_id = ? ORDER BY user_id")
        .bind(group_id)
        .fetch_all(executor)
        .await
        .context("Failed to load members")?;
    rows.iter().map(member_from_row).collect()
}

pub(crate) async fn fetch_roles<'e, E>(executor: E, group_id: &str) -> Result<Vec<Role>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM roles WHERE group_id = ? ORDER BY role_id")
        .bind(group_id)
        .fetch_all(executor)
        .await
        .context("Failed to load roles")?;
    rows.iter().map(role_from_row).collect()
}

pub(crate) async fn fetch_channels<'e, E>(executor: E, group_id: &str) -> Result<Vec<Channel>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM channels WHERE group_id = ? ORDER BY channel_id")
        .bind(group_id)
        .fetch_all(executor)
        .await
        .context("Failed to load channels")?;
    Ok(rows.iter().map(channel_from_row).collect())
}

pub(crate) async fn fetch_categories<'e, E>(executor: E, group_id: &str) -> Result<Vec<Category>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT * FROM categories WHERE group_id = ? ORDER BY category_id")
        .bind(group_id)
        .fetch_all(executor)
        .await
        .context("Failed to load categories")?;
    Ok(rows.iter().map(category_from_row).collect())
}

pub(crate) async fn fetch_all_channel_permissions<'e, E>(
    executor: E,
    group_id: &str,
) -> Result<Vec<ChannelPermission>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM channel_permissions WHERE group_id = ? ORDER BY channel_id, role_id",
    )
    .bind(group_id)
    .fetch_all(executor)
    .await
    .context("Failed to load channel permissions")?;
    rows.iter().map(channel_permission_from_row).collect()
}

pub(crate) async fn fetch_all_category_permissions<'e, E>(
    executor: E,
    group_id: &str,
) -> Result<Vec<CategoryPermission>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT * FROM category_permissions WHERE group_id = ? ORDER BY category_id, role_id",
    )
    .bind(group_id)
    .fetch_all(executor)
    .await
    .context("Failed to load category permissions")?;
    rows.iter().map(category_permission_from_row).collect()
}

// ── Row mapping ──

fn json_list<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<Vec<T>> {
    serde_json::from_str(raw).with_context(|| format!("Corrupt JSON in column {}", column))
}

pub(crate) fn to_json_list<T: serde::Serialize>(items: &[T]) -> Result<String> {
    serde_json::to_string(items).context("Failed to encode JSON list")
}

fn group_from_row(row: &SqliteRow) -> Result<Group> {
    let group_type: String = row.get("group_type");
    Ok(Group {
        group_id: row.get("group_id"),
        domain: row.get("domain"),
        name: row.get("name"),
        description: row.get("description"),
        icon: row.get("icon"),
        owner: row.get("owner"),
        group_type: GroupType::from_str(&group_type).unwrap_or_default(),
        allow_join: row.get::<i64, _>("allow_join") != 0,
        is_owner: row.get::<i64, _>("is_owner") != 0,
        before_event_id: row.get("before_event_id"),
        invites: json_list(&row.get::<String, _>("invites"), "invites")?,
        requests: json_list(&row.get::<String, _>("requests"), "requests")?,
        bans: json_list(&row.get::<String, _>("bans"), "bans")?,
    })
}

fn member_from_row(row: &SqliteRow) -> Result<Member> {
    Ok(Member {
        group_id: row.get("group_id"),
        user_id: row.get("user_id"),
        roles: json_list(&row.get::<String, _>("roles"), "roles")?,
    })
}

fn role_from_row(row: &SqliteRow) -> Result<Role> {
    Ok(Role {
        group_id: row.get("group_id"),
        role_id: row.get("role_id"),
        name: row.get("name"),
        color: row.get("color"),
        permissions: json_list(&row.get::<String, _>("permissions"), "permissions")?,
    })
}

fn channel_from_row(row: &SqliteRow) -> Channel {
    Channel {
        group_id: row.get("group_id"),
        channel_id: row.get("channel_id"),
        name: row.get("name"),
        category_id: row.get("category_id"),
    }
}

fn category_from_row(row: &SqliteRow) -> Category {
    Category {
        group_id: row.get("group_id"),
        category_id: row.get("category_id"),
        name: row.get("name"),
    }
}

fn channel_permission_from_row(row: &SqliteRow) -> Result<ChannelPermission> {
    Ok(ChannelPermission {
        group_id: row.get("group_id"),
        channel_id: row.get("channel_id"),
        role_id: row.get("role_id"),
        permissions: json_list(&row.get::<String, _>("permissions"), "permissions")?,
    })
}

fn category_permission_from_row(row: &SqliteRow) -> Result<CategoryPermission> {
    Ok(CategoryPermission {
        group_id: row.get("group_id"),
        category_id: row.get("category_id"),
        role_id: row.get("role_id"),
        permissions: json_list(&row.get::<String, _>("permissions"), "permissions")?,
    })
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
