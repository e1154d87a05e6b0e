//! Federation bookkeeping: replay cache, signing keys, remote key cache and
//! cross-domain requests.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{now, Database};
use crate::models::{RemoteServerKey, Request, RequestType, ServerKey};

impl Database {
    // ── Replay cache ──

    /// Record a processed event. Returns false if it was already recorded.
    pub async fn insert_event_id_if_absent(&self, domain: &str, event_id: &str) -> Result<bool> {
        let inserted =
            sqlx::query("INSERT OR IGNORE INTO event_ids (domain, event_id, timestamp) VALUES (?, ?, ?)")
                .bind(domain)
                .bind(event_id)
                .bind(now())
                .execute(self.pool())
                .await
                .context("Failed to record event id")?
                .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn event_id_exists(&self, domain: &str, event_id: &str) -> Result<bool> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM event_ids WHERE domain = ? AND event_id = ?")
                .bind(domain)
                .bind(event_id)
                .fetch_optional(self.pool())
                .await
                .context("Failed to look up event id")?;
        Ok(found.is_some())
    }

    /// Forget events processed before `older_than` (unix seconds).
    pub async fn prune_event_ids(&self, older_than: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM event_ids WHERE timestamp < ?")
            .bind(older_than)
            .execute(self.pool())
            .await
            .context("Failed to prune event ids")?;
        Ok(result.rows_affected())
    }

    // ── Local signing keys ──

    pub async fn insert_server_key(&self, key: &ServerKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO server_keys (public_key, private_key, issued_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&key.public_key)
        .bind(&key.private_key)
        .bind(key.issued_at)
        .bind(key.expires_at)
        .execute(self.pool())
        .await
        .context("Failed to store server key")?;
        Ok(())
    }

    /// Key with the latest expiry, if any.
    pub async fn newest_server_key(&self) -> Result<Option<ServerKey>> {
        let row = sqlx::query("SELECT * FROM server_keys ORDER BY expires_at DESC LIMIT 1")
            .fetch_optional(self.pool())
            .await
            .context("Failed to load server key")?;
        Ok(row.as_ref().map(server_key_from_row))
    }

    pub async fn server_key_by_expiry(&self, expires_at: i64) -> Result<Option<ServerKey>> {
        let row = sqlx::query("SELECT * FROM server_keys WHERE expires_at = ? LIMIT 1")
            .bind(expires_at)
            .fetch_optional(self.pool())
            .await
            .context("Failed to load server key")?;
        Ok(row.as_ref().map(server_key_from_row))
    }

    pub async fn prune_server_keys(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM server_keys WHERE expires_at < ?")
            .bind(now)
            .execute(self.pool())
            .await
            .context("Failed to prune server keys")?;
        Ok(result.rows_affected())
    }

    // ── Remote key cache ──

    pub async fn get_remote_key(
        &self,
        domain: &str,
        expires_at: i64,
    ) -> Result<Option<RemoteServerKey>> {
        let row = sqlx::query("SELECT * FROM remote_server_keys WHERE domain = ? AND expires_at = ?")
            .bind(domain)
            .bind(expires_at)
            .fetch_optional(self.pool())
            .await
            .context("Failed to load remote key")?;
        Ok(row.map(|row| RemoteServerKey {
            domain: row.get("domain"),
            public_key: row.get("public_key"),
            expires_at: row.get("expires_at"),
            fetched_at: row.get("fetched_at"),
        }))
    }

    /// Cache a verified remote key; an existing entry wins.
    pub async fn insert_remote_key_if_absent(&self, key: &RemoteServerKey) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO remote_server_keys (domain, expires_at, public_key, fetched_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&key.domain)
        .bind(key.expires_at)
        .bind(&key.public_key)
        .bind(key.fetched_at)
        .execute(self.pool())
        .await
        .context("Failed to cache remote key")?;
        Ok(())
    }

    pub async fn prune_remote_keys(&self, now: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM remote_server_keys WHERE expires_at < ?")
            .bind(now)
            .execute(self.pool())
            .await
            .context("Failed to prune remote keys")?;
        Ok(result.rows_affected())
    }

    // ── Requests ──

    /// Store a request. Re-delivery of the same id is a no-op.
    pub async fn insert_request(&self, request: &Request) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO requests (id, sender, receiver, request_type, group_id, local, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.sender)
        .bind(&request.receiver)
        .bind(request.request_type.as_str())
        .bind(&request.group_id)
        .bind(request.local as i64)
        .bind(now())
        .execute(self.pool())
        .await
        .context("Failed to store request")?
        .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("Failed to load request")?;
        row.as_ref().map(request_from_row).transpose()
    }

    /// Requests addressed to or sent by `user_id`.
    pub async fn get_requests_for_user(&self, user_id: &str) -> Result<Vec<Request>> {
        let rows = sqlx::query(
            "SELECT * FROM requests WHERE receiver = ? OR sender = ? ORDER BY created_at, id",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .context("Failed to list requests")?;
        rows.iter().map(request_from_row).collect()
    }

    pub async fn delete_request(&self, id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .context("Failed to delete request")?
            .rows_affected();
        Ok(deleted > 0)
    }
}

fn server_key_from_row(row: &SqliteRow) -> ServerKey {
    ServerKey {
        public_key: row.get("public_key"),
        private_key: row.get("private_key"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
    }
}

fn request_from_row(row: &SqliteRow) -> Result<Request> {
    let request_type: String = row.get("request_type");
    Ok(Request {
        id: row.get("id"),
        sender: row.get("sender"),
        receiver: row.get("receiver"),
        request_type: RequestType::from_str(&request_type)
            .with_context(|| format!("Unknown request type {}", request_type))?,
        group_id: row.get("group_id"),
        local: row.get::<i64, _>("local") != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_ids_are_scoped_by_domain() {
        let db = Database::new_in_memory().await.unwrap();

        assert!(db.insert_event_id_if_absent("a.example", "e1").await.unwrap());
        assert!(!db.insert_event_id_if_absent("a.example", "e1").await.unwrap());
        assert!(db.insert_event_id_if_absent("b.example", "e1").await.unwrap());

        assert!(db.event_id_exists("a.example", "e1").await.unwrap());
        assert!(!db.event_id_exists("c.example", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_event_ids() {
        let db = Database::new_in_memory().await.unwrap();
        db.insert_event_id_if_absent("a.example", "e1").await.unwrap();

        assert_eq!(db.prune_event_ids(now() - 60).await.unwrap(), 0);
        assert_eq!(db.prune_event_ids(now() + 60).await.unwrap(), 1);
        assert!(!db.event_id_exists("a.example", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_key_first_insert_wins() {
        let db = Database::new_in_memory().await.unwrap();
        let key = RemoteServerKey {
            domain: "b.example".into(),
            public_key: "first".into(),
            expires_at: 2_000_000_000,
            fetched_at: 1,
        };
        db.insert_remote_key_if_absent(&key).await.unwrap();
        db.insert_remote_key_if_absent(&RemoteServerKey {
            public_key: "second".into(),
            ..key.clone()
        })
        .await
        .unwrap();

        let cached = db.get_remote_key("b.example", 2_000_000_000).await.unwrap().unwrap();
        assert_eq!(cached.public_key, "first");
        assert!(db.get_remote_key("b.example", 1).await.unwrap().is_none());

        assert_eq!(db.prune_remote_keys(2_000_000_001).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_newest_server_key() {
        let db = Database::new_in_memory().await.unwrap();
        assert!(db.newest_server_key().await.unwrap().is_none());

        for (public_key, expires_at) in [("old", 100), ("new", 200)] {
            db.insert_server_key(&ServerKey {
                public_key: public_key.into(),
                private_key: "seed".into(),
                issued_at: 0,
                expires_at,
            })
            .await
            .unwrap();
        }

        assert_eq!(db.newest_server_key().await.unwrap().unwrap().public_key, "new");
        assert_eq!(db.server_key_by_expiry(100).await.unwrap().unwrap().public_key, "old");
        assert_eq!(db.prune_server_keys(150).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_request_lifecycle() {
        let db = Database::new_in_memory().await.unwrap();
        let request = Request {
            id: "r1".into(),
            sender: "alice@a.example".into(),
            receiver: "bob@b.example".into(),
            request_type: RequestType::Group,
            group_id: Some("g1".into()),
            local: false,
        };

        assert!(db.insert_request(&request).await.unwrap());
        assert!(!db.insert_request(&request).await.unwrap());
        assert_eq!(db.get_requests_for_user("bob@b.example").await.unwrap(), vec![request.clone()]);
        assert_eq!(db.get_request("r1").await.unwrap(), Some(request));

        assert!(db.delete_request("r1").await.unwrap());
        assert!(!db.delete_request("r1").await.unwrap());
    }
}
