//! Data models for the federation server
//!
//! Everything here crosses the wire in camelCase JSON, either inside event
//! payloads or as part of a [`GroupSnapshot`].

use serde::{Deserialize, Serialize};

use crate::permissions::Permission;

/// Role id every member implicitly holds.
pub const EVERYONE_ROLE: &str = "everyone";

/// Split a federated address (`name@domain`) and return its domain.
pub fn user_domain(user_id: &str) -> Option<&str> {
    match user_id.rsplit_once('@') {
        Some((name, domain)) if !name.is_empty() && !domain.is_empty() => Some(domain),
        _ => None,
    }
}

/// Visibility of a group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupType {
    Public,
    #[default]
    Private,
}

impl GroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Public => "public",
            GroupType::Private => "private",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "public" => Some(GroupType::Public),
            "private" => Some(GroupType::Private),
            _ => None,
        }
    }
}

/// A group replica. `is_owner` marks the authoritative copy; `domain` is the
/// domain that owns the group and serves its snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_id: String,
    pub domain: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    pub owner: String,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub allow_join: bool,
    #[serde(default)]
    pub is_owner: bool,
    /// Version token: id of the last event applied to this replica.
    pub before_event_id: String,
    #[serde(default)]
    pub invites: Vec<String>,
    #[serde(default)]
    pub requests: Vec<String>,
    #[serde(default)]
    pub bans: Vec<String>,
}

/// Mutable group settings carried by `t.group.sync.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(rename = "type")]
    pub group_type: GroupType,
    pub allow_join: bool,
}

impl GroupSettings {
    pub fn of(group: &Group) -> Self {
        Self {
            name: group.name.clone(),
            description: group.description.clone(),
            icon: group.icon.clone(),
            group_type: group.group_type,
            allow_join: group.allow_join,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub group_id: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub group_id: String,
    pub role_id: String,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub group_id: String,
    pub channel_id: String,
    pub name: String,
    #[serde(default)]
    pub category_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub group_id: String,
    pub category_id: String,
    pub name: String,
}

/// Per-role permission grant on a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPermission {
    pub group_id: String,
    pub channel_id: String,
    pub role_id: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// Per-role permission grant on a category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPermission {
    pub group_id: String,
    pub category_id: String,
    pub role_id: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// Authoritative full state of a group, served by the owning domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub group: Group,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub channel_permissions: Vec<ChannelPermission>,
    #[serde(default)]
    pub category_permissions: Vec<CategoryPermission>,
}

impl GroupSnapshot {
    /// Version token the snapshot represents.
    pub fn token(&self) -> &str {
        &self.group.before_event_id
    }
}

/// Replay-protection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventIdRecord {
    pub event_id: String,
    pub domain: String,
    pub timestamp: i64,
}

/// Local signing key. `private_key` is the base64 Ed25519 seed and never
/// leaves this process.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerKey {
    pub public_key: String,
    pub private_key: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Cached public key of a remote domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteServerKey {
    pub domain: String,
    pub public_key: String,
    pub expires_at: i64,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Friend,
    Group,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Friend => "friend",
            RequestType::Group => "group",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "friend" => Some(RequestType::Friend),
            "group" => Some(RequestType::Group),
            _ => None,
        }
    }
}

/// Pending cross-domain action (friend request, group invite)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    #[serde(default)]
    pub group_id: Option<String>,
    /// True when the request originated on this domain.
    #[serde(default)]
    pub local: bool,
}

// ── HTTP bodies ──

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub domain: String,
    pub uptime_seconds: u64,
}

/// Body of `GET /_federation/v1/key`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResponse {
    pub domain: String,
    pub public_key: String,
    /// RFC3339 expiry, identical to the `expire` field of headers signed
    /// with this key.
    pub expire: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_domain_splits_on_last_at() {
        assert_eq!(user_domain("alice@a.example"), Some("a.example"));
        assert_eq!(user_domain("we@ird@b.example"), Some("b.example"));
        assert_eq!(user_domain("127.0.0.1:9000"), None);
        assert_eq!(user_domain("@b.example"), None);
        assert_eq!(user_domain("alice@"), None);
    }

    #[test]
    fn group_uses_wire_names() {
        let group = Group {
            group_id: "g1".into(),
            domain: "a.example".into(),
            name: "Rust".into(),
            description: None,
            icon: None,
            owner: "alice@a.example".into(),
            group_type: GroupType::Public,
            allow_join: true,
            is_owner: true,
            before_event_id: "e1".into(),
            invites: vec![],
            requests: vec![],
            bans: vec![],
        };
        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["groupId"], "g1");
        assert_eq!(json["type"], "public");
        assert_eq!(json["beforeEventId"], "e1");
        assert_eq!(json["allowJoin"], true);
    }

    #[test]
    fn server_key_debug_redacts_private_half() {
        let key = ServerKey {
            public_key: "pub".into(),
            private_key: "very-secret".into(),
            issued_at: 0,
            expires_at: 1,
        };
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
