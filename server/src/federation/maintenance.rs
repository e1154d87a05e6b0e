//! Background federation upkeep: replay cache and key cache pruning, and
//! proactive rotation of the local signing key.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::state::{AppState, SharedState};

/// Counts of rows removed by one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub event_ids: u64,
    pub remote_keys: u64,
    pub server_keys: u64,
}

/// Spawn the background federation maintenance task.
/// Runs every `maintenance_interval_secs`; the first pass runs immediately.
pub fn spawn_federation_maintenance(state: SharedState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.maintenance_interval());
        loop {
            interval.tick().await;
            if let Err(e) = run_maintenance(&state, Utc::now().timestamp()).await {
                warn!("Federation maintenance error: {:#}", e);
            }
        }
    });
}

/// One maintenance pass evaluated at `now` (unix seconds).
pub async fn run_maintenance(state: &AppState, now: i64) -> anyhow::Result<MaintenanceReport> {
    // Rotate before pruning so there is always an unexpired key to publish.
    let key = state.keys.current_key_at(now).await?;
    debug!("Federation: signing key valid until {}", key.expires_at);

    let retention = i64::try_from(state.config.event_retention_secs).unwrap_or(i64::MAX);
    let report = MaintenanceReport {
        event_ids: state.db.prune_event_ids(now.saturating_sub(retention)).await?,
        remote_keys: state.db.prune_remote_keys(now).await?,
        server_keys: state.db.prune_server_keys(now).await?,
    };

    if report != MaintenanceReport::default() {
        info!(
            "Federation: pruned {} event id(s), {} remote key(s), {} expired signing key(s)",
            report.event_ids, report.remote_keys, report.server_keys
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use crate::models::RemoteServerKey;

    #[tokio::test]
    async fn test_prunes_expired_entries() {
        let config = FederationConfig {
            key_validity_secs: 100,
            key_rotation_margin_secs: 10,
            event_retention_secs: 100,
            ..FederationConfig::for_domain("a.example")
        };
        let state = AppState::new_in_memory(config).await.unwrap();
        let now = Utc::now().timestamp();

        state.db.insert_event_id_if_absent("b.example", "e1").await.unwrap();
        state
            .db
            .insert_remote_key_if_absent(&RemoteServerKey {
                domain: "b.example".into(),
                public_key: "stale".into(),
                expires_at: now - 10,
                fetched_at: now - 1000,
            })
            .await
            .unwrap();

        // Evaluated well past the retention window of e1.
        let report = run_maintenance(&state, now + 1000).await.unwrap();
        assert_eq!(report.event_ids, 1);
        assert_eq!(report.remote_keys, 1);
        assert!(!state.db.event_id_exists("b.example", "e1").await.unwrap());

        // A fresh key exists after the pass.
        assert!(state.db.newest_server_key().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recent_entries_survive() {
        let state = AppState::new_in_memory(FederationConfig::for_domain("a.example"))
            .await
            .unwrap();
        let now = Utc::now().timestamp();

        state.db.insert_event_id_if_absent("b.example", "e1").await.unwrap();
        let report = run_maintenance(&state, now).await.unwrap();
        assert_eq!(report.event_ids, 0);
        assert!(state.db.event_id_exists("b.example", "e1").await.unwrap());
    }
}
