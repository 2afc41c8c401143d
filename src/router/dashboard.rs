//! Dashboard summary endpoint

use axum::{extract::State, Json};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::error::Result;
use crate::events::ContainerState;

use super::{AppState, Auth};

/// `GET /api/dashboard/summary`
///
/// Fleet-wide counts. Container counts cover online hosts only; the
/// timestamp is UTC with a trailing `Z`.
pub async fn summary(State(state): State<AppState>, Auth(_auth): Auth) -> Result<Json<Value>> {
    let hosts = state
        .db
        .list_hosts()
        .await
        .map_err(|e| crate::error::DockMonError::Internal(e.to_string()))?;
    let active: Vec<_> = hosts.into_iter().filter(|h| h.is_active).collect();

    let mut running = 0usize;
    let mut stopped = 0usize;
    let mut paused = 0usize;
    let mut total = 0usize;

    for host in &active {
        let Some(session) = state.manager.get(&host.id) else { continue };
        let Ok(containers) = session.list_containers(true).await else { continue };
        for brief in containers {
            total += 1;
            match brief.state {
                ContainerState::Running => running += 1,
                ContainerState::Paused => paused += 1,
                _ => stopped += 1,
            }
        }
    }

    let online = state.manager.online_count();
    let updates = state.db.count_updates_available().await.unwrap_or(0);
    let alerts = state.db.count_open_alerts().await.unwrap_or(0);

    Ok(Json(json!({
        "hosts": {
            "online": online,
            "offline": active.len().saturating_sub(online),
            "total": active.len(),
        },
        "containers": {
            "running": running,
            "stopped": stopped,
            "paused": paused,
            "total": total,
        },
        "updates": { "available": updates },
        "alerts": { "active": alerts },
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_format_has_z() {
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        assert!(ts.ends_with('Z'));
    }
}
