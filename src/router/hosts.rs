//! Host CRUD and host-scoped container operations
//!
//! Container IDs arriving at these endpoints are normalized to the
//! 12-character short form before any key is built, so 64-char IDs from
//! inspect output address the same records as list output.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::database::{ConnectionType, DesiredState, HealthCheckRecord, HostRecord};
use crate::error::{DockMonError, Result};
use crate::keys::{make_composite_key, normalize_container_id};

use super::{AppState, Auth};

#[derive(Debug, Deserialize)]
pub struct CreateHostRequest {
    pub name: String,
    pub url: String,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub tls_ca: Option<String>,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
}

pub async fn list_hosts(State(state): State<AppState>, Auth(_auth): Auth) -> Result<Json<Value>> {
    let hosts = state.db.list_hosts().await.map_err(internal)?;
    let enriched: Vec<Value> = hosts
        .into_iter()
        .map(|host| {
            let (status, reason) = state.manager.host_status(&host.id);
            json!({
                "id": host.id,
                "name": host.name,
                "url": host.url,
                "connection_type": host.connection_type,
                "is_active": host.is_active,
                "replaced_by_host_id": host.replaced_by_host_id,
                "status": status,
                "offline_reason": reason,
            })
        })
        .collect();
    Ok(Json(json!({ "hosts": enriched })))
}

pub async fn create_host(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Json(request): Json<CreateHostRequest>,
) -> Result<Json<Value>> {
    if request.name.trim().is_empty() {
        return Err(DockMonError::Validation("host name must not be empty".into()));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let mut record = HostRecord::new(&id, &request.name, &request.url, request.connection_type);
    record.tls.ca = request.tls_ca;
    record.tls.cert = request.tls_cert;
    record.tls.key = request.tls_key;

    state.db.insert_host(&record).await.map_err(internal)?;

    // Best effort first connect; the record exists either way.
    let _ = state.manager.ensure(&id).await;

    Ok(Json(json!({ "id": id })))
}

pub async fn get_host(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(host_id): Path<String>,
) -> Result<Json<Value>> {
    let host = state
        .db
        .get_host(&host_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| DockMonError::NotFound(format!("host {host_id}")))?;
    let (status, reason) = state.manager.host_status(&host_id);
    Ok(Json(json!({
        "id": host.id,
        "name": host.name,
        "url": host.url,
        "connection_type": host.connection_type,
        "engine_id": host.engine_id,
        "is_active": host.is_active,
        "replaced_by_host_id": host.replaced_by_host_id,
        "system_info": host.system_info,
        "status": status,
        "offline_reason": reason,
    })))
}

/// Host deletion: cleanup first (resolves alerts, removes per-host
/// records), then the row; CASCADE takes the dependents.
pub async fn delete_host(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(host_id): Path<String>,
) -> Result<Json<Value>> {
    let counts = state.db.cleanup_host_data(&host_id).await.map_err(internal)?;
    let deleted = state.db.delete_host(&host_id).await.map_err(internal)?;
    if !deleted {
        return Err(DockMonError::NotFound(format!("host {host_id}")));
    }
    state.manager.remove(&host_id);

    Ok(Json(json!({
        "deleted": true,
        "cleanup": {
            "auto_restart_configs": counts.auto_restart_configs,
            "desired_states": counts.desired_states,
            "alerts_resolved": counts.alerts_resolved,
        }
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListContainersQuery {
    pub all: Option<bool>,
}

pub async fn list_containers(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(host_id): Path<String>,
    Query(query): Query<ListContainersQuery>,
) -> Result<Json<Value>> {
    let session = state.manager.ensure(&host_id).await?;
    let containers = session
        .list_containers(query.all.unwrap_or(true))
        .await
        .map_err(|e| DockMonError::Transient(e.to_string()))?;
    Ok(Json(json!({ "containers": containers })))
}

async fn resolve(
    state: &AppState,
    host_id: &str,
    container_id: &str,
) -> Result<(std::sync::Arc<crate::docker::HostSession>, String, String)> {
    let short = normalize_container_id(container_id).to_string();
    let composite = make_composite_key(host_id, &short)?;
    let session = state.manager.ensure(host_id).await?;
    Ok((session, short, composite))
}

pub async fn restart_container(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let (session, short, composite) = resolve(&state, &host_id, &container_id).await?;
    session
        .restart_container(&short)
        .await
        .map_err(|e| map_container_error(e, &composite))?;
    let _ = state
        .db
        .log_event(Some(&host_id), Some(&composite), "container_restart", "api")
        .await;
    Ok(Json(json!({ "restarted": composite })))
}

pub async fn stop_container(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let (session, short, composite) = resolve(&state, &host_id, &container_id).await?;
    session
        .stop_container(&short, None)
        .await
        .map_err(|e| map_container_error(e, &composite))?;
    Ok(Json(json!({ "stopped": composite })))
}

pub async fn start_container(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let (session, short, composite) = resolve(&state, &host_id, &container_id).await?;
    session
        .start_container(&short)
        .await
        .map_err(|e| map_container_error(e, &composite))?;
    Ok(Json(json!({ "started": composite })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<String>,
}

pub async fn container_logs(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>> {
    let (session, short, composite) = resolve(&state, &host_id, &container_id).await?;
    let lines = session
        .container_logs(&short, query.tail.as_deref().unwrap_or("100"))
        .await
        .map_err(|e| map_container_error(e, &composite))?;
    Ok(Json(json!({ "lines": lines })))
}

#[derive(Debug, Deserialize)]
pub struct AutoRestartRequest {
    pub enabled: bool,
    #[serde(default)]
    pub container_name: String,
}

pub async fn set_auto_restart(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
    Json(request): Json<AutoRestartRequest>,
) -> Result<Json<Value>> {
    let short = normalize_container_id(&container_id).to_string();
    state
        .db
        .set_auto_restart(&host_id, &short, &request.container_name, request.enabled)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "enabled": request.enabled })))
}

#[derive(Debug, Deserialize)]
pub struct DesiredStateRequest {
    pub desired: DesiredState,
    #[serde(default)]
    pub container_name: String,
}

pub async fn set_desired_state(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
    Json(request): Json<DesiredStateRequest>,
) -> Result<Json<Value>> {
    let short = normalize_container_id(&container_id).to_string();
    state
        .db
        .set_desired_state(&host_id, &short, &request.container_name, request.desired)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "desired": request.desired })))
}

pub async fn set_health_check(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
    Json(mut check): Json<HealthCheckRecord>,
) -> Result<Json<Value>> {
    let short = normalize_container_id(&container_id).to_string();
    check.container_id = make_composite_key(&host_id, &short)?;
    check.host_id = host_id;

    url::Url::parse(&check.url)
        .map_err(|e| DockMonError::Validation(format!("invalid health check url: {e}")))?;

    state.db.upsert_health_check(&check).await.map_err(internal)?;
    state.health.reload().await;
    Ok(Json(json!({ "container_id": check.container_id })))
}

pub async fn delete_health_check(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let short = normalize_container_id(&container_id).to_string();
    let composite = make_composite_key(&host_id, &short)?;

    let existed = state.db.delete_health_check(&composite).await.map_err(internal)?;
    if !existed {
        return Err(DockMonError::NotFound(format!("health check {composite}")));
    }
    let _ = state.health.remove_agent_check(&host_id, &composite).await;
    state.health.reload().await;
    Ok(Json(json!({ "deleted": composite })))
}

fn internal(e: crate::database::DatabaseError) -> DockMonError {
    DockMonError::Internal(e.to_string())
}

fn map_container_error(e: crate::docker::SessionError, composite: &str) -> DockMonError {
    match e {
        crate::docker::SessionError::ContainerNotFound(_) => {
            DockMonError::NotFound(format!("container {composite}"))
        }
        other => DockMonError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_id_normalized_at_boundary() {
        let full = "67c5d214133846c397f4d9947f28cb513377db1fcc74633efd0d13793c45d4f2";
        let short = normalize_container_id(full);
        let key = make_composite_key("h1", short).unwrap();
        assert_eq!(key, "h1:67c5d2141338");
    }

    #[test]
    fn test_cross_host_keys_distinct() {
        // Same short ID on two hosts addresses two different records.
        let k1 = make_composite_key("h1", "abc123def456").unwrap();
        let k2 = make_composite_key("h2", "abc123def456").unwrap();
        assert_ne!(k1, k2);
    }
}
