//! Deployment, update and batch pre-flight endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::database::DeploymentType;
use crate::deploy::DeploymentRequest;
use crate::error::{DockMonError, Result};
use crate::keys::normalize_container_id;
use crate::updates::{validate_batch, UpdateCandidate, UpdateOptions};

use super::{AppState, Auth};

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub host_id: String,
    pub name: String,
    pub deployment_type: DeploymentType,
    pub definition: String,
    #[serde(default)]
    pub stack_name: Option<String>,
    #[serde(default = "default_rollback")]
    pub rollback_on_failure: bool,
}

fn default_rollback() -> bool {
    true
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<Json<Value>> {
    let record = state
        .deployments
        .create(DeploymentRequest {
            host_id: request.host_id,
            name: request.name,
            deployment_type: request.deployment_type,
            definition: request.definition,
            stack_name: request.stack_name,
            rollback_on_failure: request.rollback_on_failure,
        })
        .await?;

    // Execution runs in the background; progress flows over the hub.
    let executor = state.deployments.clone();
    let id = record.id.clone();
    tokio::spawn(async move {
        let _ = executor.execute(&id).await;
    });

    Ok(Json(json!({ "id": record.id, "status": record.status })))
}

pub async fn list_deployments(
    State(state): State<AppState>,
    Auth(_auth): Auth,
) -> Result<Json<Value>> {
    let deployments = state
        .db
        .list_deployments()
        .await
        .map_err(|e| DockMonError::Internal(e.to_string()))?;
    Ok(Json(json!({ "deployments": deployments })))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let deployment = state
        .db
        .get_deployment(&id)
        .await
        .map_err(|e| DockMonError::Internal(e.to_string()))?
        .ok_or_else(|| DockMonError::NotFound(format!("deployment {id}")))?;
    Ok(Json(serde_json::to_value(deployment).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct SaveTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// `POST /api/deployments/{id}/save-as-template`: 404 for a missing
/// deployment, 409 for a taken template name.
pub async fn save_as_template(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<String>,
    Json(request): Json<SaveTemplateRequest>,
) -> Result<Json<Value>> {
    let template_id = state
        .templates
        .save_deployment_as(&id, &request.name, &request.description)
        .await?;
    let template = state.templates.get(template_id).await?;
    Ok(Json(serde_json::to_value(template).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct BatchValidateRequest {
    pub containers: Vec<BatchValidateEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BatchValidateEntry {
    pub container_id: String,
    pub image: String,
}

/// `POST /api/batch/validate-update`
///
/// Self-protection is decided here from the candidate's image, never
/// from anything the caller asserts about itself.
pub async fn batch_validate_update(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Json(request): Json<BatchValidateRequest>,
) -> Result<Json<Value>> {
    let policies = state
        .db
        .list_update_policies(true)
        .await
        .map_err(|e| DockMonError::Internal(e.to_string()))?;

    let candidates: Vec<UpdateCandidate> = request
        .containers
        .into_iter()
        .map(|entry| UpdateCandidate::new(entry.container_id, entry.image))
        .collect();

    let result = validate_batch(&policies, &candidates);
    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateContainerRequest {
    pub new_image: String,
    #[serde(default)]
    pub stop_timeout: Option<i64>,
    #[serde(default)]
    pub health_timeout: Option<u64>,
}

/// `POST /api/hosts/{host_id}/containers/{id}/update`
pub async fn update_container(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path((host_id, container_id)): Path<(String, String)>,
    Json(request): Json<UpdateContainerRequest>,
) -> Result<Json<Value>> {
    let short = normalize_container_id(&container_id).to_string();

    let mut options = UpdateOptions {
        stop_timeout_secs: state.config.updates.stop_timeout_secs as i64,
        health_timeout_secs: state.config.deployments.health_timeout_secs,
        pull_timeout_secs: state.config.updates.update_timeout_secs,
    };
    if let Some(stop) = request.stop_timeout {
        options.stop_timeout_secs = stop;
    }
    if let Some(health) = request.health_timeout {
        options.health_timeout_secs = health;
    }

    let result = state
        .updates
        .update_container(&host_id, &short, &request.new_image, options)
        .await?;

    Ok(Json(json!({
        "success": result.success,
        "old_container_id": result.old_container_id,
        "new_container_id": result.new_container_id,
        "container_name": result.container_name,
        "rolled_back": result.rolled_back,
        "error": result.error,
    })))
}
