//! Stack endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;

use super::{AppState, Auth};

#[derive(Debug, Deserialize)]
pub struct CreateStackRequest {
    pub name: String,
    pub content: String,
}

pub async fn list_stacks(State(state): State<AppState>, Auth(_auth): Auth) -> Result<Json<Value>> {
    let stacks = state.stacks.list().await?;
    Ok(Json(json!({ "stacks": stacks })))
}

pub async fn create_stack(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Json(request): Json<CreateStackRequest>,
) -> Result<Json<Value>> {
    let record = state.stacks.create(&request.name, &request.content).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

pub async fn get_stack(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let (record, content) = state.stacks.get(&name).await?;
    Ok(Json(json!({
        "name": record.name,
        "compose_path": record.compose_path,
        "content": content,
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStackRequest {
    pub content: String,
}

pub async fn update_stack(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(name): Path<String>,
    Json(request): Json<UpdateStackRequest>,
) -> Result<Json<Value>> {
    state.stacks.update(&name, &request.content).await?;
    Ok(Json(json!({ "updated": name })))
}

#[derive(Debug, Deserialize)]
pub struct RenameStackRequest {
    pub new_name: String,
}

pub async fn rename_stack(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(name): Path<String>,
    Json(request): Json<RenameStackRequest>,
) -> Result<Json<Value>> {
    state.stacks.rename(&name, &request.new_name).await?;
    Ok(Json(json!({ "renamed": request.new_name })))
}

#[derive(Debug, Deserialize)]
pub struct CopyStackRequest {
    pub target: String,
}

pub async fn copy_stack(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(name): Path<String>,
    Json(request): Json<CopyStackRequest>,
) -> Result<Json<Value>> {
    let record = state.stacks.copy(&name, &request.target).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

pub async fn delete_stack(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    state.stacks.delete(&name).await?;
    Ok(Json(json!({ "deleted": name })))
}
