//! Template endpoints

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::deploy::render_template;
use crate::error::Result;

use super::{AppState, Auth};

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

pub async fn list_templates(
    State(state): State<AppState>,
    Auth(_auth): Auth,
) -> Result<Json<Value>> {
    let templates = state.templates.list().await?;
    Ok(Json(json!({ "templates": templates })))
}

pub async fn create_template(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Json(request): Json<CreateTemplateRequest>,
) -> Result<Json<Value>> {
    let id = state
        .templates
        .create(&request.name, &request.description, &request.content)
        .await?;
    Ok(Json(json!({ "id": id })))
}

pub async fn get_template(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    let template = state.templates.get(id).await?;
    Ok(Json(serde_json::to_value(template).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    #[serde(default)]
    pub description: String,
    pub content: String,
}

pub async fn update_template(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<i64>,
    Json(request): Json<UpdateTemplateRequest>,
) -> Result<Json<Value>> {
    state
        .templates
        .update(id, &request.description, &request.content)
        .await?;
    Ok(Json(json!({ "updated": id })))
}

pub async fn delete_template(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    state.templates.delete(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

pub async fn render(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<i64>,
    Json(request): Json<RenderRequest>,
) -> Result<Json<Value>> {
    let template = state.templates.get(id).await?;
    let rendered = render_template(&template.content, &request.variables)?;
    Ok(Json(json!({ "content": rendered })))
}
