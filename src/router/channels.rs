//! Notification channel and alert rule endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::alerts::AlertKind;
use crate::database::{AlertRuleRecord, BlackoutWindow, ChannelRef};
use crate::error::{DockMonError, Result};
use crate::notifications::ChannelConfig;

use super::{AppState, Auth};

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub config: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn list_channels(
    State(state): State<AppState>,
    Auth(_auth): Auth,
) -> Result<Json<Value>> {
    let channels = state.db.list_channels(false).await.map_err(internal)?;
    Ok(Json(json!({ "channels": channels })))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Json(request): Json<CreateChannelRequest>,
) -> Result<Json<Value>> {
    // Config shape is validated per type before anything persists.
    ChannelConfig::parse(&request.channel_type, &request.config)
        .map_err(DockMonError::Validation)?;

    let id = state
        .db
        .insert_channel(&request.name, &request.channel_type, &request.config, request.enabled)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "id": id })))
}

/// Channel deletion cascades into rules: rules left with no channels
/// are deleted (their names are returned), multi-channel rules just
/// lose the reference.
pub async fn delete_channel(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<i64>,
) -> Result<Json<Value>> {
    if state.db.get_channel(id).await.map_err(internal)?.is_none() {
        return Err(DockMonError::NotFound(format!("channel {id}")));
    }

    let deleted_alerts = state.db.remove_channel_from_rules(id).await.map_err(internal)?;
    state.db.delete_channel(id).await.map_err(internal)?;

    Ok(Json(json!({ "deleted": id, "deleted_alerts": deleted_alerts })))
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRuleRequest {
    pub name: String,
    pub kind: String,
    pub scope_type: String,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub window_secs: Option<i64>,
    #[serde(default = "default_severity")]
    pub severity: String,
    pub notify_channels: Vec<ChannelRef>,
    #[serde(default)]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub blackout_windows: Vec<BlackoutWindow>,
    #[serde(default)]
    pub trigger_events: Option<Vec<String>>,
    #[serde(default)]
    pub trigger_states: Option<Vec<String>>,
}

fn default_severity() -> String {
    "warning".into()
}

pub async fn list_alert_rules(
    State(state): State<AppState>,
    Auth(_auth): Auth,
) -> Result<Json<Value>> {
    let rules = state.db.list_alert_rules(false).await.map_err(internal)?;
    Ok(Json(json!({ "rules": rules })))
}

pub async fn create_alert_rule(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Json(request): Json<CreateAlertRuleRequest>,
) -> Result<Json<Value>> {
    let kind = AlertKind::parse(&request.kind)
        .ok_or_else(|| DockMonError::Validation(format!("unknown alert kind '{}'", request.kind)))?;

    // Empty trigger lists normalize to absent; state/event kinds need at
    // least one of the two populated.
    let events = request.trigger_events.filter(|l| !l.is_empty());
    let states = request.trigger_states.filter(|l| !l.is_empty());
    if kind.needs_triggers() && events.is_none() && states.is_none() {
        return Err(DockMonError::Validation(
            "rule needs trigger_events or trigger_states".into(),
        ));
    }

    if request.notify_channels.is_empty() {
        return Err(DockMonError::Validation(
            "rule needs at least one notification channel".into(),
        ));
    }

    let now = Utc::now();
    let rule = AlertRuleRecord {
        id: uuid::Uuid::new_v4().to_string(),
        name: request.name,
        kind: request.kind,
        scope_type: request.scope_type,
        scope_id: request.scope_id,
        operator: request.operator,
        threshold: request.threshold,
        window_secs: request.window_secs,
        severity: request.severity,
        notify_channels: request.notify_channels,
        cooldown_minutes: request.cooldown_minutes,
        blackout_windows: request.blackout_windows,
        enabled: true,
        trigger_events: events,
        trigger_states: states,
        created_at: now,
        updated_at: now,
    };

    state.db.insert_alert_rule(&rule).await.map_err(internal)?;
    Ok(Json(json!({ "id": rule.id })))
}

pub async fn delete_alert_rule(
    State(state): State<AppState>,
    Auth(_auth): Auth,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    if !state.db.delete_alert_rule(&id).await.map_err(internal)? {
        return Err(DockMonError::NotFound(format!("alert rule {id}")));
    }
    Ok(Json(json!({ "deleted": id })))
}

fn internal(e: crate::database::DatabaseError) -> DockMonError {
    DockMonError::Internal(e.to_string())
}
