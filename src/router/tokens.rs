//! Authentication and action-token endpoints

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::auth::{validate_action_token, TokenValidation};
use crate::error::{DockMonError, Result};

use super::{AppState, Auth, SESSION_COOKIE};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>> {
    let client_ip = addr.ip().to_string();

    let user = state
        .db
        .get_user_by_name(&request.username)
        .await
        .map_err(|e| DockMonError::Internal(e.to_string()))?
        .ok_or_else(|| DockMonError::Unauthorized("bad credentials".into()))?;

    let presented = hex::encode(Sha256::digest(request.password.as_bytes()));
    if presented != user.password_hash {
        state
            .audit
            .log_event(
                "login_failed",
                "warning",
                Some(user.id),
                Some(&client_ip),
                json!({"username": request.username}),
            )
            .await;
        return Err(DockMonError::Unauthorized("bad credentials".into()));
    }

    let cookie = state.sessions.create(user.id, &client_ip).await?;
    Ok(Json(json!({
        "cookie_name": SESSION_COOKIE,
        "cookie_value": cookie,
        "user_id": user.id,
        "username": user.username,
    })))
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE) {
        let raw = cookie_header.to_str().unwrap_or_default();
        for pair in raw.split(';') {
            if let Some(value) = pair.trim().strip_prefix(&format!("{SESSION_COOKIE}=")) {
                state.sessions.destroy(value).await?;
            }
        }
    }
    Ok(Json(json!({ "logged_out": true })))
}

pub async fn get_prefs(State(state): State<AppState>, Auth(auth): Auth) -> Result<Json<Value>> {
    let prefs = state
        .db
        .get_user_prefs(auth.user_id)
        .await
        .map_err(|e| DockMonError::Internal(e.to_string()))?
        .unwrap_or_else(|| "{}".to_string());
    let parsed: Value = serde_json::from_str(&prefs).unwrap_or(json!({}));
    Ok(Json(parsed))
}

/// Preference writes above the size cap come back as 413.
pub async fn put_prefs(
    State(state): State<AppState>,
    Auth(auth): Auth,
    Json(prefs): Json<Value>,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    let raw = prefs.to_string();
    match state.db.set_user_prefs(auth.user_id, &raw).await {
        Ok(()) => Json(json!({ "saved": true })).into_response(),
        Err(crate::database::DatabaseError::Other(msg)) if msg.contains("exceed") => (
            axum::http::StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": true, "message": msg })),
        )
            .into_response(),
        Err(e) => DockMonError::Internal(e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ActionTokenRequest {
    pub token: String,
}

/// Validation endpoint: inspect without consuming.
pub async fn validate_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ActionTokenRequest>,
) -> Result<Json<Value>> {
    let result = validate_action_token(
        &state.db,
        &state.audit,
        &request.token,
        &addr.ip().to_string(),
        false,
    )
    .await?;
    Ok(Json(validation_to_json(result)))
}

/// Execute endpoint: single use, records the caller's address.
pub async fn execute_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ActionTokenRequest>,
) -> Result<Json<Value>> {
    let result = validate_action_token(
        &state.db,
        &state.audit,
        &request.token,
        &addr.ip().to_string(),
        true,
    )
    .await?;

    let TokenValidation::Valid {
        action_type,
        action_params,
        ..
    } = &result
    else {
        return Ok(Json(validation_to_json(result)));
    };

    // The parameterized action runs now; currently container restart
    // and update, the actions notifications link to.
    let outcome = execute_action(&state, action_type, action_params).await;

    let mut body = validation_to_json(result.clone());
    body["executed"] = json!(outcome.is_ok());
    if let Err(e) = outcome {
        body["execute_error"] = json!(e.to_string());
    }
    Ok(Json(body))
}

async fn execute_action(state: &AppState, action_type: &str, params: &Value) -> Result<()> {
    let host_id = params
        .get("host_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DockMonError::Validation("action params missing host_id".into()))?;
    let container_id = params
        .get("container_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DockMonError::Validation("action params missing container_id".into()))?;
    let short = crate::keys::normalize_container_id(container_id);

    match action_type {
        "container_restart" => {
            let session = state.manager.ensure(host_id).await?;
            session
                .restart_container(short)
                .await
                .map_err(|e| DockMonError::Transient(e.to_string()))?;
            Ok(())
        }
        "container_update" => {
            let new_image = params
                .get("new_image")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DockMonError::Validation("action params missing new_image".into()))?;
            state
                .updates
                .update_container(host_id, short, new_image, Default::default())
                .await?;
            Ok(())
        }
        other => Err(DockMonError::Validation(format!(
            "unknown action type '{other}'"
        ))),
    }
}

fn validation_to_json(result: TokenValidation) -> Value {
    match result {
        TokenValidation::Valid {
            token_id,
            user_id,
            username,
            action_type,
            action_params,
            hours_remaining,
        } => json!({
            "valid": true,
            "token_id": token_id,
            "user_id": user_id,
            "username": username,
            "action_type": action_type,
            "action_params": action_params,
            "hours_remaining": hours_remaining,
        }),
        TokenValidation::Invalid { reason } => json!({
            "valid": false,
            "reason": reason,
        }),
    }
}
