//! Agent registration and the agent WebSocket endpoint

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agent::{AgentChannel, AgentHello, RegistrationRequest};
use crate::error::Result;
use crate::events::OfflineReason;

use super::AppState;

/// `POST /api/agent/register` — token-authenticated; creates or
/// migrates the agent's host record.
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegistrationRequest>,
) -> Result<Json<Value>> {
    let response = state.agents.register(&state.db, &request).await?;
    let _ = state
        .db
        .log_event(
            Some(&response.host_id),
            None,
            "agent_registered",
            &format!(
                "engine {} ({}), migration={}",
                request.engine_id, request.hostname, response.migration_detected
            ),
        )
        .await;
    Ok(Json(serde_json::to_value(response).unwrap_or(Value::Null)))
}

/// `GET /api/agent/ws` — the long-lived duplex channel. The first frame
/// must be a hello carrying the registration token and engine ID.
pub async fn agent_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Handshake: one hello frame, then the channel goes duplex.
    let hello: AgentHello = match receiver.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
            Ok(hello) => hello,
            Err(e) => {
                let _ = sender
                    .send(Message::Text(
                        json!({"type": "error", "message": format!("bad hello: {e}")}).to_string(),
                    ))
                    .await;
                return;
            }
        },
        _ => return,
    };

    // Re-registration by engine ID: an agent that already owns a host
    // reuses it, otherwise the hello token must mint one.
    let host_id = match state.db.find_host_by_engine_id(&hello.engine_id).await {
        Ok(Some(host)) if host.is_active && host.connection_type == crate::database::ConnectionType::Agent => {
            host.id
        }
        _ => {
            let request = RegistrationRequest::from(hello.clone());
            match state.agents.register(&state.db, &request).await {
                Ok(response) => response.host_id,
                Err(e) => {
                    let _ = sender
                        .send(Message::Text(
                            json!({"type": "error", "message": e.to_string()}).to_string(),
                        ))
                        .await;
                    return;
                }
            }
        }
    };

    info!(host = %host_id, engine = %hello.engine_id, "agent connected");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(256);
    let channel = Arc::new(AgentChannel::new(host_id.clone(), outbound_tx));
    state.agents.attach(&host_id, channel.clone());
    state.manager.mark_online(&host_id);

    let _ = sender
        .send(Message::Text(
            json!({"type": "registered", "host_id": host_id}).to_string(),
        ))
        .await;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => channel.handle_incoming(&text),
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(host = %host_id, "agent socket error: {e}");
                    break;
                }
                _ => {}
            },
        }
    }

    // Channel loss moves the host offline.
    channel.close();
    state.agents.detach(&host_id);
    state.manager.drop_session(&host_id);
    state.manager.mark_offline(&host_id, OfflineReason::Unreachable);
    info!(host = %host_id, "agent disconnected");
}
