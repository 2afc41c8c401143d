//! WebSocket upgrade and per-client socket loop

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::router::{authenticate_request, AppState};

use super::Envelope;

/// Client-to-hub control frames.
#[derive(Debug, Deserialize)]
struct WsIncoming {
    action: String,
    #[serde(default)]
    topics: Vec<String>,
}

/// Authenticated WebSocket upgrade. Auth happens before the upgrade is
/// accepted, so unauthenticated sockets never reach the hub.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client_ip = addr.ip().to_string();
    match authenticate_request(&state, &headers, &client_ip).await {
        Ok(auth) => ws.on_upgrade(move |socket| handle_socket(socket, state, auth.user_id)),
        Err(e) => e.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut outbound) = state.hub.register();

    info!(client = client_id, user_id, "hub socket connected");

    let _ = sender
        .send(Message::Text(
            Envelope::new("hello", json!({"topics": super::TOPICS})).to_json(),
        ))
        .await;

    loop {
        tokio::select! {
            // Hub-originated frames; a closed channel means the hub
            // dropped us for falling behind.
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender
                        .send(Message::Text(
                            Envelope::new("disconnected", json!({"reason": "slow_consumer"}))
                                .to_json(),
                        ))
                        .await;
                    break;
                }
            },

            // Client control frames.
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(incoming) = serde_json::from_str::<WsIncoming>(&text) else {
                        continue;
                    };
                    match incoming.action.as_str() {
                        "subscribe" => {
                            for topic in &incoming.topics {
                                if !state.hub.subscribe(client_id, topic) {
                                    let _ = sender
                                        .send(Message::Text(
                                            Envelope::new(
                                                "error",
                                                json!({"message": format!("unknown topic: {topic}")}),
                                            )
                                            .to_json(),
                                        ))
                                        .await;
                                }
                            }
                        }
                        "unsubscribe" => {
                            for topic in &incoming.topics {
                                state.hub.unsubscribe(client_id, topic);
                            }
                        }
                        other => debug!(client = client_id, action = other, "unknown ws action"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client = client_id, "ws receive error: {e}");
                    break;
                }
                _ => {}
            },
        }
    }

    state.hub.disconnect(client_id);
    info!(client = client_id, "hub socket closed");
}
