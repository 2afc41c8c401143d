//! Duplex command channel to an on-host agent

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Default wait for a single command round-trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent disconnected")]
    Disconnected,

    #[error("command timed out")]
    Timeout,

    #[error("agent error: {0}")]
    Remote(String),
}

/// Handshake payload sent by an agent on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHello {
    pub token: String,
    pub engine_id: String,
    pub hostname: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Unsolicited message pushed by the agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Relayed Docker event from the agent's local daemon.
    Docker { payload: Value },
    /// Result of an agent-side health probe.
    HealthResult { payload: Value },
}

/// Outbound command frame. Request/response correlation is by generated
/// `id`; the agent echoes it back on the matching response frame.
#[derive(Debug, Serialize)]
struct CommandFrame<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    command_type: &'a str,
    payload: &'a Value,
}

#[derive(Debug, Deserialize)]
struct IncomingFrame {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    error: Option<String>,
}

/// One connected agent. Cloned handles share the pending-request map and
/// the outbound writer.
#[derive(Debug)]
pub struct AgentChannel {
    host_id: String,
    outbound: mpsc::Sender<String>,
    pending: DashMap<String, oneshot::Sender<Result<Value, AgentError>>>,
    events: broadcast::Sender<AgentEvent>,
    connected: AtomicBool,
}

impl AgentChannel {
    pub fn new(host_id: String, outbound: mpsc::Sender<String>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            host_id,
            outbound,
            pending: DashMap::new(),
            events,
            connected: AtomicBool::new(true),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Send a command and wait for the correlated response.
    pub async fn send_command(&self, command_type: &str, payload: Value) -> Result<Value, AgentError> {
        self.send_command_timeout(command_type, payload, COMMAND_TIMEOUT)
            .await
    }

    pub async fn send_command_timeout(
        &self,
        command_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        if !self.is_connected() {
            return Err(AgentError::Disconnected);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let frame = serde_json::to_string(&CommandFrame {
            id: &id,
            command_type,
            payload: &payload,
        })
        .expect("command frame serializes");

        if self.outbound.send(frame).await.is_err() {
            self.pending.remove(&id);
            return Err(AgentError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AgentError::Disconnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(AgentError::Timeout)
            }
        }
    }

    /// Feed a raw frame received from the socket.
    pub fn handle_incoming(&self, text: &str) {
        let frame: IncomingFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(host = %self.host_id, "unparseable agent frame: {e}");
                return;
            }
        };

        match frame.frame_type.as_str() {
            "response" => {
                let Some(id) = frame.id else {
                    warn!(host = %self.host_id, "response frame without id");
                    return;
                };
                if let Some((_, waiter)) = self.pending.remove(&id) {
                    let result = match frame.error {
                        Some(message) => Err(AgentError::Remote(message)),
                        None => Ok(frame.payload),
                    };
                    let _ = waiter.send(result);
                } else {
                    debug!(host = %self.host_id, id, "late agent response dropped");
                }
            }
            "docker_event" => {
                let _ = self.events.send(AgentEvent::Docker {
                    payload: frame.payload,
                });
            }
            "health_result" => {
                let _ = self.events.send(AgentEvent::HealthResult {
                    payload: frame.payload,
                });
            }
            "ping" => {
                let pong = json!({"type": "pong"}).to_string();
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let _ = outbound.send(pong).await;
                });
            }
            other => {
                debug!(host = %self.host_id, frame_type = other, "unknown agent frame");
            }
        }
    }

    /// Mark the channel dead and fail all in-flight commands.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(AgentError::Disconnected));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (AgentChannel, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (AgentChannel::new("h1".into(), tx), rx)
    }

    #[tokio::test]
    async fn test_command_response_correlation() {
        let (chan, mut outbound) = channel();

        let fut = chan.send_command("list_containers", json!({"all": true}));
        tokio::pin!(fut);

        // Play the agent: read the frame, echo a correlated response.
        let frame = outbound.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["type"], "list_containers");
        assert_eq!(parsed["payload"]["all"], true);
        let id = parsed["id"].as_str().unwrap();

        chan.handle_incoming(
            &json!({"type": "response", "id": id, "payload": {"containers": []}}).to_string(),
        );

        let result = fut.await.unwrap();
        assert_eq!(result["containers"], json!([]));
    }

    #[tokio::test]
    async fn test_mismatched_response_id_is_dropped() {
        let (chan, mut outbound) = channel();

        let fut = chan.send_command_timeout("ping", json!({}), Duration::from_millis(50));
        tokio::pin!(fut);

        let _ = outbound.recv().await.unwrap();
        chan.handle_incoming(
            &json!({"type": "response", "id": "not-the-one", "payload": {}}).to_string(),
        );

        assert!(matches!(fut.await, Err(AgentError::Timeout)));
    }

    #[tokio::test]
    async fn test_remote_error_propagates() {
        let (chan, mut outbound) = channel();
        let fut = chan.send_command("stop_container", json!({"id": "abc123def456"}));
        tokio::pin!(fut);

        let frame = outbound.recv().await.unwrap();
        let parsed: Value = serde_json::from_str(&frame).unwrap();
        let id = parsed["id"].as_str().unwrap();
        chan.handle_incoming(
            &json!({"type": "response", "id": id, "error": "no such container"}).to_string(),
        );

        let err = fut.await.unwrap_err();
        assert!(matches!(err, AgentError::Remote(msg) if msg.contains("no such container")));
    }

    #[tokio::test]
    async fn test_close_fails_inflight_commands() {
        let (chan, mut outbound) = channel();
        let fut = chan.send_command("ping", json!({}));
        tokio::pin!(fut);

        let _ = outbound.recv().await.unwrap();
        chan.close();

        assert!(matches!(fut.await, Err(AgentError::Disconnected)));
        assert!(matches!(
            chan.send_command("ping", json!({})).await,
            Err(AgentError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_event_frames_broadcast() {
        let (chan, _outbound) = channel();
        let mut events = chan.subscribe_events();

        chan.handle_incoming(
            &json!({"type": "docker_event", "payload": {"action": "die"}}).to_string(),
        );

        match events.recv().await.unwrap() {
            AgentEvent::Docker { payload } => assert_eq!(payload["action"], "die"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
