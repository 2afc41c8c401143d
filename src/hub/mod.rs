//! WebSocket broadcast hub
//!
//! Fan-out of monitor and progress events to authenticated clients.
//! Every client owns a bounded outbound queue; a consumer that cannot
//! keep up is disconnected rather than allowed to stall the fleet.

mod handler;

pub use handler::ws_handler;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::events::{EventBus, MonitorEvent};

/// Topics a client may subscribe to by name.
pub const TOPICS: &[&str] = &[
    "containers",
    "events",
    "deployments",
    "health",
    "updates",
    "alerts",
    "hosts",
];

/// Outbound message envelope. Every frame is `{type, data}`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(event_type: &str, data: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

struct Client {
    topics: RwLock<HashSet<String>>,
    tx: mpsc::Sender<String>,
}

/// Hub over all connected WebSocket clients.
pub struct Hub {
    clients: DashMap<u64, Arc<Client>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Register a client; the receiver is drained by its socket task.
    pub fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.clients.insert(
            id,
            Arc::new(Client {
                topics: RwLock::new(HashSet::new()),
                tx,
            }),
        );
        debug!(client = id, "hub client registered");
        (id, rx)
    }

    pub fn disconnect(&self, client_id: u64) {
        if self.clients.remove(&client_id).is_some() {
            debug!(client = client_id, "hub client disconnected");
        }
    }

    pub fn subscribe(&self, client_id: u64, topic: &str) -> bool {
        if !TOPICS.contains(&topic) {
            return false;
        }
        if let Some(client) = self.clients.get(&client_id) {
            client.topics.write().insert(topic.to_string());
            true
        } else {
            false
        }
    }

    pub fn unsubscribe(&self, client_id: u64, topic: &str) {
        if let Some(client) = self.clients.get(&client_id) {
            client.topics.write().remove(topic);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Best-effort broadcast to a topic. Clients whose queue is full are
    /// dropped; their socket task observes the closed channel and ends.
    pub fn broadcast(&self, topic: &str, envelope: &Envelope) {
        let frame = envelope.to_json();
        let mut overflowed = Vec::new();

        for entry in self.clients.iter() {
            if !entry.value().topics.read().contains(topic) {
                continue;
            }
            match entry.value().tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*entry.key()),
                Err(mpsc::error::TrySendError::Closed(_)) => overflowed.push(*entry.key()),
            }
        }

        for client_id in overflowed {
            info!(client = client_id, "dropping slow hub client");
            self.disconnect(client_id);
        }
    }

    /// Bridge monitor-bus events onto hub topics. Runs for the process
    /// lifetime.
    pub async fn run_bridge(self: Arc<Self>, bus: EventBus) {
        let mut rx = bus.subscribe();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "hub bridge lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };

            match event {
                MonitorEvent::Snapshot(snap) => {
                    self.broadcast(
                        "containers",
                        &Envelope::new(
                            "container_state",
                            serde_json::to_value(&snap).unwrap_or(Value::Null),
                        ),
                    );
                }
                MonitorEvent::ContainerEvent {
                    host_id,
                    composite_key,
                    container_name,
                    action,
                    exit_code,
                } => {
                    self.broadcast(
                        "events",
                        &Envelope::new(
                            "container_event",
                            json!({
                                "host_id": host_id,
                                "entity_id": composite_key,
                                "container_name": container_name,
                                "action": action,
                                "exit_code": exit_code,
                            }),
                        ),
                    );
                }
                MonitorEvent::HostStatus {
                    host_id,
                    status,
                    reason,
                } => {
                    self.broadcast(
                        "hosts",
                        &Envelope::new(
                            "host_status",
                            json!({
                                "host_id": host_id,
                                "status": status,
                                "reason": reason,
                            }),
                        ),
                    );
                }
                MonitorEvent::HealthTransition {
                    composite_key,
                    host_id,
                    container_name,
                    healthy,
                } => {
                    self.broadcast(
                        "health",
                        &Envelope::new(
                            "container_health_changed",
                            json!({
                                "host_id": host_id,
                                "entity_id": composite_key,
                                "container_name": container_name,
                                "healthy": healthy,
                            }),
                        ),
                    );
                }
                MonitorEvent::UpdateAvailable {
                    composite_key,
                    host_id,
                    current_image,
                    latest_image,
                } => {
                    self.broadcast(
                        "updates",
                        &Envelope::new(
                            "update_available",
                            json!({
                                "host_id": host_id,
                                "entity_id": composite_key,
                                "current_image": current_image,
                                "latest_image": latest_image,
                            }),
                        ),
                    );
                }
                MonitorEvent::Metric(_) => {
                    // Metric samples feed the alert engine, not clients.
                }
            }
        }
    }
}
