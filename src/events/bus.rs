//! Event bus for pub/sub messaging
//!
//! Fan-in point between the per-host pipelines and the consumers that
//! react to fleet state: the alert engine, the health checker and the
//! WebSocket hub.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Container state as reported by the Docker daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Exited,
    Paused,
    Dead,
    Created,
    Restarting,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Paused => "paused",
            ContainerState::Dead => "dead",
            ContainerState::Created => "created",
            ContainerState::Restarting => "restarting",
        }
    }
}

impl From<&str> for ContainerState {
    fn from(s: &str) -> Self {
        match s {
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "created" => ContainerState::Created,
            "restarting" => ContainerState::Restarting,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Exited,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized per-container view published by the pipeline.
///
/// Transient: the Docker daemon stays authoritative, this is the last
/// observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// `"{host_id}:{short_id}"`
    pub composite_key: String,
    pub host_id: String,
    pub short_id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub status_text: String,
    pub labels: HashMap<String, String>,
    /// Tags synthesized from labels, unioned with user assignments.
    /// Ordered set so equality is stable for dedup.
    pub derived_tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl ContainerSnapshot {
    /// Fields that decide whether a new snapshot is worth broadcasting.
    pub fn dedup_signature(&self) -> (String, ContainerState, String, Vec<String>) {
        (
            self.composite_key.clone(),
            self.state,
            self.status_text.clone(),
            self.derived_tags.iter().cloned().collect(),
        )
    }
}

/// Host connectivity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
}

/// Classified reason a host went offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    Unreachable,
    TlsInvalid,
    AuthFailed,
    ProtocolError,
}

impl std::fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OfflineReason::Unreachable => "unreachable",
            OfflineReason::TlsInvalid => "tls_invalid",
            OfflineReason::AuthFailed => "auth_failed",
            OfflineReason::ProtocolError => "protocol_error",
        };
        f.write_str(s)
    }
}

/// Periodic metric sample used by threshold alert rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Cpu,
    Memory,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub host_id: String,
    /// Present for container-scoped metrics, absent for host disk usage.
    pub composite_key: Option<String>,
    pub kind: MetricKind,
    pub value_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Events published through the monitor bus
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Normalized container snapshot (deduplicated by the pipeline)
    Snapshot(ContainerSnapshot),

    /// Raw Docker event (die, oom, kill, health_status, ...)
    ContainerEvent {
        host_id: String,
        composite_key: String,
        container_name: String,
        action: String,
        exit_code: Option<i64>,
    },

    /// Host connectivity transition
    HostStatus {
        host_id: String,
        status: HostStatus,
        reason: Option<OfflineReason>,
    },

    /// HTTP health check status transition
    HealthTransition {
        composite_key: String,
        host_id: String,
        container_name: String,
        healthy: bool,
    },

    /// Metric sample for threshold rules
    Metric(MetricSample),

    /// Registry digest drift detected for a container
    UpdateAvailable {
        composite_key: String,
        host_id: String,
        current_image: String,
        latest_image: String,
    },
}

/// Event bus for broadcasting monitor events to multiple subscribers
///
/// Uses tokio broadcast channels. Subscribers that fall behind will lose
/// messages (lagged); the periodic poll reconcile repairs any missed
/// container state.
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<MonitorEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity (4096 events)
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: MonitorEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}
