//! Session registry and connection health
//!
//! Keeps one session per host, pings them on an interval, reclassifies
//! failures, and reconnects with capped exponential backoff. Successful
//! reconnection publishes a `host.connected` status event.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::{DashMap, DashSet};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{DockMonError, Result};
use crate::events::{EventBus, HostStatus, MonitorEvent, OfflineReason};
use crate::agent::AgentRegistry;

use super::session::HostSession;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub ping_interval: Duration,
    pub reconnect_max_backoff: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            reconnect_max_backoff: Duration::from_secs(300),
        }
    }
}

/// Manager for all host sessions.
pub struct SessionManager {
    sessions: DashMap<String, Arc<HostSession>>,
    statuses: DashMap<String, (HostStatus, Option<OfflineReason>)>,
    reconnecting: DashSet<String>,
    db: Arc<Database>,
    bus: EventBus,
    agents: Arc<AgentRegistry>,
    config: SessionManagerConfig,
}

impl SessionManager {
    pub fn new(
        db: Arc<Database>,
        bus: EventBus,
        agents: Arc<AgentRegistry>,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            statuses: DashMap::new(),
            reconnecting: DashSet::new(),
            db,
            bus,
            agents,
            config,
        }
    }

    /// Connect every active host at boot, bounded by core count the way
    /// large fleets expect.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let hosts = self
            .db
            .list_hosts()
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?;

        let semaphore = Arc::new(Semaphore::new(num_cpus::get()));
        let mut handles = Vec::new();

        for host in hosts.into_iter().filter(|h| h.is_active) {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| DockMonError::Internal("semaphore closed".into()))?;
            let manager = self.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = manager.ensure(&host.id).await {
                    warn!(host = %host.id, "initial connect failed: {e}");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!("session manager initialized: {} online", self.online_count());
        Ok(())
    }

    /// Establish or reuse the session for a host. A failure stores the
    /// classified offline reason before propagating.
    pub async fn ensure(&self, host_id: &str) -> Result<Arc<HostSession>> {
        if let Some(session) = self.sessions.get(host_id) {
            return Ok(session.value().clone());
        }

        let host = self
            .db
            .get_host(host_id)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?
            .ok_or_else(|| DockMonError::NotFound(format!("host {host_id}")))?;

        if !host.is_active {
            return Err(DockMonError::Conflict(format!(
                "host {host_id} is retired"
            )));
        }

        let agent = self.agents.get(host_id);
        match HostSession::connect(&host, agent) {
            Ok(session) => {
                let session = Arc::new(session);
                self.sessions.insert(host_id.to_string(), session.clone());
                self.mark_online(host_id);

                // Refresh stored system info opportunistically.
                if let Ok(info) = session.system_info().await {
                    let _ = self.db.update_host_system_info(host_id, &info).await;
                }
                Ok(session)
            }
            Err(e) => {
                self.mark_offline(host_id, e.offline_reason());
                Err(DockMonError::Transient(e.to_string()))
            }
        }
    }

    pub fn get(&self, host_id: &str) -> Option<Arc<HostSession>> {
        self.sessions.get(host_id).map(|e| e.value().clone())
    }

    pub fn drop_session(&self, host_id: &str) {
        self.sessions.remove(host_id);
    }

    /// Forget a host entirely (deletion flow).
    pub fn remove(&self, host_id: &str) {
        self.sessions.remove(host_id);
        self.statuses.remove(host_id);
        self.agents.detach(host_id);
    }

    pub fn host_status(&self, host_id: &str) -> (HostStatus, Option<OfflineReason>) {
        self.statuses
            .get(host_id)
            .map(|e| *e.value())
            .unwrap_or((HostStatus::Offline, None))
    }

    pub fn online_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|e| e.value().0 == HostStatus::Online)
            .count()
    }

    pub fn offline_count(&self) -> usize {
        self.statuses
            .iter()
            .filter(|e| e.value().0 == HostStatus::Offline)
            .count()
    }

    pub fn mark_online(&self, host_id: &str) {
        let prev = self
            .statuses
            .insert(host_id.to_string(), (HostStatus::Online, None));
        if prev.map(|(s, _)| s) != Some(HostStatus::Online) {
            info!(host = host_id, "host connected");
            self.bus.publish(MonitorEvent::HostStatus {
                host_id: host_id.to_string(),
                status: HostStatus::Online,
                reason: None,
            });
        }
    }

    pub fn mark_offline(&self, host_id: &str, reason: OfflineReason) {
        let prev = self
            .statuses
            .insert(host_id.to_string(), (HostStatus::Offline, Some(reason)));
        if prev.map(|(s, _)| s) != Some(HostStatus::Offline) {
            warn!(host = host_id, %reason, "host offline");
            self.bus.publish(MonitorEvent::HostStatus {
                host_id: host_id.to_string(),
                status: HostStatus::Offline,
                reason: Some(reason),
            });
        }
    }

    /// Periodic connection health loop. Runs until the process exits.
    pub async fn run_ping_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let host_ids: Vec<String> =
                self.sessions.iter().map(|e| e.key().clone()).collect();

            for host_id in host_ids {
                let Some(session) = self.get(&host_id) else { continue };
                if let Err(e) = session.ping().await {
                    let reason = e.offline_reason();
                    debug!(host = %host_id, %reason, "ping failed");
                    self.drop_session(&host_id);
                    self.mark_offline(&host_id, reason);
                    self.spawn_reconnect(&host_id);
                }
            }
        }
    }

    /// Exponential reconnect, capped, one task per host.
    fn spawn_reconnect(self: &Arc<Self>, host_id: &str) {
        if !self.reconnecting.insert(host_id.to_string()) {
            return;
        }

        let manager = self.clone();
        let host_id = host_id.to_string();
        tokio::spawn(async move {
            let mut backoff = ExponentialBackoff {
                initial_interval: Duration::from_secs(1),
                max_interval: manager.config.reconnect_max_backoff,
                max_elapsed_time: None,
                ..Default::default()
            };

            loop {
                match manager.ensure(&host_id).await {
                    Ok(_) => break,
                    Err(DockMonError::NotFound(_)) | Err(DockMonError::Conflict(_)) => {
                        // Host deleted or retired while we were retrying.
                        break;
                    }
                    Err(_) => {
                        let delay = backoff
                            .next_backoff()
                            .unwrap_or(manager.config.reconnect_max_backoff);
                        tokio::time::sleep(delay).await;
                    }
                }
            }

            manager.reconnecting.remove(&host_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    async fn manager() -> Arc<SessionManager> {
        let db = Arc::new(seeded().await);
        Arc::new(SessionManager::new(
            db,
            EventBus::new(),
            Arc::new(AgentRegistry::new()),
            SessionManagerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_ensure_unknown_host_not_found() {
        let manager = manager().await;
        let err = manager.ensure("missing").await.unwrap_err();
        assert!(matches!(err, DockMonError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ensure_failure_classifies_offline() {
        let manager = manager().await;
        // h1 is remote with no TLS material: classified tls_invalid.
        let err = manager.ensure("h1").await.unwrap_err();
        assert!(matches!(err, DockMonError::Transient(_)));
        let (status, reason) = manager.host_status("h1");
        assert_eq!(status, HostStatus::Offline);
        assert_eq!(reason, Some(OfflineReason::TlsInvalid));
    }

    #[tokio::test]
    async fn test_status_transitions_publish_events() {
        let manager = manager().await;
        let mut rx = manager.bus.subscribe();

        manager.mark_offline("h1", OfflineReason::Unreachable);
        manager.mark_online("h1");
        // Re-marking online is a no-op.
        manager.mark_online("h1");

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            MonitorEvent::HostStatus {
                status: HostStatus::Offline,
                reason: Some(OfflineReason::Unreachable),
                ..
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            MonitorEvent::HostStatus {
                status: HostStatus::Online,
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_counts() {
        let manager = manager().await;
        manager.mark_online("h1");
        manager.mark_offline("h2", OfflineReason::Unreachable);
        assert_eq!(manager.online_count(), 1);
        assert_eq!(manager.offline_count(), 1);
    }
}
