//! Event & state pipeline
//!
//! One task per online host tails the Docker event stream while a poll
//! tick reconciles the full container list. Both paths funnel into
//! deduplicated snapshot publication, so a missed event only delays a
//! snapshot until the next reconcile.

mod snapshot;

pub use snapshot::{build_snapshot, derive_tags};

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::database::Database;
use crate::docker::{HostSession, SessionManager};
use crate::events::{ContainerState, EventBus, MonitorEvent};
use crate::keys::make_composite_key;

type DedupSignature = (String, ContainerState, String, Vec<String>);

pub struct StatePipeline {
    manager: Arc<SessionManager>,
    db: Arc<Database>,
    bus: EventBus,
    poll_interval: Duration,
    /// Last published signature per composite key.
    last_published: DashMap<String, DedupSignature>,
    running_hosts: DashSet<String>,
}

impl StatePipeline {
    pub fn new(
        manager: Arc<SessionManager>,
        db: Arc<Database>,
        bus: EventBus,
        poll_interval: Duration,
    ) -> Self {
        Self {
            manager,
            db,
            bus,
            poll_interval,
            last_published: DashMap::new(),
            running_hosts: DashSet::new(),
        }
    }

    /// Supervisor loop: make sure every active host has a pipeline task.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let hosts = match self.db.list_hosts().await {
                Ok(hosts) => hosts,
                Err(e) => {
                    warn!("pipeline host listing failed: {e}");
                    continue;
                }
            };

            for host in hosts.into_iter().filter(|h| h.is_active) {
                if self.running_hosts.insert(host.id.clone()) {
                    let pipeline = self.clone();
                    tokio::spawn(async move {
                        pipeline.host_loop(&host.id).await;
                        pipeline.running_hosts.remove(&host.id);
                    });
                }
            }
        }
    }

    /// Per-host loop: event tail plus periodic reconcile. Exits when the
    /// host disappears from the database.
    async fn host_loop(&self, host_id: &str) {
        loop {
            match self.db.get_host(host_id).await {
                Ok(Some(host)) if host.is_active => {}
                _ => return,
            }

            let session = match self.manager.ensure(host_id).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(host = host_id, "pipeline waiting for session: {e}");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            // Initial reconcile, then tail events with a poll tick.
            if let Err(e) = self.reconcile_host(&session).await {
                warn!(host = host_id, "reconcile failed: {e}");
            }

            self.tail_events(&session).await;

            // Stream ended: session died. The manager's ping loop will
            // reclassify; we retry after a beat.
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Tail the host's event stream until it errors, reconciling on a
    /// poll tick in between events. Per-host ordering is preserved by
    /// processing inline.
    async fn tail_events(&self, session: &HostSession) {
        let host_id = session.host_id().to_string();

        if session.is_agent() {
            let Some(agent) = session.agent() else { return };
            let mut events = agent.subscribe_events();
            let mut poll = tokio::time::interval(self.poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(crate::agent::AgentEvent::Docker { payload }) => {
                            self.handle_raw_event(
                                &host_id,
                                payload.get("id").and_then(|v| v.as_str()).unwrap_or_default(),
                                payload.get("action").and_then(|v| v.as_str()).unwrap_or_default(),
                                payload.get("name").and_then(|v| v.as_str()).unwrap_or_default(),
                                payload.get("exit_code").and_then(|v| v.as_i64()),
                            );
                            let _ = self.reconcile_host(session).await;
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    },
                    _ = poll.tick() => {
                        if self.reconcile_host(session).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        let Ok(docker) = session.docker() else { return };
        let mut stream = docker.events(Some(bollard::system::EventsOptions::<String> {
            ..Default::default()
        }));
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(message)) => {
                        if message.typ != Some(bollard::models::EventMessageTypeEnum::CONTAINER) {
                            continue;
                        }
                        let actor = message.actor.unwrap_or_default();
                        let id = actor.id.unwrap_or_default();
                        let attributes = actor.attributes.unwrap_or_default();
                        let action = message.action.unwrap_or_default();
                        let name = attributes.get("name").cloned().unwrap_or_default();
                        let exit_code = attributes
                            .get("exitCode")
                            .and_then(|v| v.parse::<i64>().ok());

                        self.handle_raw_event(&host_id, &id, &action, &name, exit_code);

                        // A lifecycle event invalidates the last list; a
                        // targeted reconcile keeps snapshots current.
                        if matches!(
                            action.as_str(),
                            "start" | "die" | "stop" | "kill" | "oom" | "pause" | "unpause"
                                | "destroy" | "restart"
                        ) {
                            let _ = self.reconcile_host(session).await;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(host = %host_id, "event stream error: {e}");
                        return;
                    }
                    None => return,
                },
                _ = poll.tick() => {
                    if self.reconcile_host(session).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn handle_raw_event(
        &self,
        host_id: &str,
        container_id: &str,
        action: &str,
        name: &str,
        exit_code: Option<i64>,
    ) {
        let short = crate::keys::normalize_container_id(container_id);
        let Ok(composite_key) = make_composite_key(host_id, short) else {
            return;
        };

        self.bus.publish(MonitorEvent::ContainerEvent {
            host_id: host_id.to_string(),
            composite_key,
            container_name: name.to_string(),
            action: action.to_string(),
            exit_code,
        });
    }

    /// Sample CPU and memory for every running container on every
    /// online host, feeding the threshold alert rules.
    pub async fn sample_metrics(&self) {
        let hosts = match self.db.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("metric sweep host listing failed: {e}");
                return;
            }
        };

        let now = chrono::Utc::now();
        for host in hosts.into_iter().filter(|h| h.is_active) {
            let Some(session) = self.manager.get(&host.id) else { continue };

            // Agents report host-level disk usage; direct Docker
            // connections expose no disk figure to sample.
            if let Some(agent) = session.agent() {
                if let Ok(payload) = agent
                    .send_command("host_metrics", serde_json::json!({}))
                    .await
                {
                    if let Some(disk) = payload.get("disk_percent").and_then(|v| v.as_f64()) {
                        self.bus.publish(MonitorEvent::Metric(crate::events::MetricSample {
                            host_id: host.id.clone(),
                            composite_key: None,
                            kind: crate::events::MetricKind::Disk,
                            value_percent: disk,
                            sampled_at: now,
                        }));
                    }
                }
            }

            let Ok(containers) = session.list_containers(false).await else { continue };

            for brief in containers {
                let Ok(composite_key) = make_composite_key(&host.id, &brief.short_id) else {
                    continue;
                };
                let Ok((cpu, memory)) = session.stats_sample(&brief.short_id).await else {
                    continue;
                };

                for (kind, value) in [
                    (crate::events::MetricKind::Cpu, cpu),
                    (crate::events::MetricKind::Memory, memory),
                ] {
                    self.bus.publish(MonitorEvent::Metric(crate::events::MetricSample {
                        host_id: host.id.clone(),
                        composite_key: Some(composite_key.clone()),
                        kind,
                        value_percent: value,
                        sampled_at: now,
                    }));
                }
            }
        }
    }

    /// List all containers and publish any snapshot whose dedup
    /// signature changed.
    pub async fn reconcile_host(
        &self,
        session: &HostSession,
    ) -> Result<usize, crate::docker::SessionError> {
        let host_id = session.host_id();
        let containers = session.list_containers(true).await?;

        let mut published = 0;
        for brief in containers {
            let Ok(composite_key) = make_composite_key(host_id, &brief.short_id) else {
                continue;
            };

            let user_tags = self
                .db
                .tag_names_for_container(&composite_key)
                .await
                .unwrap_or_default();

            let snap = build_snapshot(host_id, &brief, &user_tags);
            let signature = snap.dedup_signature();

            let changed = self
                .last_published
                .insert(composite_key.clone(), signature.clone())
                .map(|prev| prev != signature)
                .unwrap_or(true);

            if changed {
                self.bus.publish(MonitorEvent::Snapshot(snap));
                published += 1;
            }
        }

        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::database::test_support::seeded;
    use crate::docker::SessionManagerConfig;

    #[tokio::test]
    async fn test_raw_event_publishes_composite_key() {
        let db = Arc::new(seeded().await);
        let bus = EventBus::new();
        let manager = Arc::new(SessionManager::new(
            db.clone(),
            bus.clone(),
            Arc::new(AgentRegistry::new()),
            SessionManagerConfig::default(),
        ));
        let pipeline = StatePipeline::new(manager, db, bus.clone(), Duration::from_secs(30));

        let mut rx = bus.subscribe();
        let full = "67c5d214133846c397f4d9947f28cb513377db1fcc74633efd0d13793c45d4f2";
        pipeline.handle_raw_event("h1", full, "die", "web", Some(137));

        match rx.recv().await.unwrap() {
            MonitorEvent::ContainerEvent {
                composite_key,
                action,
                exit_code,
                ..
            } => {
                assert_eq!(composite_key, "h1:67c5d2141338");
                assert_eq!(action, "die");
                assert_eq!(exit_code, Some(137));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
