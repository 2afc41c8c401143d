//! Rule evaluation and alert lifecycle
//!
//! Consumes the monitor bus: container snapshots, raw container events,
//! host status changes and metric samples. Opens at most one alert per
//! dedup key, honors cooldown and blackout windows, and dispatches
//! notifications with retry scheduling on transient failures.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::database::{
    AlertInstance, AlertRuleRecord, AlertState, Database, DatabaseError,
};
use crate::events::{EventBus, HostStatus, MetricKind, MonitorEvent};
use crate::hub::{Envelope, Hub};
use crate::notifications::{AlertMessage, ChannelIndex, DispatchError, Dispatcher};

use super::model::{compare, dedup_key, AlertKind, AlertScope, BlackoutSchedule};
use super::retry::next_retry_delay;

/// Default window for restart-loop counting when the rule sets none.
const DEFAULT_RESTART_WINDOW_SECS: i64 = 600;
const DEFAULT_RESTART_THRESHOLD: f64 = 3.0;

pub struct AlertEngine {
    db: Arc<Database>,
    bus: EventBus,
    hub: Arc<Hub>,
    dispatcher: Dispatcher,
    /// Last successful dispatch per (rule, entity), for cooldown.
    cooldowns: DashMap<(String, String), DateTime<Utc>>,
    /// Die timestamps per container, for restart-loop rules.
    restart_events: DashMap<String, VecDeque<DateTime<Utc>>>,
    /// Last known effective tags per container, so event-driven rules
    /// can match tag scopes.
    tag_cache: DashMap<String, BTreeSet<String>>,
    /// First breach per (rule, entity) for windowed metric rules.
    breaches: DashMap<(String, String), DateTime<Utc>>,
}

impl AlertEngine {
    pub fn new(db: Arc<Database>, bus: EventBus, hub: Arc<Hub>, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            bus,
            hub,
            dispatcher,
            cooldowns: DashMap::new(),
            restart_events: DashMap::new(),
            tag_cache: DashMap::new(),
            breaches: DashMap::new(),
        }
    }

    /// Consume the monitor bus until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "alert engine lagged; poll reconcile will repair");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    pub async fn handle_event(&self, event: MonitorEvent) {
        let rules = match self.db.list_alert_rules(true).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!("alert rule load failed: {e}");
                return;
            }
        };

        match event {
            MonitorEvent::Snapshot(snap) => {
                self.tag_cache
                    .insert(snap.composite_key.clone(), snap.derived_tags.clone());

                for rule in &rules {
                    let Some(kind) = AlertKind::parse(&rule.kind) else { continue };
                    if kind != AlertKind::ContainerStopped {
                        continue;
                    }
                    let Some(scope) = AlertScope::from_rule(rule) else { continue };
                    if !scope.matches_container(&snap.host_id, &snap.composite_key, &snap.derived_tags)
                    {
                        continue;
                    }

                    let state = snap.state.as_str();
                    let triggered = rule
                        .trigger_states
                        .as_ref()
                        .map(|states| states.iter().any(|s| s == state))
                        .unwrap_or(false);

                    if triggered {
                        self.open_alert(
                            rule,
                            &scope,
                            kind,
                            Some(&snap.composite_key),
                            format!(
                                "Container {} on {} is {} ({})",
                                snap.name, snap.host_id, state, snap.status_text
                            ),
                        )
                        .await;
                    } else if state == "running" {
                        self.resolve_alert_for(rule, &scope, kind, Some(&snap.composite_key))
                            .await;
                    }
                }
            }

            MonitorEvent::ContainerEvent {
                host_id,
                composite_key,
                container_name,
                action,
                exit_code,
            } => {
                let tags = self
                    .tag_cache
                    .get(&composite_key)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();

                if action == "die" {
                    let mut window = self
                        .restart_events
                        .entry(composite_key.clone())
                        .or_default();
                    window.push_back(Utc::now());
                }

                for rule in &rules {
                    let Some(kind) = AlertKind::parse(&rule.kind) else { continue };
                    let Some(scope) = AlertScope::from_rule(rule) else { continue };
                    if !scope.matches_container(&host_id, &composite_key, &tags) {
                        continue;
                    }

                    match kind {
                        AlertKind::ContainerStopped => {
                            let triggered = rule
                                .trigger_events
                                .as_ref()
                                .map(|events| events.iter().any(|e| e == &action))
                                .unwrap_or(false);
                            if triggered {
                                let exit = exit_code
                                    .map(|c| format!(" (exit {c})"))
                                    .unwrap_or_default();
                                self.open_alert(
                                    rule,
                                    &scope,
                                    kind,
                                    Some(&composite_key),
                                    format!(
                                        "Container {container_name} on {host_id} emitted {action}{exit}"
                                    ),
                                )
                                .await;
                            } else if action == "start" {
                                self.resolve_alert_for(rule, &scope, kind, Some(&composite_key))
                                    .await;
                            }
                        }
                        AlertKind::RestartLoop if action == "die" => {
                            let window_secs =
                                rule.window_secs.unwrap_or(DEFAULT_RESTART_WINDOW_SECS);
                            let threshold =
                                rule.threshold.unwrap_or(DEFAULT_RESTART_THRESHOLD) as usize;
                            let cutoff = Utc::now() - Duration::seconds(window_secs);

                            let count = {
                                let mut events = self
                                    .restart_events
                                    .entry(composite_key.clone())
                                    .or_default();
                                while events.front().map(|t| *t < cutoff).unwrap_or(false) {
                                    events.pop_front();
                                }
                                events.len()
                            };

                            if count >= threshold {
                                self.open_alert(
                                    rule,
                                    &scope,
                                    kind,
                                    Some(&composite_key),
                                    format!(
                                        "Container {container_name} on {host_id} restarted {count} times in {window_secs}s"
                                    ),
                                )
                                .await;
                            }
                        }
                        _ => {}
                    }
                }
            }

            MonitorEvent::HostStatus {
                host_id,
                status,
                reason,
            } => {
                for rule in &rules {
                    let Some(kind) = AlertKind::parse(&rule.kind) else { continue };
                    if kind != AlertKind::HostOffline {
                        continue;
                    }
                    let Some(scope) = AlertScope::from_rule(rule) else { continue };
                    if !scope.matches_host(&host_id) {
                        continue;
                    }

                    match status {
                        HostStatus::Offline => {
                            let why = reason
                                .map(|r| format!(" ({r})"))
                                .unwrap_or_default();
                            self.open_alert(
                                rule,
                                &scope,
                                kind,
                                Some(&host_id),
                                format!("Host {host_id} went offline{why}"),
                            )
                            .await;
                        }
                        HostStatus::Online => {
                            self.resolve_alert_for(rule, &scope, kind, Some(&host_id)).await;
                        }
                    }
                }
            }

            MonitorEvent::HealthTransition {
                composite_key,
                host_id,
                container_name,
                healthy,
            } => {
                let tags = self
                    .tag_cache
                    .get(&composite_key)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();

                for rule in &rules {
                    let Some(kind) = AlertKind::parse(&rule.kind) else { continue };
                    if kind != AlertKind::ContainerUnhealthy {
                        continue;
                    }
                    let Some(scope) = AlertScope::from_rule(rule) else { continue };
                    if !scope.matches_container(&host_id, &composite_key, &tags) {
                        continue;
                    }

                    if healthy {
                        self.resolve_alert_for(rule, &scope, kind, Some(&composite_key))
                            .await;
                    } else {
                        self.open_alert(
                            rule,
                            &scope,
                            kind,
                            Some(&composite_key),
                            format!("Health check failing for {container_name} on {host_id}"),
                        )
                        .await;
                    }
                }
            }

            MonitorEvent::Metric(sample) => {
                let wanted = match sample.kind {
                    MetricKind::Cpu => AlertKind::CpuHigh,
                    MetricKind::Memory => AlertKind::MemoryHigh,
                    MetricKind::Disk => AlertKind::DiskHigh,
                };
                let entity = sample
                    .composite_key
                    .clone()
                    .unwrap_or_else(|| sample.host_id.clone());
                let tags = self
                    .tag_cache
                    .get(&entity)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();

                for rule in &rules {
                    let Some(kind) = AlertKind::parse(&rule.kind) else { continue };
                    if kind != wanted {
                        continue;
                    }
                    let Some(scope) = AlertScope::from_rule(rule) else { continue };
                    let in_scope = match &sample.composite_key {
                        Some(key) => scope.matches_container(&sample.host_id, key, &tags),
                        None => scope.matches_host(&sample.host_id),
                    };
                    if !in_scope {
                        continue;
                    }

                    let Some(threshold) = rule.threshold else { continue };
                    let operator = rule.operator.as_deref().unwrap_or(">=");
                    let breached = compare(operator, sample.value_percent, threshold);
                    let breach_key = (rule.id.clone(), entity.clone());

                    if !breached {
                        self.breaches.remove(&breach_key);
                        self.resolve_alert_for(rule, &scope, kind, Some(&entity)).await;
                        continue;
                    }

                    // Sustained-window rules wait out the window before
                    // opening.
                    if let Some(window) = rule.window_secs {
                        let first = *self
                            .breaches
                            .entry(breach_key)
                            .or_insert(sample.sampled_at);
                        if (sample.sampled_at - first).num_seconds() < window {
                            continue;
                        }
                    }

                    self.open_alert(
                        rule,
                        &scope,
                        kind,
                        Some(&entity),
                        format!(
                            "{} at {:.1}% ({} {} {:.1}%)",
                            kind.as_str(),
                            sample.value_percent,
                            entity,
                            operator,
                            threshold
                        ),
                    )
                    .await;
                }
            }

            MonitorEvent::UpdateAvailable {
                composite_key,
                host_id,
                current_image,
                latest_image,
            } => {
                let tags = self
                    .tag_cache
                    .get(&composite_key)
                    .map(|e| e.value().clone())
                    .unwrap_or_default();

                for rule in &rules {
                    let Some(kind) = AlertKind::parse(&rule.kind) else { continue };
                    if kind != AlertKind::UpdateAvailable {
                        continue;
                    }
                    let Some(scope) = AlertScope::from_rule(rule) else { continue };
                    if !scope.matches_container(&host_id, &composite_key, &tags) {
                        continue;
                    }

                    self.open_alert(
                        rule,
                        &scope,
                        kind,
                        Some(&composite_key),
                        format!("Update available for {composite_key}: {current_image} -> {latest_image}"),
                    )
                    .await;
                }
            }
        }
    }

    /// Open (or re-touch) the alert for this (rule, entity) and dispatch
    /// notifications unless a cooldown or blackout applies.
    async fn open_alert(
        &self,
        rule: &AlertRuleRecord,
        scope: &AlertScope,
        kind: AlertKind,
        entity: Option<&str>,
        message: String,
    ) {
        let key = dedup_key(kind, scope, entity);
        let now = Utc::now();

        match self.db.get_open_alert(&key).await {
            Ok(Some(existing)) => {
                let _ = self.db.touch_alert(&existing.id, now).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("open-alert lookup failed: {e}");
                return;
            }
        }

        let suppressed = BlackoutSchedule::new(&rule.blackout_windows).is_blacked_out(now);

        let alert = AlertInstance {
            id: uuid::Uuid::new_v4().to_string(),
            dedup_key: key.clone(),
            rule_id: rule.id.clone(),
            scope_type: scope.type_str().to_string(),
            scope_id: Some(scope.id_str()),
            entity_key: entity.map(str::to_string),
            kind: kind.as_str().to_string(),
            severity: rule.severity.clone(),
            state: AlertState::Open,
            message: message.clone(),
            first_seen: now,
            last_seen: now,
            resolved_at: None,
            suppressed_by_blackout: suppressed,
            notified_at: None,
            last_notification_attempt_at: None,
            next_retry_at: None,
            retry_count: 0,
        };

        match self.db.insert_alert(&alert).await {
            Ok(()) => {}
            Err(DatabaseError::Integrity(_)) => {
                // Concurrent evaluation opened it first; that one owns
                // dispatch.
                debug!(dedup = %key, "alert already open");
                return;
            }
            Err(e) => {
                warn!("alert insert failed: {e}");
                return;
            }
        }

        info!(dedup = %key, severity = %rule.severity, "alert opened");
        let _ = self
            .db
            .log_event(None, entity, "alert_opened", &message)
            .await;
        self.hub.broadcast(
            "alerts",
            &Envelope::new(
                "alert_opened",
                serde_json::to_value(&alert).unwrap_or(json!({})),
            ),
        );

        if suppressed {
            debug!(dedup = %key, "dispatch suppressed by blackout window");
            return;
        }

        let entity_id = entity.unwrap_or_default().to_string();
        if self.in_cooldown(&rule.id, &entity_id, rule.cooldown_minutes, now) {
            debug!(dedup = %key, "dispatch suppressed by cooldown");
            return;
        }

        self.dispatch(&alert, rule, now).await;
    }

    fn in_cooldown(
        &self,
        rule_id: &str,
        entity: &str,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> bool {
        if cooldown_minutes <= 0 {
            return false;
        }
        self.cooldowns
            .get(&(rule_id.to_string(), entity.to_string()))
            .map(|last| now - *last.value() < Duration::minutes(cooldown_minutes))
            .unwrap_or(false)
    }

    /// One send per (alert x channel); transient failures schedule the
    /// retry loop, permanent ones are final.
    pub(crate) async fn dispatch(
        &self,
        alert: &AlertInstance,
        rule: &AlertRuleRecord,
        now: DateTime<Utc>,
    ) {
        let channels = match self.db.list_channels(true).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!("channel load failed: {e}");
                return;
            }
        };
        let index = ChannelIndex::build(channels);
        let message = AlertMessage::from_alert(alert, None);

        let results = self
            .dispatcher
            .send_all(&index, &rule.notify_channels, &message)
            .await;

        let any_transient = results
            .iter()
            .any(|(_, r)| matches!(r, Err(DispatchError::Transient(_))));

        for (reference, result) in &results {
            if let Err(e) = result {
                warn!(alert = %alert.id, ?reference, "notification failed: {e}");
            }
        }

        if any_transient {
            let delay = next_retry_delay(alert.retry_count as u32);
            let _ = self
                .db
                .record_notification_attempt(&alert.id, now, false, delay.map(|d| now + d))
                .await;
        } else {
            let _ = self
                .db
                .record_notification_attempt(&alert.id, now, true, None)
                .await;
            let entity = alert.entity_key.clone().unwrap_or_default();
            self.cooldowns.insert((rule.id.clone(), entity), now);
        }
    }

    async fn resolve_alert_for(
        &self,
        rule: &AlertRuleRecord,
        scope: &AlertScope,
        kind: AlertKind,
        entity: Option<&str>,
    ) {
        let key = dedup_key(kind, scope, entity);
        let Ok(Some(alert)) = self.db.get_open_alert(&key).await else {
            return;
        };
        if self.db.resolve_alert(&alert.id).await.is_ok() {
            info!(dedup = %key, "alert resolved");
            let _ = self
                .db
                .log_event(None, entity, "alert_resolved", &alert.message)
                .await;
            self.hub.broadcast(
                "alerts",
                &Envelope::new(
                    "alert_resolved",
                    json!({"id": alert.id, "dedup_key": key, "entity_id": alert.entity_key}),
                ),
            );
        }
    }
}
