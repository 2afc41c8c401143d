//! Health check loops and the auto-restart state machine
//!
//! One loop per enabled check probes the container's HTTP endpoint and
//! feeds results through the episode state machine. An episode is one
//! continuous unhealthy period: attempt 1 fires immediately on the
//! transition, later attempts wait out the retry delay, and the episode
//! ends (counters reset) on recovery. Independent of episodes, a
//! sliding-window safety net caps restarts per container.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::database::{Database, HealthCheckRecord};
use crate::docker::SessionManager;
use crate::events::{EventBus, MonitorEvent};
use crate::updates::UpdatingContainers;

use super::cache::ContainerCache;

/// Safety net: at most this many restarts per container inside the
/// sliding window, regardless of episode counters.
pub const SAFETY_MAX_RESTARTS: usize = 12;
pub const SAFETY_WINDOW_SECS: i64 = 600;

/// What a single probe outcome requires of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDecision {
    /// `Some(healthy)` when the status transitioned.
    pub transition: Option<bool>,
    /// Restart attempt number to execute now (1-based), if any.
    pub restart_attempt: Option<u32>,
}

#[derive(Debug, Default)]
struct EpisodeState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// "healthy" / "unhealthy" / "unknown"
    current_status: String,
    restart_episode_attempts: u32,
    last_restart_time: Option<DateTime<Utc>>,
    restart_history: VecDeque<DateTime<Utc>>,
}

impl EpisodeState {
    fn new(initial_status: &str) -> Self {
        Self {
            current_status: initial_status.to_string(),
            ..Default::default()
        }
    }

    /// Core decision logic; pure apart from the passed-in clock.
    fn on_probe(&mut self, check: &HealthCheckRecord, success: bool, now: DateTime<Utc>) -> ProbeDecision {
        let mut transition = None;

        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;

            if self.current_status != "healthy"
                && self.consecutive_successes >= check.success_threshold
            {
                self.current_status = "healthy".into();
                transition = Some(true);
                // Recovery closes the episode.
                self.restart_episode_attempts = 0;
                self.last_restart_time = None;
            }
            return ProbeDecision {
                transition,
                restart_attempt: None,
            };
        }

        self.consecutive_failures += 1;
        self.consecutive_successes = 0;

        if self.current_status != "unhealthy"
            && self.consecutive_failures >= check.failure_threshold
        {
            self.current_status = "unhealthy".into();
            transition = Some(false);
        }

        let restart_attempt = if self.current_status == "unhealthy"
            && check.auto_restart_on_failure
        {
            self.next_restart_attempt(check, now)
        } else {
            None
        };

        ProbeDecision {
            transition,
            restart_attempt,
        }
    }

    fn next_restart_attempt(
        &mut self,
        check: &HealthCheckRecord,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        // Episode cap.
        if self.restart_episode_attempts >= check.max_restart_attempts {
            return None;
        }

        // Retry delay gate; the first attempt of an episode is immediate.
        if let Some(last) = self.last_restart_time {
            let elapsed = (now - last).num_seconds();
            if elapsed < check.restart_retry_delay_s as i64 {
                return None;
            }
        }

        // Sliding-window safety net, across episodes.
        let cutoff = now - chrono::Duration::seconds(SAFETY_WINDOW_SECS);
        while self
            .restart_history
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            self.restart_history.pop_front();
        }
        if self.restart_history.len() >= SAFETY_MAX_RESTARTS {
            return None;
        }

        self.restart_episode_attempts += 1;
        self.last_restart_time = Some(now);
        self.restart_history.push_back(now);
        Some(self.restart_episode_attempts)
    }
}

/// Parse an expected-status spec against a response code. Accepts
/// `"200"`, `"200,201"` and `"200-299"`, and combinations of the two
/// separated by commas.
pub fn status_matches(spec: &str, status: u16) -> bool {
    spec.split(',').map(str::trim).any(|part| {
        if let Some((low, high)) = part.split_once('-') {
            match (low.trim().parse::<u16>(), high.trim().parse::<u16>()) {
                (Ok(low), Ok(high)) => (low..=high).contains(&status),
                _ => false,
            }
        } else {
            part.parse::<u16>().map(|code| code == status).unwrap_or(false)
        }
    })
}

pub struct HealthChecker {
    db: Arc<Database>,
    manager: Arc<SessionManager>,
    bus: EventBus,
    updating: Arc<UpdatingContainers>,
    cache: ContainerCache,
    states: DashMap<String, EpisodeState>,
    /// Stop signal per running check loop, for hot reconfiguration.
    loops: DashMap<String, watch::Sender<bool>>,
    /// Clients indexed by (follow_redirects, verify_ssl); reqwest fixes
    /// both per client.
    clients: [reqwest::Client; 4],
}

fn build_client(follow_redirects: bool, verify_ssl: bool) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().redirect(if follow_redirects {
        reqwest::redirect::Policy::limited(5)
    } else {
        reqwest::redirect::Policy::none()
    });
    if !verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().expect("reqwest client builds")
}

impl HealthChecker {
    pub fn new(
        db: Arc<Database>,
        manager: Arc<SessionManager>,
        bus: EventBus,
        updating: Arc<UpdatingContainers>,
    ) -> Self {
        Self {
            db,
            manager,
            bus,
            updating,
            cache: ContainerCache::new(),
            states: DashMap::new(),
            loops: DashMap::new(),
            clients: [
                build_client(false, false),
                build_client(false, true),
                build_client(true, false),
                build_client(true, true),
            ],
        }
    }

    /// Load enabled checks and reconcile running loops: new checks
    /// start, removed or disabled ones stop, changed ones restart.
    pub async fn reload(self: &Arc<Self>) {
        let checks = match self.db.list_enabled_health_checks().await {
            Ok(checks) => checks,
            Err(e) => {
                warn!("health check load failed: {e}");
                return;
            }
        };

        let wanted: HashMap<String, HealthCheckRecord> = checks
            .into_iter()
            .map(|c| (c.container_id.clone(), c))
            .collect();

        // Stop loops that are no longer configured.
        let stale: Vec<String> = self
            .loops
            .iter()
            .filter(|e| !wanted.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.stop_loop(&key);
        }

        for (key, check) in wanted {
            if check.check_from == "agent" {
                if !self.push_agent_check(&check).await {
                    warn!(container = %key, "agent health check sync failed");
                }
                self.ensure_agent_listener(&check.host_id).await;
                continue;
            }
            if !self.loops.contains_key(&key) {
                self.start_loop(check);
            }
        }
    }

    /// One listener per agent host consumes pushed probe results and
    /// feeds them through the same episode state machine as backend
    /// probes.
    async fn ensure_agent_listener(self: &Arc<Self>, host_id: &str) {
        let listener_key = format!("agent-listener:{host_id}");
        if self.loops.contains_key(&listener_key) {
            return;
        }
        let Ok(session) = self.manager.ensure(host_id).await else {
            return;
        };
        let Some(agent) = session.agent() else {
            return;
        };

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.loops.insert(listener_key, stop_tx);

        let checker = self.clone();
        let mut events = agent.subscribe_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(crate::agent::AgentEvent::HealthResult { payload }) => {
                            checker.handle_agent_result(&payload).await;
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    },
                    _ = stop_rx.changed() => return,
                }
            }
        });
    }

    async fn handle_agent_result(&self, payload: &serde_json::Value) {
        let Some(container_id) = payload.get("container_id").and_then(|v| v.as_str()) else {
            return;
        };
        let success = payload
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        match self.db.get_health_check(container_id).await {
            Ok(Some(check)) => self.apply_result(&check, success, Utc::now()).await,
            Ok(None) => debug!(container = container_id, "agent result for unknown check"),
            Err(e) => warn!("agent result lookup failed: {e}"),
        }
    }

    fn stop_loop(&self, composite_key: &str) {
        if let Some((_, stop)) = self.loops.remove(composite_key) {
            let _ = stop.send(true);
            debug!(container = composite_key, "health loop stopped");
        }
    }

    fn start_loop(self: &Arc<Self>, check: HealthCheckRecord) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.loops.insert(check.container_id.clone(), stop_tx);

        let checker = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(check.interval_s.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!(container = %check.container_id, url = %check.url, "health loop started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        checker.run_probe(&check).await;
                    }
                    _ = stop_rx.changed() => {
                        return;
                    }
                }
            }
        });
    }

    /// Push an agent-side check to the host's agent. Returns false when
    /// no agent is connected for the host.
    pub async fn push_agent_check(&self, check: &HealthCheckRecord) -> bool {
        let Ok(session) = self.manager.ensure(&check.host_id).await else {
            return false;
        };
        let Some(agent) = session.agent() else {
            return false;
        };
        agent
            .send_command(
                "health_check_config",
                serde_json::to_value(check).unwrap_or(json!({})),
            )
            .await
            .is_ok()
    }

    /// Remove an agent-side check. Returns false for unknown agents.
    pub async fn remove_agent_check(&self, host_id: &str, composite_key: &str) -> bool {
        let Ok(session) = self.manager.ensure(host_id).await else {
            return false;
        };
        let Some(agent) = session.agent() else {
            return false;
        };
        agent
            .send_command(
                "health_check_config_remove",
                json!({ "container_id": composite_key }),
            )
            .await
            .is_ok()
    }

    async fn run_probe(&self, check: &HealthCheckRecord) {
        let success = self.probe(check).await;
        self.apply_result(check, success, Utc::now()).await;
    }

    /// Result ingestion shared by backend probes and agent-pushed
    /// results.
    pub async fn apply_result(
        &self,
        check: &HealthCheckRecord,
        success: bool,
        now: DateTime<Utc>,
    ) {
        let decision = {
            let mut state = self
                .states
                .entry(check.container_id.clone())
                .or_insert_with(|| EpisodeState::new(&check.current_status));
            state.on_probe(check, success, now)
        };

        if let Some(healthy) = decision.transition {
            let status = if healthy { "healthy" } else { "unhealthy" };
            info!(container = %check.container_id, status, "health transition");

            let _ = self.db.set_health_status(&check.container_id, status).await;

            let name = self
                .cache
                .get(&self.manager, &check.host_id, &check.container_id)
                .await
                .map(|c| c.name)
                .unwrap_or_default();

            let _ = self
                .db
                .log_event(
                    Some(&check.host_id),
                    Some(&check.container_id),
                    "container_health_changed",
                    status,
                )
                .await;
            self.bus.publish(MonitorEvent::HealthTransition {
                composite_key: check.container_id.clone(),
                host_id: check.host_id.clone(),
                container_name: name,
                healthy,
            });
        }

        if let Some(attempt) = decision.restart_attempt {
            self.execute_restart(check, attempt).await;
        }
    }

    async fn execute_restart(&self, check: &HealthCheckRecord, attempt: u32) {
        let Some(cached) = self
            .cache
            .get(&self.manager, &check.host_id, &check.container_id)
            .await
        else {
            warn!(container = %check.container_id, "restart skipped: container not found");
            return;
        };

        // Never interfere with an in-flight update; the executor owns
        // both old and new containers until it finishes.
        if self
            .updating
            .is_container_updating(&check.host_id, &cached.short_id)
        {
            debug!(container = %check.container_id, "restart skipped: update in flight");
            return;
        }

        info!(
            container = %check.container_id,
            attempt, "auto-restart for failing health check"
        );

        match self.manager.ensure(&check.host_id).await {
            Ok(session) => {
                if let Err(e) = session.restart_container(&cached.short_id).await {
                    warn!(container = %check.container_id, "auto-restart failed: {e}");
                }
                let _ = self
                    .db
                    .log_event(
                        Some(&check.host_id),
                        Some(&check.container_id),
                        "health_auto_restart",
                        &format!("attempt {attempt}"),
                    )
                    .await;
            }
            Err(e) => warn!(container = %check.container_id, "auto-restart has no session: {e}"),
        }
    }

    async fn probe(&self, check: &HealthCheckRecord) -> bool {
        let index = (check.follow_redirects as usize) * 2 + (check.verify_ssl as usize);
        let client = &self.clients[index];

        let method = match check.method.to_uppercase().parse::<reqwest::Method>() {
            Ok(method) => method,
            Err(_) => reqwest::Method::GET,
        };

        let mut request = client
            .request(method, &check.url)
            .timeout(Duration::from_secs(check.timeout_s.max(1)));

        for (name, value) in &check.headers {
            request = request.header(name, value);
        }

        if let Some(auth) = &check.auth {
            if let (Some(user), Some(pass)) = (
                auth.get("username").and_then(|v| v.as_str()),
                auth.get("password").and_then(|v| v.as_str()),
            ) {
                request = request.basic_auth(user, Some(pass));
            }
        }

        match request.send().await {
            Ok(response) => status_matches(&check.expected_status_codes, response.status().as_u16()),
            Err(e) => {
                debug!(container = %check.container_id, "probe error: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::health_fixtures::check;
    use chrono::Duration as ChronoDuration;

    fn record() -> HealthCheckRecord {
        let mut c = check("h1", "abc123def456");
        c.failure_threshold = 3;
        c.success_threshold = 1;
        c.max_restart_attempts = 3;
        c.restart_retry_delay_s = 60;
        c
    }

    #[test]
    fn test_status_matches_forms() {
        assert!(status_matches("200", 200));
        assert!(!status_matches("200", 201));
        assert!(status_matches("200,201", 201));
        assert!(status_matches("200-299", 204));
        assert!(!status_matches("200-299", 302));
        assert!(status_matches("200-299, 304", 304));
        assert!(!status_matches("banana", 200));
    }

    #[test]
    fn test_transition_thresholds() {
        let check = record();
        let mut state = EpisodeState::new("unknown");
        let now = Utc::now();

        assert_eq!(state.on_probe(&check, false, now).transition, None);
        assert_eq!(state.on_probe(&check, false, now).transition, None);
        let third = state.on_probe(&check, false, now);
        assert_eq!(third.transition, Some(false));

        let recover = state.on_probe(&check, true, now);
        assert_eq!(recover.transition, Some(true));
    }

    #[test]
    fn test_episode_restart_schedule() {
        // Scenario: threshold 3, max attempts 3, delay 60s.
        let check = record();
        let mut state = EpisodeState::new("unknown");
        let t0 = Utc::now();

        state.on_probe(&check, false, t0);
        state.on_probe(&check, false, t0);
        // Transition: attempt 1 fires immediately.
        let transition = state.on_probe(&check, false, t0);
        assert_eq!(transition.restart_attempt, Some(1));

        // 10 s later: still unhealthy, delay not elapsed -> no attempt.
        let t10 = t0 + ChronoDuration::seconds(10);
        assert_eq!(state.on_probe(&check, false, t10).restart_attempt, None);

        // 61 s later: attempt 2.
        let t61 = t0 + ChronoDuration::seconds(61);
        assert_eq!(state.on_probe(&check, false, t61).restart_attempt, Some(2));

        // Another 61 s: attempt 3 (episode cap reached).
        let t122 = t0 + ChronoDuration::seconds(122);
        assert_eq!(state.on_probe(&check, false, t122).restart_attempt, Some(3));

        // Further failures: capped.
        let t183 = t0 + ChronoDuration::seconds(183);
        assert_eq!(state.on_probe(&check, false, t183).restart_attempt, None);

        // Recovery resets the episode; a fresh unhealthy run allows
        // attempt 1 again.
        state.on_probe(&check, true, t183);
        let t200 = t0 + ChronoDuration::seconds(200);
        state.on_probe(&check, false, t200);
        state.on_probe(&check, false, t200);
        assert_eq!(state.on_probe(&check, false, t200).restart_attempt, Some(1));
    }

    #[test]
    fn test_safety_window_caps_across_episodes() {
        let mut check = record();
        check.failure_threshold = 1;
        check.max_restart_attempts = 100;
        check.restart_retry_delay_s = 0;

        let mut state = EpisodeState::new("unknown");
        let t0 = Utc::now();

        let mut restarts = 0;
        for i in 0..SAFETY_MAX_RESTARTS + 8 {
            let now = t0 + ChronoDuration::seconds(i as i64);
            // Recover and re-fail each round: new episode every time.
            if i > 0 {
                state.on_probe(&check, true, now);
            }
            if state.on_probe(&check, false, now).restart_attempt.is_some() {
                restarts += 1;
            }
        }

        assert_eq!(restarts, SAFETY_MAX_RESTARTS);
    }

    #[test]
    fn test_safety_window_slides() {
        let mut check = record();
        check.failure_threshold = 1;
        check.max_restart_attempts = 100;
        check.restart_retry_delay_s = 0;

        let mut state = EpisodeState::new("unknown");
        let t0 = Utc::now();

        // Exhaust the window.
        for i in 0..SAFETY_MAX_RESTARTS {
            let now = t0 + ChronoDuration::seconds(i as i64);
            state.on_probe(&check, true, now);
            state.on_probe(&check, false, now);
        }
        let blocked = t0 + ChronoDuration::seconds(20);
        state.on_probe(&check, true, blocked);
        assert_eq!(state.on_probe(&check, false, blocked).restart_attempt, None);

        // After the window slides past the early restarts, attempts
        // resume.
        let later = t0 + ChronoDuration::seconds(SAFETY_WINDOW_SECS + 30);
        state.on_probe(&check, true, later);
        assert!(state
            .on_probe(&check, false, later)
            .restart_attempt
            .is_some());
    }

    #[test]
    fn test_no_restart_without_auto_restart_flag() {
        let mut check = record();
        check.auto_restart_on_failure = false;
        check.failure_threshold = 1;

        let mut state = EpisodeState::new("unknown");
        let decision = state.on_probe(&check, false, Utc::now());
        assert_eq!(decision.transition, Some(false));
        assert_eq!(decision.restart_attempt, None);
    }
}
