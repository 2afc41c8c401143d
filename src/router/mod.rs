//! HTTP router
//!
//! The REST surface over the fleet: dashboard summary, hosts and their
//! containers, deployments, stacks, templates, channels, alert rules,
//! updates and the agent endpoints. Authentication is a session cookie
//! or an API-key bearer.

mod agent_api;
mod channels;
mod dashboard;
mod deployments;
mod hosts;
mod stacks;
mod templates;
mod tokens;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::HeaderMap,
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::agent::AgentRegistry;
use crate::audit::SecurityAudit;
use crate::auth::{authenticate_api_key, SessionAuth, SessionService};
use crate::config::Configuration;
use crate::database::Database;
use crate::deploy::{DeploymentExecutor, StackService, TemplateService};
use crate::docker::SessionManager;
use crate::error::{DockMonError, Result};
use crate::events::EventBus;
use crate::health::HealthChecker;
use crate::hub::Hub;
use crate::updates::{UpdateExecutor, UpdatingContainers};

pub const SESSION_COOKIE: &str = "dockmon_session";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub manager: Arc<SessionManager>,
    pub hub: Arc<Hub>,
    pub agents: Arc<AgentRegistry>,
    pub bus: EventBus,
    pub sessions: SessionService,
    pub audit: SecurityAudit,
    pub deployments: Arc<DeploymentExecutor>,
    pub updates: Arc<UpdateExecutor>,
    pub updating: Arc<UpdatingContainers>,
    pub stacks: Arc<StackService>,
    pub templates: Arc<TemplateService>,
    pub health: Arc<HealthChecker>,
    pub config: Arc<Configuration>,
}

/// Resolve the request's principal from the session cookie or an API
/// key bearer.
pub async fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
    client_ip: &str,
) -> Result<SessionAuth> {
    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE) {
        let raw = cookie_header.to_str().unwrap_or_default();
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix(&format!("{SESSION_COOKIE}=")) {
                return state.sessions.validate(value, client_ip).await;
            }
        }
    }

    if let Some(authz) = headers.get(axum::http::header::AUTHORIZATION) {
        let raw = authz.to_str().unwrap_or_default();
        if let Some(bearer) = raw.strip_prefix("Bearer ") {
            if let Some(key) = authenticate_api_key(&state.db, bearer).await? {
                return Ok(SessionAuth {
                    user_id: key.user_id,
                    session_id: None,
                });
            }
        }
    }

    Err(DockMonError::Unauthorized("authentication required".into()))
}

/// Extract the peer IP, honoring nothing but the socket; proxies are a
/// deployment concern.
pub fn client_ip(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

/// Extractor that authenticates the request before the handler runs.
pub struct Auth(pub SessionAuth);

#[axum::async_trait]
impl axum::extract::FromRequestParts<AppState> for Auth {
    type Rejection = DockMonError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &AppState,
    ) -> Result<Self> {
        let ip = parts
            .extensions
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        authenticate_request(state, &parts.headers, &ip)
            .await
            .map(Auth)
    }
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        // Dashboard
        .route("/dashboard/summary", get(dashboard::summary))
        // Hosts
        .route("/hosts", get(hosts::list_hosts).post(hosts::create_host))
        .route("/hosts/:host_id", get(hosts::get_host).delete(hosts::delete_host))
        .route("/hosts/:host_id/containers", get(hosts::list_containers))
        // Container operations are always host-scoped; an unscoped
        // container path does not exist and 404s by construction.
        .route(
            "/hosts/:host_id/containers/:container_id/restart",
            post(hosts::restart_container),
        )
        .route(
            "/hosts/:host_id/containers/:container_id/stop",
            post(hosts::stop_container),
        )
        .route(
            "/hosts/:host_id/containers/:container_id/start",
            post(hosts::start_container),
        )
        .route(
            "/hosts/:host_id/containers/:container_id/logs",
            get(hosts::container_logs),
        )
        .route(
            "/hosts/:host_id/containers/:container_id/auto-restart",
            post(hosts::set_auto_restart),
        )
        .route(
            "/hosts/:host_id/containers/:container_id/desired-state",
            post(hosts::set_desired_state),
        )
        .route(
            "/hosts/:host_id/containers/:container_id/update",
            post(deployments::update_container),
        )
        .route(
            "/hosts/:host_id/containers/:container_id/health-check",
            post(hosts::set_health_check).delete(hosts::delete_health_check),
        )
        // Deployments
        .route(
            "/deployments",
            get(deployments::list_deployments).post(deployments::create_deployment),
        )
        .route("/deployments/:id", get(deployments::get_deployment))
        .route(
            "/deployments/:id/save-as-template",
            post(deployments::save_as_template),
        )
        // Batch update pre-flight
        .route("/batch/validate-update", post(deployments::batch_validate_update))
        // Stacks
        .route("/stacks", get(stacks::list_stacks).post(stacks::create_stack))
        .route(
            "/stacks/:name",
            get(stacks::get_stack)
                .put(stacks::update_stack)
                .delete(stacks::delete_stack),
        )
        .route("/stacks/:name/rename", post(stacks::rename_stack))
        .route("/stacks/:name/copy", post(stacks::copy_stack))
        // Templates
        .route(
            "/templates",
            get(templates::list_templates).post(templates::create_template),
        )
        .route(
            "/templates/:id",
            get(templates::get_template)
                .put(templates::update_template)
                .delete(templates::delete_template),
        )
        .route("/templates/:id/render", post(templates::render))
        // Notification channels and alert rules
        .route(
            "/channels",
            get(channels::list_channels).post(channels::create_channel),
        )
        .route("/channels/:id", delete(channels::delete_channel))
        .route(
            "/alert-rules",
            get(channels::list_alert_rules).post(channels::create_alert_rule),
        )
        .route("/alert-rules/:id", delete(channels::delete_alert_rule))
        // Action tokens
        .route("/actions/validate", post(tokens::validate_token))
        .route("/actions/execute", post(tokens::execute_token))
        // Auth
        .route("/auth/login", post(tokens::login))
        .route("/auth/logout", post(tokens::logout))
        .route("/users/me/preferences", get(tokens::get_prefs).put(tokens::put_prefs))
        // Agent endpoints
        .route("/agent/register", post(agent_api::register))
        .route("/agent/ws", get(agent_api::agent_ws))
        // Realtime hub
        .route("/ws", get(crate::hub::ws_handler));

    let cors = if state.config.api.cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .api
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .nest("/api", api)
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let state = test_support::state().await;
        let err = authenticate_request(&state, &HeaderMap::new(), "127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, DockMonError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_cookie_auth_resolves_user() {
        let state = test_support::state().await;
        let cookie = state.sessions.create(1, "10.0.0.1").await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            format!("{SESSION_COOKIE}={cookie}").parse().unwrap(),
        );
        let auth = authenticate_request(&state, &headers, "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(auth.user_id, 1);
        assert!(auth.session_id.is_some());
    }

    #[tokio::test]
    async fn test_bearer_auth_resolves_user() {
        let state = test_support::state().await;
        let (key, _) = crate::auth::generate_api_key(&state.db, 1, "ci")
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {key}").parse().unwrap(),
        );
        let auth = authenticate_request(&state, &headers, "10.0.0.2")
            .await
            .unwrap();
        assert_eq!(auth.user_id, 1);
        assert!(auth.session_id.is_none());
    }

    #[tokio::test]
    async fn test_router_builds() {
        let state = test_support::state().await;
        let _router = build_router(state);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::DeploymentConfiguration;
    use crate::docker::SessionManagerConfig;

    /// Full state over an in-memory database; Docker-backed calls will
    /// fail transiently, which is what the endpoint tests expect.
    pub async fn state() -> AppState {
        let db = Arc::new(crate::database::test_support::seeded().await);
        let bus = EventBus::new();
        let agents = Arc::new(AgentRegistry::new());
        let manager = Arc::new(SessionManager::new(
            db.clone(),
            bus.clone(),
            agents.clone(),
            SessionManagerConfig::default(),
        ));
        let hub = Arc::new(Hub::new(64));
        let audit = SecurityAudit::new(db.clone());
        let sessions = SessionService::new(db.clone(), audit.clone(), b"test".to_vec(), 24, 10);
        let updating = Arc::new(UpdatingContainers::new());
        let config = Arc::new(Configuration::default());
        let stacks_dir = tempfile::tempdir().unwrap().into_path();

        AppState {
            deployments: Arc::new(DeploymentExecutor::new(
                db.clone(),
                manager.clone(),
                hub.clone(),
                DeploymentConfiguration::default(),
            )),
            updates: Arc::new(UpdateExecutor::new(
                db.clone(),
                manager.clone(),
                hub.clone(),
                updating.clone(),
                None,
            )),
            stacks: Arc::new(StackService::new(db.clone(), stacks_dir)),
            templates: Arc::new(TemplateService::new(db.clone())),
            health: Arc::new(HealthChecker::new(
                db.clone(),
                manager.clone(),
                bus.clone(),
                updating.clone(),
            )),
            db,
            manager,
            hub,
            agents,
            bus,
            sessions,
            audit,
            updating,
            config,
        }
    }
}
