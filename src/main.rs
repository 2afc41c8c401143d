//! DockMon daemon entry point
//!
//! Wires the store, session manager, pipeline, alert engine, health
//! checker, deployment and update executors together, then serves the
//! REST/WebSocket API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use dockmon::agent::AgentRegistry;
use dockmon::alerts::{run_retry_loop, AlertEngine};
use dockmon::audit::SecurityAudit;
use dockmon::auth::SessionService;
use dockmon::config::Configuration;
use dockmon::database::Database;
use dockmon::deploy::{DeploymentExecutor, StackService, TemplateService};
use dockmon::docker::{SessionManager, SessionManagerConfig};
use dockmon::events::EventBus;
use dockmon::health::HealthChecker;
use dockmon::hub::Hub;
use dockmon::notifications::Dispatcher;
use dockmon::pipeline::StatePipeline;
use dockmon::router::{build_router, AppState};
use dockmon::scheduler::Scheduler;
use dockmon::updates::{HttpRegistryClient, UpdateChecker, UpdateExecutor, UpdatingContainers};

#[derive(Parser)]
#[command(name = "dockmon")]
#[command(about = "Multi-host Docker container fleet manager")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dockmon.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("dockmon={log_level}").into()),
        )
        .init();

    info!("Starting DockMon v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(if std::path::Path::new(&cli.config).exists() {
        Configuration::load(&cli.config)?
    } else {
        info!("no config file at {}; using defaults", cli.config);
        Configuration::default()
    });

    let db = Arc::new(Database::open(&config.database.path)?);
    let bus = EventBus::new();
    let hub = Arc::new(Hub::new(config.monitoring.ws_client_queue));
    let agents = Arc::new(AgentRegistry::new());
    let audit = SecurityAudit::new(db.clone());

    let cookie_secret = if config.auth.cookie_secret.is_empty() {
        // Ephemeral secret: sessions do not survive a restart until one
        // is configured.
        uuid::Uuid::new_v4().as_bytes().to_vec()
    } else {
        hex::decode(&config.auth.cookie_secret)
            .unwrap_or_else(|_| config.auth.cookie_secret.as_bytes().to_vec())
    };
    let sessions = SessionService::new(
        db.clone(),
        audit.clone(),
        cookie_secret,
        config.auth.session_ttl_hours,
        config.auth.max_sessions_per_user,
    );

    let manager = Arc::new(SessionManager::new(
        db.clone(),
        bus.clone(),
        agents.clone(),
        SessionManagerConfig {
            ping_interval: Duration::from_secs(config.monitoring.ping_interval_secs),
            reconnect_max_backoff: Duration::from_secs(config.monitoring.reconnect_max_backoff_secs),
        },
    ));

    let updating = Arc::new(UpdatingContainers::new());
    let deployments = Arc::new(DeploymentExecutor::new(
        db.clone(),
        manager.clone(),
        hub.clone(),
        config.deployments.clone(),
    ));
    let updates = Arc::new(UpdateExecutor::new(
        db.clone(),
        manager.clone(),
        hub.clone(),
        updating.clone(),
        None,
    ));
    let update_checker = Arc::new(UpdateChecker::new(
        db.clone(),
        manager.clone(),
        bus.clone(),
        Arc::new(HttpRegistryClient::new()),
    ));
    let stacks = Arc::new(StackService::new(db.clone(), config.stacks.directory.clone()));
    let templates = Arc::new(TemplateService::new(db.clone()));
    let health = Arc::new(HealthChecker::new(
        db.clone(),
        manager.clone(),
        bus.clone(),
        updating.clone(),
    ));

    let engine = Arc::new(AlertEngine::new(
        db.clone(),
        bus.clone(),
        hub.clone(),
        Dispatcher::http(),
    ));

    // Background loops.
    manager.initialize().await.ok();
    tokio::spawn(manager.clone().run_ping_loop());
    tokio::spawn(hub.clone().run_bridge(bus.clone()));
    tokio::spawn(engine.clone().run());
    tokio::spawn(run_retry_loop(db.clone(), engine.clone()));

    let pipeline = Arc::new(StatePipeline::new(
        manager.clone(),
        db.clone(),
        bus.clone(),
        Duration::from_secs(config.monitoring.poll_interval_secs),
    ));
    tokio::spawn(pipeline.clone().run());

    health.reload().await;

    // Periodic jobs.
    let scheduler = Arc::new(Scheduler::new());
    {
        let checker = update_checker.clone();
        scheduler.add_job(
            "update-check",
            Duration::from_secs(config.updates.check_interval_secs),
            false,
            move || {
                let checker = checker.clone();
                async move {
                    checker.check_all().await;
                    Ok(())
                }
            },
        );
    }
    {
        let sessions = sessions.clone();
        scheduler.add_job("session-sweep", Duration::from_secs(900), false, move || {
            let sessions = sessions.clone();
            async move {
                sessions.sweep_expired().await.map_err(|e| e.to_string())?;
                Ok(())
            }
        });
    }
    {
        let db = db.clone();
        scheduler.add_job(
            "action-token-cleanup",
            Duration::from_secs(24 * 3600),
            false,
            move || {
                let db = db.clone();
                async move {
                    db.cleanup_action_tokens(chrono::Utc::now())
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(())
                }
            },
        );
    }
    {
        let pipeline = pipeline.clone();
        scheduler.add_job(
            "metric-sample",
            Duration::from_secs(config.monitoring.metrics_interval_secs),
            false,
            move || {
                let pipeline = pipeline.clone();
                async move {
                    pipeline.sample_metrics().await;
                    Ok(())
                }
            },
        );
    }
    {
        let health = health.clone();
        scheduler.add_job("health-reload", Duration::from_secs(60), false, move || {
            let health = health.clone();
            async move {
                health.reload().await;
                Ok(())
            }
        });
    }
    scheduler.start();

    let state = AppState {
        db,
        manager,
        hub,
        agents,
        bus,
        sessions,
        audit,
        deployments,
        updates,
        updating,
        stacks,
        templates,
        health,
        config: config.clone(),
    };

    let router = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    info!("API listening on {addr}");

    if config.api.ssl.enabled {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.api.ssl.cert,
            &config.api.ssl.key,
        )
        .await?;
        axum_server::bind_rustls(addr, tls).serve(router).await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tokio::select! {
            result = axum::serve(listener, router) => {
                if let Err(e) = result {
                    error!("server error: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
            }
        }
    }

    Ok(())
}
