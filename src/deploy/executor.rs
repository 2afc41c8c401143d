//! Deployment execution
//!
//! Drives a deployment through validate -> pull -> create -> start ->
//! verify, broadcasting progress per stage and per pulled layer. The
//! commitment point sits at the end of the create stage: containers
//! exist and their metadata rows are written, so rollback no longer
//! applies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bollard::container::CreateContainerOptions;
use bollard::volume::CreateVolumeOptions;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::DeploymentConfiguration;
use crate::database::{Database, DeploymentRecord, DeploymentType};
use crate::docker::{pull_image_with_progress, wait_for_container_health, SessionManager};
use crate::error::{DockMonError, Result};
use crate::hub::{Envelope, Hub};
use crate::keys::{make_deployment_key, normalize_container_id};

use super::compose::service_to_config;
use super::state::DeploymentStatus;
use super::validator::validate_compose;

/// Built-in network names that always exist on a host.
const BUILTIN_NETWORKS: &[&str] = &["bridge", "host", "none"];

#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub host_id: String,
    pub name: String,
    pub deployment_type: DeploymentType,
    pub definition: String,
    pub stack_name: Option<String>,
    pub rollback_on_failure: bool,
}

/// Resources created by one run, for precise rollback. Only resources
/// this deployment created are ever removed; pre-existing ones stay.
#[derive(Default)]
struct RunContext {
    created_containers: Vec<(String, String)>,
    created_volumes: Vec<String>,
    created_networks: Vec<String>,
}

pub struct DeploymentExecutor {
    db: Arc<Database>,
    manager: Arc<SessionManager>,
    hub: Arc<Hub>,
    config: DeploymentConfiguration,
}

impl DeploymentExecutor {
    pub fn new(
        db: Arc<Database>,
        manager: Arc<SessionManager>,
        hub: Arc<Hub>,
        config: DeploymentConfiguration,
    ) -> Self {
        Self {
            db,
            manager,
            hub,
            config,
        }
    }

    /// Create the deployment record in `pending`. The (host, name) pair
    /// is unique; re-submitting an existing name is a conflict, not a
    /// silent retry.
    pub async fn create(&self, request: DeploymentRequest) -> Result<DeploymentRecord> {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = make_deployment_key(&request.host_id, &short[..12])?;

        let now = Utc::now();
        let record = DeploymentRecord {
            id,
            host_id: request.host_id,
            name: request.name,
            deployment_type: request.deployment_type,
            definition: request.definition,
            stack_name: request.stack_name,
            status: DeploymentStatus::Pending.as_str().to_string(),
            progress_percent: 0,
            current_stage: String::new(),
            stage_percent: 0,
            rollback_on_failure: request.rollback_on_failure,
            committed: false,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.db.insert_deployment(&record).await.map_err(|e| match e {
            crate::database::DatabaseError::Integrity(_) => DockMonError::Conflict(format!(
                "deployment '{}' already exists on host {}",
                record.name, record.host_id
            )),
            other => DockMonError::Internal(other.to_string()),
        })?;

        Ok(record)
    }

    /// Run a pending deployment to a terminal state. Never panics a
    /// background loop: every failure lands in `failed` (and possibly
    /// `rolled_back`) with a recorded message.
    pub async fn execute(&self, deployment_id: &str) -> Result<()> {
        let record = self
            .db
            .get_deployment(deployment_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| DockMonError::NotFound(format!("deployment {deployment_id}")))?;

        let status = DeploymentStatus::parse(&record.status)
            .ok_or_else(|| DockMonError::Internal(format!("bad status {}", record.status)))?;
        if status != DeploymentStatus::Pending {
            return Err(DockMonError::Conflict(format!(
                "Cannot start deployment in status={status}"
            )));
        }

        let mut current = status;
        let mut context = RunContext::default();

        match self.run_stages(&record, &mut current, &mut context).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&record, &mut current, &mut context, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        record: &DeploymentRecord,
        current: &mut DeploymentStatus,
        context: &mut RunContext,
    ) -> Result<()> {
        // --- validating ---
        self.advance(record, current, DeploymentStatus::Validating).await?;
        let validated = validate_compose(&record.definition)
            .map_err(|e| DockMonError::Validation(e.to_string()))?;

        let management_labels: HashMap<String, String> = HashMap::from([(
            "dockmon.deployment".to_string(),
            record.id.clone(),
        )]);

        let mut plans = Vec::new();
        for name in &validated.startup_order {
            let service = validated
                .service(name)
                .ok_or_else(|| DockMonError::Internal(format!("service {name} vanished")))?;
            plans.push(
                service_to_config(name, service, &record.name, &management_labels)
                    .map_err(|e| DockMonError::Validation(e.to_string()))?,
            );
        }

        let session = self.manager.ensure(&record.host_id).await?;
        let docker = session
            .docker()
            .map_err(|_| DockMonError::Validation("deployments require a direct Docker connection".into()))?;

        // --- pulling_image ---
        self.advance(record, current, DeploymentStatus::PullingImage).await?;
        let images: HashSet<String> = plans.iter().map(|p| p.image.clone()).collect();
        for image in images {
            let hub = self.hub.clone();
            let host_id = record.host_id.clone();
            let entity_id = record.id.clone();
            pull_image_with_progress(
                docker,
                &image,
                None,
                Duration::from_secs(self.config.pull_timeout_secs),
                move |progress| {
                    hub.broadcast(
                        "deployments",
                        &Envelope::new(
                            "deployment_layer_progress",
                            json!({
                                "host_id": host_id,
                                "entity_id": entity_id,
                                "overall_progress": progress.overall_progress,
                                "layers": progress.layers,
                                "total_layers": progress.total_layers,
                                "summary": progress.summary,
                                "speed_mbps": progress.speed_mbps,
                            }),
                        ),
                    );
                },
            )
            .await
            .map_err(|e| DockMonError::Transient(format!("pull of {image} failed: {e}")))?;
        }

        // --- creating ---
        self.advance(record, current, DeploymentStatus::Creating).await?;

        let existing_networks = self.host_networks(docker).await?;
        let existing_volumes = self.host_volumes(docker).await?;

        for plan in &mut plans {
            // Networks are validated, never created: a reference to a
            // missing network falls back to bridge with a warning.
            if let Some(network) = plan.networks.first() {
                if !BUILTIN_NETWORKS.contains(&network.as_str())
                    && !existing_networks.contains(network)
                {
                    warn!(
                        deployment = %record.id,
                        network, "referenced network missing; falling back to bridge"
                    );
                    let _ = self
                        .db
                        .log_event(
                            Some(&record.host_id),
                            None,
                            "deployment_network_fallback",
                            &format!("network '{network}' not found, using bridge"),
                        )
                        .await;
                    if let Some(hc) = plan.config.host_config.as_mut() {
                        hc.network_mode = Some("bridge".to_string());
                    }
                } else if let Some(hc) = plan.config.host_config.as_mut() {
                    if hc.network_mode.is_none() {
                        hc.network_mode = Some(network.clone());
                    }
                }
            }

            // Named volumes are auto-created with the local driver.
            for volume in &plan.named_volumes {
                if !existing_volumes.contains(volume) {
                    docker
                        .create_volume(CreateVolumeOptions {
                            name: volume.clone(),
                            driver: "local".to_string(),
                            ..Default::default()
                        })
                        .await
                        .map_err(|e| DockMonError::Transient(e.to_string()))?;
                    context.created_volumes.push(volume.clone());
                }
            }
        }

        for plan in &plans {
            let response = docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: plan.container_name.clone(),
                        platform: None,
                    }),
                    plan.config.clone(),
                )
                .await
                .map_err(|e| DockMonError::Transient(format!(
                    "create of service '{}' failed: {e}",
                    plan.service_name
                )))?;

            let short_id = normalize_container_id(&response.id).to_string();
            context
                .created_containers
                .push((plan.service_name.clone(), short_id.clone()));

            let composite = crate::keys::make_composite_key(&record.host_id, &short_id)?;
            self.db
                .upsert_deployment_metadata(
                    &composite,
                    &record.host_id,
                    Some(&record.id),
                    true,
                    Some(&plan.service_name),
                )
                .await
                .map_err(internal)?;
        }

        // Commitment point: containers exist and metadata is durable.
        self.db
            .mark_deployment_committed(&record.id)
            .await
            .map_err(internal)?;

        // --- starting ---
        self.advance(record, current, DeploymentStatus::Starting).await?;
        for (service_name, short_id) in &context.created_containers {
            session
                .start_container(short_id)
                .await
                .map_err(|e| DockMonError::Transient(format!(
                    "start of service '{service_name}' failed: {e}"
                )))?;

            let healthy = wait_for_container_health(
                &session,
                short_id,
                Duration::from_secs(self.config.health_timeout_secs),
            )
            .await;
            if !healthy {
                return Err(DockMonError::Transient(format!(
                    "service '{service_name}' failed verification after start"
                )));
            }
        }

        // --- running ---
        self.advance(record, current, DeploymentStatus::Running).await?;
        info!(deployment = %record.id, "deployment running");
        Ok(())
    }

    async fn advance(
        &self,
        record: &DeploymentRecord,
        current: &mut DeploymentStatus,
        to: DeploymentStatus,
    ) -> Result<()> {
        *current = current
            .transition(to)
            .map_err(|e| DockMonError::Conflict(e.to_string()))?;

        self.db
            .update_deployment_status(
                &record.id,
                to.as_str(),
                to.progress_percent(),
                to.as_str(),
                0,
                to.is_terminal(),
                None,
            )
            .await
            .map_err(internal)?;

        self.broadcast_status(record, to, None);
        Ok(())
    }

    async fn fail(
        &self,
        record: &DeploymentRecord,
        current: &mut DeploymentStatus,
        context: &mut RunContext,
        message: &str,
    ) {
        error!(deployment = %record.id, "deployment failed: {message}");

        if current.can_transition(DeploymentStatus::Failed) {
            *current = DeploymentStatus::Failed;
            let _ = self
                .db
                .update_deployment_status(
                    &record.id,
                    DeploymentStatus::Failed.as_str(),
                    current.progress_percent(),
                    "failed",
                    0,
                    true,
                    Some(message),
                )
                .await;
            self.broadcast_status(record, DeploymentStatus::Failed, Some(message));
        }

        // Committed state is authoritative; rollback only before it.
        let committed = self
            .db
            .get_deployment(&record.id)
            .await
            .ok()
            .flatten()
            .map(|d| d.committed)
            .unwrap_or(true);

        if committed || !record.rollback_on_failure {
            return;
        }

        self.rollback(record, context).await;

        if current.can_transition(DeploymentStatus::RolledBack) {
            *current = DeploymentStatus::RolledBack;
            let _ = self
                .db
                .update_deployment_status(
                    &record.id,
                    DeploymentStatus::RolledBack.as_str(),
                    current.progress_percent(),
                    "rolled_back",
                    0,
                    true,
                    None,
                )
                .await;
            self.broadcast_status(record, DeploymentStatus::RolledBack, Some(message));
        }
    }

    /// Remove everything this run created, nothing else. Failures are
    /// logged and never override the terminal error.
    async fn rollback(&self, record: &DeploymentRecord, context: &mut RunContext) {
        info!(deployment = %record.id, "rolling back");

        let Ok(session) = self.manager.ensure(&record.host_id).await else {
            warn!(deployment = %record.id, "rollback has no session; resources left in place");
            return;
        };

        for (service_name, short_id) in context.created_containers.drain(..) {
            if let Err(e) = session.stop_container(&short_id, Some(10)).await {
                warn!(service = %service_name, "rollback stop failed: {e}");
            }
            if let Err(e) = session.remove_container(&short_id, true).await {
                warn!(service = %service_name, "rollback remove failed: {e}");
            }
        }

        if let Ok(docker) = session.docker() {
            for volume in context.created_volumes.drain(..) {
                if let Err(e) = docker.remove_volume(&volume, None).await {
                    warn!(volume, "rollback volume removal failed: {e}");
                }
            }
            for network in context.created_networks.drain(..) {
                if let Err(e) = docker.remove_network(&network).await {
                    warn!(network, "rollback network removal failed: {e}");
                }
            }
        }
    }

    fn broadcast_status(
        &self,
        record: &DeploymentRecord,
        status: DeploymentStatus,
        error: Option<&str>,
    ) {
        self.hub.broadcast(
            "deployments",
            &Envelope::new(
                "deployment_status",
                json!({
                    "host_id": record.host_id,
                    "entity_id": record.id,
                    "name": record.name,
                    "status": status.as_str(),
                    "progress_percent": status.progress_percent(),
                    "error": error,
                }),
            ),
        );
    }

    async fn host_networks(&self, docker: &bollard::Docker) -> Result<HashSet<String>> {
        let networks = docker
            .list_networks::<String>(None)
            .await
            .map_err(|e| DockMonError::Transient(e.to_string()))?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }

    async fn host_volumes(&self, docker: &bollard::Docker) -> Result<HashSet<String>> {
        let volumes = docker
            .list_volumes::<String>(None)
            .await
            .map_err(|e| DockMonError::Transient(e.to_string()))?;
        Ok(volumes
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }
}

fn internal(e: crate::database::DatabaseError) -> DockMonError {
    DockMonError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::database::test_support::seeded;
    use crate::docker::SessionManagerConfig;
    use crate::events::EventBus;

    async fn executor() -> (DeploymentExecutor, Arc<Database>) {
        let db = Arc::new(seeded().await);
        let manager = Arc::new(SessionManager::new(
            db.clone(),
            EventBus::new(),
            Arc::new(AgentRegistry::new()),
            SessionManagerConfig::default(),
        ));
        (
            DeploymentExecutor::new(
                db.clone(),
                manager,
                Arc::new(Hub::new(64)),
                DeploymentConfiguration::default(),
            ),
            db,
        )
    }

    fn request(name: &str, definition: &str) -> DeploymentRequest {
        DeploymentRequest {
            host_id: "h1".into(),
            name: name.into(),
            deployment_type: DeploymentType::Stack,
            definition: definition.into(),
            stack_name: None,
            rollback_on_failure: true,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_composite_id() {
        let (executor, _db) = executor().await;
        let record = executor
            .create(request("web", "version: '3'\nservices:\n  web:\n    image: nginx\n"))
            .await
            .unwrap();
        let (host, short) = crate::keys::parse_composite_key(&record.id).unwrap();
        assert_eq!(host, "h1");
        assert_eq!(short.len(), 12);
        assert_eq!(record.status, "pending");
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let (executor, _db) = executor().await;
        executor
            .create(request("web", "version: '3'\nservices:\n  web:\n    image: nginx\n"))
            .await
            .unwrap();
        let err = executor
            .create(request("web", "version: '3'\nservices:\n  web:\n    image: nginx\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, DockMonError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_invalid_compose_fails_deployment() {
        let (executor, db) = executor().await;
        let record = executor
            .create(request("web", "version: '3'\nservices: {}\n"))
            .await
            .unwrap();

        let err = executor.execute(&record.id).await.unwrap_err();
        assert!(matches!(err, DockMonError::Validation(_)));

        let stored = db.get_deployment(&record.id).await.unwrap().unwrap();
        // Validation fails before commitment; rollback has nothing to
        // remove, so the record parks in rolled_back.
        assert_eq!(stored.status, "rolled_back");
        assert!(stored.error_message.unwrap().contains("At least one service"));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_execute_requires_pending() {
        let (executor, db) = executor().await;
        let record = executor
            .create(request("web", "version: '3'\nservices:\n  web:\n    image: nginx\n"))
            .await
            .unwrap();

        db.update_deployment_status(&record.id, "running", 100, "running", 100, true, None)
            .await
            .unwrap();

        let err = executor.execute(&record.id).await.unwrap_err();
        assert!(matches!(
            err,
            DockMonError::Conflict(msg) if msg.contains("Cannot start deployment in status=running")
        ));
    }

    #[tokio::test]
    async fn test_execute_unknown_deployment() {
        let (executor, _db) = executor().await;
        let err = executor.execute("h1:aaaaaaaaaaaa").await.unwrap_err();
        assert!(matches!(err, DockMonError::NotFound(_)));
    }
}
