//! A single host's Docker session
//!
//! Three transports: the local socket, a TCP endpoint with client
//! certificates, or command relay through a connected agent. Callers see
//! one API; the agent variant serializes operations through the channel's
//! request/response protocol.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::{ListContainersOptions, RemoveContainerOptions, StopContainerOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::agent::{AgentChannel, AgentError};
use crate::database::{ConnectionType, HostRecord};
use crate::events::{ContainerState, OfflineReason};
use crate::keys::normalize_container_id;

/// Docker API timeout used for connects, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("{0}")]
    Connect(String, OfflineReason),

    #[error("operation requires a direct Docker connection")]
    NeedsDocker,
}

impl SessionError {
    /// Classified reason when this failure should mark the host offline.
    pub fn offline_reason(&self) -> OfflineReason {
        match self {
            SessionError::Docker(e) => classify_error(e),
            SessionError::Agent(_) => OfflineReason::Unreachable,
            SessionError::Connect(_, reason) => *reason,
            _ => OfflineReason::ProtocolError,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Classify a bollard error into the host-offline taxonomy.
pub fn classify_error(err: &bollard::errors::Error) -> OfflineReason {
    use bollard::errors::Error;
    if let Error::DockerResponseServerError { status_code, .. } = err {
        if *status_code == 401 || *status_code == 403 {
            return OfflineReason::AuthFailed;
        }
        return OfflineReason::ProtocolError;
    }

    let text = err.to_string().to_lowercase();
    if text.contains("certificate") || text.contains("tls") || text.contains("ssl") {
        OfflineReason::TlsInvalid
    } else if text.contains("unauthorized") || text.contains("authentication") {
        OfflineReason::AuthFailed
    } else if text.contains("timed out")
        || text.contains("timeout")
        || text.contains("refused")
        || text.contains("unreachable")
        || text.contains("no such file")
        || text.contains("dns")
    {
        OfflineReason::Unreachable
    } else {
        OfflineReason::ProtocolError
    }
}

/// Flattened list entry for the pipeline and API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerBrief {
    pub short_id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Flattened inspect result; only the fields the monitor acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectBrief {
    pub short_id: String,
    pub name: String,
    pub image: String,
    /// Image ID the container was created from.
    pub image_id: String,
    pub running: bool,
    /// `healthy` / `unhealthy` / `starting` when a HEALTHCHECK exists.
    pub health_status: Option<String>,
    pub exit_code: Option<i64>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug)]
enum Transport {
    Docker(Docker),
    Agent(Arc<AgentChannel>),
}

/// One host's live session.
#[derive(Debug)]
pub struct HostSession {
    host_id: String,
    transport: Transport,
}

impl HostSession {
    /// Establish a session for a host record.
    ///
    /// Connection failures come back classified so the manager can store
    /// an offline reason without string matching.
    pub fn connect(host: &HostRecord, agent: Option<Arc<AgentChannel>>) -> SessionResult<Self> {
        let transport = match host.connection_type {
            ConnectionType::Local => {
                let docker = if let Some(path) = host.url.strip_prefix("unix://") {
                    Docker::connect_with_socket(path, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                } else {
                    Docker::connect_with_local_defaults()
                }
                .map_err(|e| SessionError::Connect(e.to_string(), classify_error(&e)))?;
                Transport::Docker(docker)
            }
            ConnectionType::Remote => {
                // TLS material fields hold paths to PEM files.
                let (ca, cert, key) = match (&host.tls.ca, &host.tls.cert, &host.tls.key) {
                    (Some(ca), Some(cert), Some(key)) => (ca, cert, key),
                    _ => {
                        return Err(SessionError::Connect(
                            format!("host {} is missing TLS material", host.id),
                            OfflineReason::TlsInvalid,
                        ))
                    }
                };
                let docker = Docker::connect_with_ssl(
                    &host.url,
                    std::path::Path::new(key),
                    std::path::Path::new(cert),
                    std::path::Path::new(ca),
                    CONNECT_TIMEOUT_SECS,
                    bollard::API_DEFAULT_VERSION,
                )
                .map_err(|e| SessionError::Connect(e.to_string(), classify_error(&e)))?;
                Transport::Docker(docker)
            }
            ConnectionType::Agent => {
                let channel = agent.filter(|c| c.is_connected()).ok_or_else(|| {
                    SessionError::Connect(
                        format!("no connected agent for host {}", host.id),
                        OfflineReason::Unreachable,
                    )
                })?;
                Transport::Agent(channel)
            }
        };

        Ok(Self {
            host_id: host.id.clone(),
            transport,
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Direct Docker client, when this session has one. Deployments and
    /// image pulls need it; agent-relayed hosts run those agent-side.
    pub fn docker(&self) -> SessionResult<&Docker> {
        match &self.transport {
            Transport::Docker(docker) => Ok(docker),
            Transport::Agent(_) => Err(SessionError::NeedsDocker),
        }
    }

    pub fn agent(&self) -> Option<Arc<AgentChannel>> {
        match &self.transport {
            Transport::Agent(channel) => Some(channel.clone()),
            Transport::Docker(_) => None,
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self.transport, Transport::Agent(_))
    }

    pub async fn ping(&self) -> SessionResult<()> {
        match &self.transport {
            Transport::Docker(docker) => {
                docker.ping().await?;
                Ok(())
            }
            Transport::Agent(channel) => {
                channel.send_command("ping", json!({})).await?;
                Ok(())
            }
        }
    }

    /// Docker `/info`, stored on the host record as system info.
    pub async fn system_info(&self) -> SessionResult<serde_json::Value> {
        match &self.transport {
            Transport::Docker(docker) => {
                let info = docker.info().await?;
                Ok(serde_json::to_value(info).unwrap_or(serde_json::Value::Null))
            }
            Transport::Agent(channel) => Ok(channel.send_command("system_info", json!({})).await?),
        }
    }

    pub async fn list_containers(&self, all: bool) -> SessionResult<Vec<ContainerBrief>> {
        match &self.transport {
            Transport::Docker(docker) => {
                let options = Some(ListContainersOptions::<String> {
                    all,
                    ..Default::default()
                });
                let containers = docker.list_containers(options).await?;

                let mut result = Vec::with_capacity(containers.len());
                for container in containers {
                    let id = container.id.unwrap_or_default();
                    let name = container
                        .names
                        .and_then(|n| n.first().cloned())
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string();

                    result.push(ContainerBrief {
                        short_id: normalize_container_id(&id).to_string(),
                        name,
                        image: container.image.unwrap_or_default(),
                        state: container
                            .state
                            .as_deref()
                            .map(ContainerState::from)
                            .unwrap_or(ContainerState::Dead),
                        status: container.status.unwrap_or_default(),
                        labels: container.labels.unwrap_or_default(),
                        created_at: chrono::DateTime::from_timestamp(
                            container.created.unwrap_or(0),
                            0,
                        )
                        .unwrap_or_else(Utc::now),
                    });
                }
                Ok(result)
            }
            Transport::Agent(channel) => {
                let payload = channel
                    .send_command("list_containers", json!({ "all": all }))
                    .await?;
                let briefs: Vec<ContainerBrief> =
                    serde_json::from_value(payload.get("containers").cloned().unwrap_or_default())
                        .unwrap_or_default();
                Ok(briefs)
            }
        }
    }

    pub async fn inspect(&self, container_id: &str) -> SessionResult<InspectBrief> {
        match &self.transport {
            Transport::Docker(docker) => {
                let inspect = docker
                    .inspect_container(container_id, None)
                    .await
                    .map_err(not_found(container_id))?;

                let state = inspect.state.as_ref();
                Ok(InspectBrief {
                    short_id: normalize_container_id(inspect.id.as_deref().unwrap_or_default())
                        .to_string(),
                    name: inspect
                        .name
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    image: inspect
                        .config
                        .as_ref()
                        .and_then(|c| c.image.clone())
                        .unwrap_or_default(),
                    image_id: inspect.image.unwrap_or_default(),
                    running: state.and_then(|s| s.running).unwrap_or(false),
                    health_status: state
                        .and_then(|s| s.health.as_ref())
                        .and_then(|h| h.status)
                        .map(|s| format!("{s:?}").to_lowercase()),
                    exit_code: state.and_then(|s| s.exit_code),
                    labels: inspect
                        .config
                        .and_then(|c| c.labels)
                        .unwrap_or_default(),
                })
            }
            Transport::Agent(channel) => {
                let payload = channel
                    .send_command("inspect_container", json!({ "container_id": container_id }))
                    .await?;
                serde_json::from_value(payload).map_err(|e| {
                    SessionError::Agent(AgentError::Remote(format!("bad inspect payload: {e}")))
                })
            }
        }
    }

    pub async fn start_container(&self, container_id: &str) -> SessionResult<()> {
        match &self.transport {
            Transport::Docker(docker) => {
                docker
                    .start_container::<String>(container_id, None)
                    .await
                    .map_err(not_found(container_id))?;
                Ok(())
            }
            Transport::Agent(channel) => {
                channel
                    .send_command("start_container", json!({ "container_id": container_id }))
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn stop_container(&self, container_id: &str, timeout: Option<i64>) -> SessionResult<()> {
        match &self.transport {
            Transport::Docker(docker) => {
                let options = Some(StopContainerOptions {
                    t: timeout.unwrap_or(10),
                });
                docker
                    .stop_container(container_id, options)
                    .await
                    .map_err(not_found(container_id))?;
                Ok(())
            }
            Transport::Agent(channel) => {
                channel
                    .send_command(
                        "stop_container",
                        json!({ "container_id": container_id, "timeout": timeout }),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn restart_container(&self, container_id: &str) -> SessionResult<()> {
        match &self.transport {
            Transport::Docker(docker) => {
                docker
                    .restart_container(container_id, None)
                    .await
                    .map_err(not_found(container_id))?;
                Ok(())
            }
            Transport::Agent(channel) => {
                channel
                    .send_command("restart_container", json!({ "container_id": container_id }))
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn remove_container(&self, container_id: &str, force: bool) -> SessionResult<()> {
        match &self.transport {
            Transport::Docker(docker) => {
                let options = Some(RemoveContainerOptions {
                    force,
                    v: false,
                    ..Default::default()
                });
                docker
                    .remove_container(container_id, options)
                    .await
                    .map_err(not_found(container_id))?;
                Ok(())
            }
            Transport::Agent(channel) => {
                channel
                    .send_command(
                        "remove_container",
                        json!({ "container_id": container_id, "force": force }),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Manifest digest Docker recorded for an image when it was pulled
    /// (`RepoDigests`). This is the digest registries serve in
    /// `docker-content-digest`, so the two are directly comparable.
    /// None for locally built images, which have no repo digest.
    pub async fn image_repo_digest(&self, image_ref: &str) -> SessionResult<Option<String>> {
        match &self.transport {
            Transport::Docker(docker) => {
                let inspect = docker.inspect_image(image_ref).await?;
                Ok(extract_repo_digest(
                    inspect.repo_digests.as_deref().unwrap_or(&[]),
                ))
            }
            Transport::Agent(channel) => {
                let payload = channel
                    .send_command("inspect_image", json!({ "image": image_ref }))
                    .await?;
                let digests: Vec<String> = serde_json::from_value(
                    payload.get("repo_digests").cloned().unwrap_or_default(),
                )
                .unwrap_or_default();
                Ok(extract_repo_digest(&digests))
            }
        }
    }

    /// One-shot CPU and memory percentages for a running container.
    pub async fn stats_sample(&self, container_id: &str) -> SessionResult<(f64, f64)> {
        match &self.transport {
            Transport::Docker(docker) => {
                use bollard::container::StatsOptions;
                use futures_util::StreamExt;

                let options = Some(StatsOptions {
                    stream: false,
                    one_shot: true,
                });
                let mut stream = docker.stats(container_id, options);
                let Some(result) = stream.next().await else {
                    return Err(SessionError::ContainerNotFound(container_id.to_string()));
                };
                let stats = result.map_err(not_found(container_id))?;

                let cpu_delta = stats
                    .cpu_stats
                    .cpu_usage
                    .total_usage
                    .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
                let system_delta = stats
                    .cpu_stats
                    .system_cpu_usage
                    .unwrap_or(0)
                    .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
                let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1);

                let cpu_percent = if system_delta > 0 && online_cpus > 0 {
                    (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
                } else {
                    0.0
                };

                let memory_usage = stats.memory_stats.usage.unwrap_or(0);
                let memory_limit = stats.memory_stats.limit.unwrap_or(1).max(1);
                let memory_percent = (memory_usage as f64 / memory_limit as f64) * 100.0;

                Ok((cpu_percent, memory_percent))
            }
            Transport::Agent(channel) => {
                let payload = channel
                    .send_command("container_stats", json!({ "container_id": container_id }))
                    .await?;
                let cpu = payload.get("cpu_percent").and_then(|v| v.as_f64()).unwrap_or(0.0);
                let memory = payload
                    .get("memory_percent")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0);
                Ok((cpu, memory))
            }
        }
    }

    pub async fn container_logs(&self, container_id: &str, tail: &str) -> SessionResult<Vec<String>> {
        match &self.transport {
            Transport::Docker(docker) => {
                use bollard::container::LogsOptions;
                use futures_util::StreamExt;

                let options = Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    tail: tail.to_string(),
                    timestamps: true,
                    ..Default::default()
                });

                let mut stream = docker.logs(container_id, options);
                let mut lines = Vec::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message })
                        | Ok(bollard::container::LogOutput::StdErr { message })
                        | Ok(bollard::container::LogOutput::Console { message }) => {
                            lines.push(String::from_utf8_lossy(&message).to_string());
                        }
                        Ok(_) => {}
                        Err(e) => return Err(not_found(container_id)(e)),
                    }
                }
                Ok(lines)
            }
            Transport::Agent(channel) => {
                let payload = channel
                    .send_command(
                        "container_logs",
                        json!({ "container_id": container_id, "tail": tail }),
                    )
                    .await?;
                Ok(
                    serde_json::from_value(payload.get("lines").cloned().unwrap_or_default())
                        .unwrap_or_default(),
                )
            }
        }
    }
}

/// `RepoDigests` entries are `repo@sha256:...`; the part after `@` is
/// the manifest digest.
fn extract_repo_digest(entries: &[String]) -> Option<String> {
    entries
        .iter()
        .find_map(|entry| entry.rsplit_once('@').map(|(_, digest)| digest.to_string()))
}

fn not_found(id: &str) -> impl FnOnce(bollard::errors::Error) -> SessionError + '_ {
    move |e| match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => SessionError::ContainerNotFound(id.to_string()),
        other => SessionError::Docker(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::HostRecord;

    #[test]
    fn test_remote_without_tls_material_classified_invalid() {
        let host = HostRecord::remote("h1", "edge", "tcp://10.0.0.5:2376");
        let err = HostSession::connect(&host, None).unwrap_err();
        assert_eq!(err.offline_reason(), OfflineReason::TlsInvalid);
    }

    #[test]
    fn test_agent_without_channel_unreachable() {
        let host = HostRecord::new("h1", "edge", "agent://", ConnectionType::Agent);
        let err = HostSession::connect(&host, None).unwrap_err();
        assert_eq!(err.offline_reason(), OfflineReason::Unreachable);
    }

    #[test]
    fn test_classify_auth_error() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 401,
            message: "unauthorized".into(),
        };
        assert_eq!(classify_error(&err), OfflineReason::AuthFailed);
    }

    #[test]
    fn test_classify_server_error_is_protocol() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert_eq!(classify_error(&err), OfflineReason::ProtocolError);
    }

    #[test]
    fn test_extract_repo_digest() {
        let entries = vec![
            "nginx@sha256:aaa111".to_string(),
            "mirror.example.com/nginx@sha256:bbb222".to_string(),
        ];
        assert_eq!(extract_repo_digest(&entries).as_deref(), Some("sha256:aaa111"));
        // Locally built images carry no repo digest.
        assert_eq!(extract_repo_digest(&[]), None);
    }
}
