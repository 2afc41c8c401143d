//! Registry digest comparison
//!
//! Periodically resolves the manifest digest behind each container's
//! tag and flags drift. Floating tags are followed; exact pins are left
//! alone.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::database::{ContainerUpdateRecord, Database, FloatingTagMode};
use crate::docker::SessionManager;
use crate::events::{EventBus, MonitorEvent};
use crate::keys::make_composite_key;

/// Registry lookup seam; the HTTP implementation speaks the v2 manifest
/// protocol, tests stub it.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Digest currently behind `image` (`repo:tag` form), or None when
    /// the registry does not expose one.
    async fn manifest_digest(
        &self,
        image: &str,
        credentials: Option<(String, String)>,
    ) -> Result<Option<String>, String>;
}

/// Docker Registry HTTP API v2 client. Handles Docker Hub's token
/// handshake and falls back to anonymous pulls elsewhere.
pub struct HttpRegistryClient {
    client: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
        }
    }

    /// Split `registry/repo:tag` into endpoint coordinates, defaulting
    /// to Docker Hub with the `library/` namespace.
    fn parse_image(image: &str) -> (String, String, String) {
        let (name, tag) = match image.rsplit_once(':') {
            // A colon inside the last path segment is a tag; one before
            // a slash is a registry port.
            Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
            _ => (image.to_string(), "latest".to_string()),
        };

        let first = name.split('/').next().unwrap_or_default();
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let (registry, repo) = name.split_once('/').unwrap_or((first, ""));
            (registry.to_string(), repo.to_string(), tag)
        } else if name.contains('/') {
            ("registry-1.docker.io".to_string(), name, tag)
        } else {
            ("registry-1.docker.io".to_string(), format!("library/{name}"), tag)
        }
    }

    async fn hub_token(
        &self,
        repo: &str,
        credentials: &Option<(String, String)>,
    ) -> Result<String, String> {
        let url = format!(
            "https://auth.docker.io/token?service=registry.docker.io&scope=repository:{repo}:pull"
        );
        let mut request = self.client.get(&url);
        if let Some((user, pass)) = credentials {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        body.get("token")
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| "no token in auth response".to_string())
    }
}

impl Default for HttpRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn manifest_digest(
        &self,
        image: &str,
        credentials: Option<(String, String)>,
    ) -> Result<Option<String>, String> {
        let (registry, repo, tag) = Self::parse_image(image);
        let url = format!("https://{registry}/v2/{repo}/manifests/{tag}");

        let mut request = self.client.head(&url).header(
            "Accept",
            "application/vnd.docker.distribution.manifest.v2+json, \
             application/vnd.oci.image.index.v1+json, \
             application/vnd.docker.distribution.manifest.list.v2+json",
        );

        if registry == "registry-1.docker.io" {
            let token = self.hub_token(&repo, &credentials).await?;
            request = request.bearer_auth(token);
        } else if let Some((user, pass)) = &credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("registry returned HTTP {}", response.status()));
        }

        Ok(response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

pub struct UpdateChecker {
    db: Arc<Database>,
    manager: Arc<SessionManager>,
    bus: EventBus,
    registry: Arc<dyn RegistryClient>,
}

impl UpdateChecker {
    pub fn new(
        db: Arc<Database>,
        manager: Arc<SessionManager>,
        bus: EventBus,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        Self {
            db,
            manager,
            bus,
            registry,
        }
    }

    /// Sweep every online host's containers for digest drift.
    pub async fn check_all(&self) {
        let hosts = match self.db.list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("update sweep host listing failed: {e}");
                return;
            }
        };

        for host in hosts.into_iter().filter(|h| h.is_active) {
            if let Err(e) = self.check_host(&host.id).await {
                debug!(host = %host.id, "update check skipped: {e}");
            }
        }
    }

    pub async fn check_host(&self, host_id: &str) -> Result<usize, String> {
        let session = self
            .manager
            .ensure(host_id)
            .await
            .map_err(|e| e.to_string())?;
        let containers = session
            .list_containers(true)
            .await
            .map_err(|e| e.to_string())?;

        let mut flagged = 0;
        for brief in containers {
            let Ok(composite_key) = make_composite_key(host_id, &brief.short_id) else {
                continue;
            };

            let mode = match self.db.get_container_update(&composite_key).await {
                Ok(Some(existing)) => existing.floating_tag_mode,
                _ => FloatingTagMode::Latest,
            };

            // Exact pins are not followed; the operator chose a digest.
            if mode == FloatingTagMode::Exact {
                continue;
            }

            // The comparison only means anything manifest-to-manifest:
            // the container's image ID is a config digest, so resolve
            // the local image's RepoDigests instead.
            let current_digest = match session.inspect(&brief.short_id).await {
                Ok(inspect) => session
                    .image_repo_digest(&inspect.image_id)
                    .await
                    .unwrap_or(None),
                Err(_) => None,
            };

            let latest_digest = match self.registry.manifest_digest(&brief.image, None).await {
                Ok(digest) => digest,
                Err(e) => {
                    debug!(image = %brief.image, "digest lookup failed: {e}");
                    continue;
                }
            };

            let update_available = match (&current_digest, &latest_digest) {
                (Some(current), Some(latest)) => current != latest,
                _ => false,
            };

            let record = ContainerUpdateRecord {
                container_id: composite_key.clone(),
                host_id: host_id.to_string(),
                current_image: brief.image.clone(),
                current_digest,
                latest_image: brief.image.clone(),
                latest_digest,
                update_available,
                floating_tag_mode: mode,
                last_checked_at: Some(Utc::now()),
            };

            if let Err(e) = self.db.upsert_container_update(&record).await {
                warn!(container = %composite_key, "update record write failed: {e}");
                continue;
            }

            if update_available {
                flagged += 1;
                self.bus.publish(MonitorEvent::UpdateAvailable {
                    composite_key,
                    host_id: host_id.to_string(),
                    current_image: brief.image.clone(),
                    latest_image: brief.image,
                });
            }
        }

        Ok(flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_docker_hub_library() {
        let (registry, repo, tag) = HttpRegistryClient::parse_image("nginx:1.25");
        assert_eq!(registry, "registry-1.docker.io");
        assert_eq!(repo, "library/nginx");
        assert_eq!(tag, "1.25");
    }

    #[test]
    fn test_parse_image_docker_hub_namespaced() {
        let (registry, repo, tag) = HttpRegistryClient::parse_image("bitnami/redis");
        assert_eq!(registry, "registry-1.docker.io");
        assert_eq!(repo, "bitnami/redis");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_parse_image_private_registry_with_port() {
        let (registry, repo, tag) =
            HttpRegistryClient::parse_image("registry.example.com:5000/team/app:v2");
        assert_eq!(registry, "registry.example.com:5000");
        assert_eq!(repo, "team/app");
        assert_eq!(tag, "v2");
    }

    #[test]
    fn test_parse_image_ghcr() {
        let (registry, repo, tag) = HttpRegistryClient::parse_image("ghcr.io/acme/tool:edge");
        assert_eq!(registry, "ghcr.io");
        assert_eq!(repo, "acme/tool");
        assert_eq!(tag, "edge");
    }
}
