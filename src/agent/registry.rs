//! Connected-agent registry and registration handling

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::database::{ConnectionType, Database, HostRecord};
use crate::error::{DockMonError, Result};

use super::channel::{AgentChannel, AgentHello};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub token: String,
    pub engine_id: String,
    pub hostname: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl From<AgentHello> for RegistrationRequest {
    fn from(hello: AgentHello) -> Self {
        Self {
            token: hello.token,
            engine_id: hello.engine_id,
            hostname: hello.hostname,
            version: hello.version,
            capabilities: hello.capabilities,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub success: bool,
    pub host_id: String,
    pub migration_detected: bool,
}

/// Live agent channels keyed by host ID.
#[derive(Default)]
pub struct AgentRegistry {
    channels: DashMap<String, Arc<AgentChannel>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, host_id: &str, channel: Arc<AgentChannel>) {
        if let Some(old) = self.channels.insert(host_id.to_string(), channel) {
            // A reconnecting agent supersedes its previous socket.
            old.close();
        }
    }

    pub fn detach(&self, host_id: &str) {
        if let Some((_, channel)) = self.channels.remove(host_id) {
            channel.close();
        }
    }

    pub fn get(&self, host_id: &str) -> Option<Arc<AgentChannel>> {
        self.channels.get(host_id).map(|e| e.value().clone())
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        self.get(host_id).map(|c| c.is_connected()).unwrap_or(false)
    }

    /// Validate a registration request and create (or migrate to) the
    /// agent's host record.
    ///
    /// If an active non-local host already carries the same engine ID,
    /// all of its composite-key references move to the new host in one
    /// transaction and the old record is retired. A local match is
    /// rejected outright; a host that has already been migrated once is
    /// rejected as well.
    pub async fn register(
        &self,
        db: &Database,
        request: &RegistrationRequest,
    ) -> Result<RegistrationResponse> {
        let token_hash = hash_token(&request.token);
        if !db
            .consume_registration_token(&token_hash, chrono::Utc::now())
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?
        {
            return Err(DockMonError::Unauthorized(
                "invalid or expired registration token".into(),
            ));
        }

        let existing = db
            .find_host_by_engine_id(&request.engine_id)
            .await
            .map_err(|e| DockMonError::Internal(e.to_string()))?;

        let (host_id, migration_detected) = match existing {
            Some(host) if host.connection_type == ConnectionType::Local => {
                return Err(DockMonError::Validation(
                    "migrating a local host to an agent is not supported".into(),
                ));
            }
            Some(host) if !host.is_active => {
                return Err(DockMonError::Conflict(format!(
                    "host {} was already migrated",
                    host.id
                )));
            }
            Some(host) => {
                let new_id = uuid::Uuid::new_v4().to_string();
                let mut record = HostRecord::new(
                    &new_id,
                    &request.hostname,
                    "agent://",
                    ConnectionType::Agent,
                );
                record.engine_id = Some(request.engine_id.clone());
                db.insert_host(&record)
                    .await
                    .map_err(|e| DockMonError::Internal(e.to_string()))?;

                match db.migrate_host_references(&host.id, &new_id).await {
                    Ok(_) => {
                        info!(old = %host.id, new = %new_id, "agent registration migrated host");
                        (new_id, true)
                    }
                    Err(e) => {
                        // Compensate: the fresh host record must not
                        // survive a failed migration.
                        warn!(error = %e, "migration failed, removing new host record");
                        let _ = db.delete_host(&new_id).await;
                        return Err(DockMonError::Internal(format!(
                            "engine migration failed: {e}"
                        )));
                    }
                }
            }
            None => {
                let new_id = uuid::Uuid::new_v4().to_string();
                let mut record = HostRecord::new(
                    &new_id,
                    &request.hostname,
                    "agent://",
                    ConnectionType::Agent,
                );
                record.engine_id = Some(request.engine_id.clone());
                db.insert_host(&record)
                    .await
                    .map_err(|e| DockMonError::Internal(e.to_string()))?;
                (new_id, false)
            }
        };

        Ok(RegistrationResponse {
            success: true,
            host_id,
            migration_detected,
        })
    }
}

pub(crate) fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;
    use crate::database::DesiredState;

    fn request(engine_id: &str) -> RegistrationRequest {
        RegistrationRequest {
            token: "reg-token".into(),
            engine_id: engine_id.to_string(),
            hostname: "edge-1".into(),
            version: "1.0.0".into(),
            capabilities: vec!["update".into()],
        }
    }

    async fn seed_token(db: &Database) {
        db.insert_registration_token(&hash_token("reg-token"), "test", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_registration_creates_host() {
        let db = seeded().await;
        seed_token(&db).await;
        let registry = AgentRegistry::new();

        let response = registry.register(&db, &request("engine-1")).await.unwrap();
        assert!(response.success);
        assert!(!response.migration_detected);

        let host = db.get_host(&response.host_id).await.unwrap().unwrap();
        assert_eq!(host.connection_type, ConnectionType::Agent);
        assert_eq!(host.engine_id.as_deref(), Some("engine-1"));
    }

    #[tokio::test]
    async fn test_registration_migrates_matching_remote_host() {
        let db = seeded().await;
        seed_token(&db).await;

        // h1 (remote) carries engine-1 plus container-scoped records.
        {
            let conn = db.conn().await;
            conn.execute(
                "UPDATE hosts SET engine_id = 'engine-1' WHERE id = 'h1'",
                [],
            )
            .unwrap();
        }
        db.set_auto_restart("h1", "abc123def456", "web", true)
            .await
            .unwrap();
        db.set_desired_state("h1", "abc123def456", "web", DesiredState::ShouldRun)
            .await
            .unwrap();

        let registry = AgentRegistry::new();
        let response = registry.register(&db, &request("engine-1")).await.unwrap();
        assert!(response.migration_detected);

        let old = db.get_host("h1").await.unwrap().unwrap();
        assert!(!old.is_active);
        assert_eq!(old.replaced_by_host_id.as_deref(), Some(response.host_id.as_str()));

        let new_key = format!("{}:abc123def456", response.host_id);
        assert!(db.get_auto_restart(&new_key).await.unwrap().is_some());
        assert!(db.get_auto_restart("h1:abc123def456").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_rejects_local_host_match() {
        let db = seeded().await;
        seed_token(&db).await;
        let mut local = HostRecord::new("hl", "laptop", "unix:///var/run/docker.sock", ConnectionType::Local);
        local.engine_id = Some("engine-1".into());
        db.insert_host(&local).await.unwrap();

        let registry = AgentRegistry::new();
        let err = registry.register(&db, &request("engine-1")).await.unwrap_err();
        assert!(matches!(err, DockMonError::Validation(msg) if msg.contains("not supported")));
    }

    #[tokio::test]
    async fn test_registration_rejects_already_migrated() {
        let db = seeded().await;
        seed_token(&db).await;
        {
            let conn = db.conn().await;
            conn.execute(
                "UPDATE hosts SET engine_id = 'engine-1', is_active = 0, replaced_by_host_id = 'hx' \
                 WHERE id = 'h1'",
                [],
            )
            .unwrap();
        }

        let registry = AgentRegistry::new();
        let err = registry.register(&db, &request("engine-1")).await.unwrap_err();
        assert!(matches!(err, DockMonError::Conflict(msg) if msg.contains("already migrated")));
    }

    #[tokio::test]
    async fn test_bad_token_rejected() {
        let db = seeded().await;
        let registry = AgentRegistry::new();
        let err = registry.register(&db, &request("engine-1")).await.unwrap_err();
        assert!(matches!(err, DockMonError::Unauthorized(_)));
    }
}
