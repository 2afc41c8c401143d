//! Host records, engine-ID migration and host data cleanup

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ts_from_db, ts_to_db, Database, DatabaseError, DatabaseResult};

/// How the daemon reaches a host's Docker API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Local,
    Remote,
    Agent,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Local => "local",
            ConnectionType::Remote => "remote",
            ConnectionType::Agent => "agent",
        }
    }

    fn from_db(s: &str) -> DatabaseResult<Self> {
        match s {
            "local" => Ok(ConnectionType::Local),
            "remote" => Ok(ConnectionType::Remote),
            "agent" => Ok(ConnectionType::Agent),
            other => Err(DatabaseError::Serialization(format!(
                "unknown connection_type {other:?}"
            ))),
        }
    }
}

/// TLS material for mTLS remote hosts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub tls: TlsMaterial,
    pub engine_id: Option<String>,
    pub is_active: bool,
    pub replaced_by_host_id: Option<String>,
    /// Raw JSON blob from Docker `/info`.
    pub system_info: Option<serde_json::Value>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl HostRecord {
    pub fn remote(id: &str, name: &str, url: &str) -> Self {
        Self::new(id, name, url, ConnectionType::Remote)
    }

    pub fn new(id: &str, name: &str, url: &str, connection_type: ConnectionType) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            connection_type,
            tls: TlsMaterial::default(),
            engine_id: None,
            is_active: true,
            replaced_by_host_id: None,
            system_info: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of an engine-ID match during agent registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No prior host shared the engine ID; plain registration.
    Fresh,
    /// All composite keys were rewritten from the old host to the new one.
    Migrated { old_host_id: String },
}

/// Per-table counts removed by `cleanup_host_data`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    pub auto_restart_configs: usize,
    pub desired_states: usize,
    pub alerts_resolved: usize,
}

fn row_to_host(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawHost> {
    Ok(RawHost {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        connection_type: row.get(3)?,
        tls_ca: row.get(4)?,
        tls_cert: row.get(5)?,
        tls_key: row.get(6)?,
        engine_id: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
        replaced_by_host_id: row.get(9)?,
        system_info: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

struct RawHost {
    id: String,
    name: String,
    url: String,
    connection_type: String,
    tls_ca: Option<String>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    engine_id: Option<String>,
    is_active: bool,
    replaced_by_host_id: Option<String>,
    system_info: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawHost {
    fn into_record(self) -> DatabaseResult<HostRecord> {
        Ok(HostRecord {
            connection_type: ConnectionType::from_db(&self.connection_type)?,
            system_info: self
                .system_info
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: ts_from_db(&self.created_at)?,
            updated_at: ts_from_db(&self.updated_at)?,
            id: self.id,
            name: self.name,
            url: self.url,
            tls: TlsMaterial {
                ca: self.tls_ca,
                cert: self.tls_cert,
                key: self.tls_key,
            },
            engine_id: self.engine_id,
            is_active: self.is_active,
            replaced_by_host_id: self.replaced_by_host_id,
        })
    }
}

const HOST_COLUMNS: &str = "id, name, url, connection_type, tls_ca, tls_cert, tls_key, \
     engine_id, is_active, replaced_by_host_id, system_info, created_at, updated_at";

impl Database {
    pub async fn insert_host(&self, host: &HostRecord) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO hosts (id, name, url, connection_type, tls_ca, tls_cert, tls_key, \
             engine_id, is_active, replaced_by_host_id, system_info, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                host.id,
                host.name,
                host.url,
                host.connection_type.as_str(),
                host.tls.ca,
                host.tls.cert,
                host.tls.key,
                host.engine_id,
                host.is_active as i64,
                host.replaced_by_host_id,
                host.system_info.as_ref().map(|v| v.to_string()),
                ts_to_db(host.created_at),
                ts_to_db(host.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_host(&self, id: &str) -> DatabaseResult<Option<HostRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
                [id],
                row_to_host,
            )
            .optional()?;
        raw.map(RawHost::into_record).transpose()
    }

    pub async fn list_hosts(&self) -> DatabaseResult<Vec<HostRecord>> {
        let conn = self.conn().await;
        let mut stmt =
            conn.prepare(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY name"))?;
        let raws = stmt
            .query_map([], row_to_host)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawHost::into_record).collect()
    }

    /// Active host matching an agent's engine ID, if any.
    pub async fn find_host_by_engine_id(
        &self,
        engine_id: &str,
    ) -> DatabaseResult<Option<HostRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {HOST_COLUMNS} FROM hosts WHERE engine_id = ?1 \
                     ORDER BY is_active DESC, updated_at DESC LIMIT 1"
                ),
                [engine_id],
                row_to_host,
            )
            .optional()?;
        raw.map(RawHost::into_record).transpose()
    }

    pub async fn update_host_system_info(
        &self,
        id: &str,
        info: &serde_json::Value,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE hosts SET system_info = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, info.to_string(), ts_to_db(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn delete_host(&self, id: &str) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute("DELETE FROM hosts WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Rewrite every composite-key reference from `old_host_id` to
    /// `new_host_id` and retire the old host. Atomic: any failure rolls
    /// the whole migration back.
    ///
    /// Covered families: auto-restart configs, desired states, container
    /// tag assignments, health checks, deployment metadata, container
    /// updates.
    pub async fn migrate_host_references(
        &self,
        old_host_id: &str,
        new_host_id: &str,
    ) -> DatabaseResult<MigrationOutcome> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;

        // "old:abc123def456" -> "new:abc123def456". The prefix length is
        // the old host id plus the separator; substr is 1-based.
        let rekey = |table: &str, column: &str| -> String {
            format!(
                "UPDATE {table} SET host_id = :new, \
                 {column} = :new || substr({column}, length(:old) + 1) \
                 WHERE host_id = :old"
            )
        };

        for (table, column) in [
            ("auto_restart_configs", "container_id"),
            ("desired_states", "container_id"),
            ("health_checks", "container_id"),
            ("deployment_metadata", "container_id"),
            ("container_updates", "container_id"),
        ] {
            tx.execute(
                &rekey(table, column),
                rusqlite::named_params! { ":old": old_host_id, ":new": new_host_id },
            )?;
        }

        // Tag assignments address containers through subject_id.
        tx.execute(
            "UPDATE tag_assignments \
             SET subject_id = :new || substr(subject_id, length(:old) + 1) \
             WHERE subject_type = 'container' AND subject_id LIKE :old || ':%'",
            rusqlite::named_params! { ":old": old_host_id, ":new": new_host_id },
        )?;
        tx.execute(
            "UPDATE tag_assignments SET subject_id = :new \
             WHERE subject_type = 'host' AND subject_id = :old",
            rusqlite::named_params! { ":old": old_host_id, ":new": new_host_id },
        )?;

        let retired = tx.execute(
            "UPDATE hosts SET is_active = 0, replaced_by_host_id = ?2, updated_at = ?3 \
             WHERE id = ?1",
            params![old_host_id, new_host_id, ts_to_db(Utc::now())],
        )?;
        if retired == 0 {
            return Err(DatabaseError::NotFound(format!("host {old_host_id}")));
        }

        tx.commit()?;

        info!(old = old_host_id, new = new_host_id, "host references migrated");
        Ok(MigrationOutcome::Migrated {
            old_host_id: old_host_id.to_string(),
        })
    }

    /// Remove the per-host records that do not cascade and resolve (not
    /// delete) the host's open alerts. Audit and event logs are kept.
    /// Idempotent: a second call reports zeros.
    pub async fn cleanup_host_data(&self, host_id: &str) -> DatabaseResult<CleanupCounts> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;

        let auto_restart_configs = tx.execute(
            "DELETE FROM auto_restart_configs WHERE host_id = ?1",
            [host_id],
        )?;
        let desired_states =
            tx.execute("DELETE FROM desired_states WHERE host_id = ?1", [host_id])?;

        let now = ts_to_db(Utc::now());
        let alerts_resolved = tx.execute(
            "UPDATE alerts SET state = 'resolved', resolved_at = ?2, next_retry_at = NULL \
             WHERE state = 'open' AND (\
                 (scope_type = 'host' AND scope_id = ?1) \
                 OR entity_key LIKE ?1 || ':%')",
            params![host_id, now],
        )?;

        tx.commit()?;

        if auto_restart_configs + desired_states + alerts_resolved > 0 {
            warn!(
                host = host_id,
                auto_restart_configs, desired_states, alerts_resolved,
                "host data cleaned up"
            );
        }

        Ok(CleanupCounts {
            auto_restart_configs,
            desired_states,
            alerts_resolved,
        })
    }

    /// Dashboard counts: (online, offline, total) by last known status.
    pub async fn count_hosts(&self) -> DatabaseResult<usize> {
        let conn = self.conn().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM hosts WHERE is_active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_host_roundtrip() {
        let db = seeded().await;
        let host = db.get_host("h1").await.unwrap().unwrap();
        assert_eq!(host.name, "host-one");
        assert_eq!(host.connection_type, ConnectionType::Remote);
        assert!(host.is_active);
        assert!(host.replaced_by_host_id.is_none());
    }

    #[tokio::test]
    async fn test_migration_rewrites_all_families() {
        let db = seeded().await;
        db.insert_host(&HostRecord::new(
            "h2",
            "agent-host",
            "agent://",
            ConnectionType::Agent,
        ))
        .await
        .unwrap();

        db.set_auto_restart("h1", "abc123def456", "web", true)
            .await
            .unwrap();
        db.set_desired_state("h1", "abc123def456", "web", super::super::DesiredState::ShouldRun)
            .await
            .unwrap();
        let tag = db.create_tag("prod", "#ff0000").await.unwrap();
        db.assign_tag(tag, "container", "h1:abc123def456", 0, "user")
            .await
            .unwrap();

        let outcome = db.migrate_host_references("h1", "h2").await.unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                old_host_id: "h1".into()
            }
        );

        let old = db.get_host("h1").await.unwrap().unwrap();
        assert!(!old.is_active);
        assert_eq!(old.replaced_by_host_id.as_deref(), Some("h2"));

        assert!(db
            .get_auto_restart("h2:abc123def456")
            .await
            .unwrap()
            .is_some());
        assert!(db
            .get_auto_restart("h1:abc123def456")
            .await
            .unwrap()
            .is_none());

        let assignments = db
            .assignments_for_subject("container", "h2:abc123def456")
            .await
            .unwrap();
        assert_eq!(assignments.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_host_data_idempotent() {
        let db = seeded().await;
        db.set_auto_restart("h1", "abc123def456", "web", true)
            .await
            .unwrap();
        db.set_desired_state("h1", "abc123def456", "web", super::super::DesiredState::OnDemand)
            .await
            .unwrap();

        let first = db.cleanup_host_data("h1").await.unwrap();
        assert_eq!(first.auto_restart_configs, 1);
        assert_eq!(first.desired_states, 1);

        let second = db.cleanup_host_data("h1").await.unwrap();
        assert_eq!(second, CleanupCounts::default());
    }

    #[tokio::test]
    async fn test_host_delete_cascades_metadata() {
        let db = seeded().await;
        db.upsert_deployment_metadata("h1:abc123def456", "h1", None, true, None)
            .await
            .unwrap();
        assert!(db.delete_host("h1").await.unwrap());
        assert!(db
            .get_deployment_metadata("h1:abc123def456")
            .await
            .unwrap()
            .is_none());
    }
}
