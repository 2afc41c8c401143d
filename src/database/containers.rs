//! Desired state and auto-restart records for containers

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::keys::make_composite_key;

use super::{Database, DatabaseError, DatabaseResult};

/// What the operator wants a container to be doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    ShouldRun,
    OnDemand,
    Unspecified,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::ShouldRun => "should_run",
            DesiredState::OnDemand => "on_demand",
            DesiredState::Unspecified => "unspecified",
        }
    }

    fn from_db(s: &str) -> DatabaseResult<Self> {
        match s {
            "should_run" => Ok(DesiredState::ShouldRun),
            "on_demand" => Ok(DesiredState::OnDemand),
            "unspecified" => Ok(DesiredState::Unspecified),
            other => Err(DatabaseError::Serialization(format!(
                "unknown desired state {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredStateRecord {
    pub container_id: String,
    pub host_id: String,
    pub container_name: String,
    pub desired: DesiredState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRestartConfig {
    pub container_id: String,
    pub host_id: String,
    pub container_name: String,
    pub enabled: bool,
}

impl Database {
    pub async fn set_auto_restart(
        &self,
        host_id: &str,
        short_id: &str,
        name: &str,
        enabled: bool,
    ) -> DatabaseResult<()> {
        let key = make_composite_key(host_id, short_id)
            .map_err(|e| DatabaseError::Other(e.to_string()))?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO auto_restart_configs (container_id, host_id, container_name, enabled) \
             VALUES (?1,?2,?3,?4) \
             ON CONFLICT(container_id) DO UPDATE SET enabled = ?4, container_name = ?3",
            params![key, host_id, name, enabled as i64],
        )?;
        Ok(())
    }

    pub async fn get_auto_restart(
        &self,
        composite_key: &str,
    ) -> DatabaseResult<Option<AutoRestartConfig>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT container_id, host_id, container_name, enabled \
             FROM auto_restart_configs WHERE container_id = ?1",
            [composite_key],
            |row| {
                Ok(AutoRestartConfig {
                    container_id: row.get(0)?,
                    host_id: row.get(1)?,
                    container_name: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn list_auto_restart_enabled(&self) -> DatabaseResult<Vec<AutoRestartConfig>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT container_id, host_id, container_name, enabled \
             FROM auto_restart_configs WHERE enabled = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AutoRestartConfig {
                    container_id: row.get(0)?,
                    host_id: row.get(1)?,
                    container_name: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn set_desired_state(
        &self,
        host_id: &str,
        short_id: &str,
        name: &str,
        desired: DesiredState,
    ) -> DatabaseResult<()> {
        let key = make_composite_key(host_id, short_id)
            .map_err(|e| DatabaseError::Other(e.to_string()))?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO desired_states (container_id, host_id, container_name, desired) \
             VALUES (?1,?2,?3,?4) \
             ON CONFLICT(container_id) DO UPDATE SET desired = ?4, container_name = ?3",
            params![key, host_id, name, desired.as_str()],
        )?;
        Ok(())
    }

    pub async fn get_desired_state(
        &self,
        composite_key: &str,
    ) -> DatabaseResult<Option<DesiredStateRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                "SELECT container_id, host_id, container_name, desired \
                 FROM desired_states WHERE container_id = ?1",
                [composite_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        raw.map(|(container_id, host_id, container_name, desired)| {
            Ok(DesiredStateRecord {
                container_id,
                host_id,
                container_name,
                desired: DesiredState::from_db(&desired)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_auto_restart_upsert() {
        let db = seeded().await;
        db.set_auto_restart("h1", "abc123def456", "web", true)
            .await
            .unwrap();
        db.set_auto_restart("h1", "abc123def456", "web", false)
            .await
            .unwrap();

        let cfg = db
            .get_auto_restart("h1:abc123def456")
            .await
            .unwrap()
            .unwrap();
        assert!(!cfg.enabled);
        assert!(db.list_auto_restart_enabled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_desired_state_roundtrip() {
        let db = seeded().await;
        db.set_desired_state("h1", "abc123def456", "web", DesiredState::ShouldRun)
            .await
            .unwrap();

        let record = db
            .get_desired_state("h1:abc123def456")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.desired, DesiredState::ShouldRun);
        assert_eq!(record.host_id, "h1");
    }

    #[tokio::test]
    async fn test_rejects_unknown_host() {
        let db = seeded().await;
        // FK violation surfaces as an integrity error.
        let err = db
            .set_auto_restart("missing", "abc123def456", "web", true)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Integrity(_)));
    }
}
