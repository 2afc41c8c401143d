//! Deployment records and per-container deployment metadata

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{opt_ts_from_db, ts_from_db, ts_to_db, Database, DatabaseError, DatabaseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    Container,
    Stack,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Container => "container",
            DeploymentType::Stack => "stack",
        }
    }

    fn from_db(s: &str) -> DatabaseResult<Self> {
        match s {
            "container" => Ok(DeploymentType::Container),
            "stack" => Ok(DeploymentType::Stack),
            other => Err(DatabaseError::Serialization(format!(
                "unknown deployment type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Composite `"{host_id}:{short_deployment_id}"`.
    pub id: String,
    pub host_id: String,
    pub name: String,
    pub deployment_type: DeploymentType,
    /// Raw compose YAML or container definition JSON.
    pub definition: String,
    pub stack_name: Option<String>,
    pub status: String,
    pub progress_percent: i64,
    pub current_stage: String,
    pub stage_percent: i64,
    pub rollback_on_failure: bool,
    pub committed: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMetadataRecord {
    pub container_id: String,
    pub host_id: String,
    pub deployment_id: Option<String>,
    pub is_managed: bool,
    pub service_name: Option<String>,
}

impl Database {
    pub async fn insert_deployment(&self, d: &DeploymentRecord) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO deployments (id, host_id, name, deployment_type, definition, stack_name, \
             status, progress_percent, current_stage, stage_percent, rollback_on_failure, \
             committed, error_message, created_at, updated_at, started_at, completed_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                d.id,
                d.host_id,
                d.name,
                d.deployment_type.as_str(),
                d.definition,
                d.stack_name,
                d.status,
                d.progress_percent,
                d.current_stage,
                d.stage_percent,
                d.rollback_on_failure as i64,
                d.committed as i64,
                d.error_message,
                ts_to_db(d.created_at),
                ts_to_db(d.updated_at),
                d.started_at.map(ts_to_db),
                d.completed_at.map(ts_to_db),
            ],
        )?;
        Ok(())
    }

    pub async fn get_deployment(&self, id: &str) -> DatabaseResult<Option<DeploymentRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                &format!("{DEPLOYMENT_SELECT} WHERE id = ?1"),
                [id],
                row_to_deployment_raw,
            )
            .optional()?;
        raw.map(raw_to_deployment).transpose()
    }

    pub async fn list_deployments(&self) -> DatabaseResult<Vec<DeploymentRecord>> {
        let conn = self.conn().await;
        let mut stmt =
            conn.prepare(&format!("{DEPLOYMENT_SELECT} ORDER BY created_at DESC"))?;
        let raws = stmt
            .query_map([], row_to_deployment_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(raw_to_deployment).collect()
    }

    pub async fn count_deployments_for_stack(&self, stack_name: &str) -> DatabaseResult<usize> {
        let conn = self.conn().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM deployments WHERE stack_name = ?1",
            [stack_name],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Advance a deployment: status, overall progress, stage and stage
    /// progress move together in one statement. `started_at` is stamped
    /// the first time the deployment leaves `pending`; `completed_at` on
    /// reaching a terminal state.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_deployment_status(
        &self,
        id: &str,
        status: &str,
        progress_percent: i64,
        current_stage: &str,
        stage_percent: i64,
        terminal: bool,
        error_message: Option<&str>,
    ) -> DatabaseResult<()> {
        let now = ts_to_db(Utc::now());
        let conn = self.conn().await;
        let n = conn.execute(
            "UPDATE deployments SET status = ?2, progress_percent = ?3, current_stage = ?4, \
             stage_percent = ?5, updated_at = ?6, error_message = COALESCE(?7, error_message), \
             started_at = CASE WHEN started_at IS NULL AND ?2 != 'pending' THEN ?6 ELSE started_at END, \
             completed_at = CASE WHEN ?8 THEN ?6 ELSE completed_at END \
             WHERE id = ?1",
            params![
                id,
                status,
                progress_percent,
                current_stage,
                stage_percent,
                now,
                error_message,
                terminal as i64,
            ],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("deployment {id}")));
        }
        Ok(())
    }

    pub async fn mark_deployment_committed(&self, id: &str) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE deployments SET committed = 1, updated_at = ?2 WHERE id = ?1",
            params![id, ts_to_db(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn delete_deployment(&self, id: &str) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute("DELETE FROM deployments WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub async fn upsert_deployment_metadata(
        &self,
        container_id: &str,
        host_id: &str,
        deployment_id: Option<&str>,
        is_managed: bool,
        service_name: Option<&str>,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO deployment_metadata (container_id, host_id, deployment_id, is_managed, service_name) \
             VALUES (?1,?2,?3,?4,?5) \
             ON CONFLICT(container_id) DO UPDATE SET \
             deployment_id=?3, is_managed=?4, service_name=?5",
            params![
                container_id,
                host_id,
                deployment_id,
                is_managed as i64,
                service_name
            ],
        )?;
        Ok(())
    }

    pub async fn get_deployment_metadata(
        &self,
        container_id: &str,
    ) -> DatabaseResult<Option<DeploymentMetadataRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT container_id, host_id, deployment_id, is_managed, service_name \
             FROM deployment_metadata WHERE container_id = ?1",
            [container_id],
            |row| {
                Ok(DeploymentMetadataRecord {
                    container_id: row.get(0)?,
                    host_id: row.get(1)?,
                    deployment_id: row.get(2)?,
                    is_managed: row.get::<_, i64>(3)? != 0,
                    service_name: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }
}

const DEPLOYMENT_SELECT: &str = "SELECT id, host_id, name, deployment_type, definition, \
     stack_name, status, progress_percent, current_stage, stage_percent, rollback_on_failure, \
     committed, error_message, created_at, updated_at, started_at, completed_at FROM deployments";

type RawDeployment = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    i64,
    String,
    i64,
    i64,
    i64,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn row_to_deployment_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDeployment> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
    ))
}

fn raw_to_deployment(raw: RawDeployment) -> DatabaseResult<DeploymentRecord> {
    Ok(DeploymentRecord {
        id: raw.0,
        host_id: raw.1,
        name: raw.2,
        deployment_type: DeploymentType::from_db(&raw.3)?,
        definition: raw.4,
        stack_name: raw.5,
        status: raw.6,
        progress_percent: raw.7,
        current_stage: raw.8,
        stage_percent: raw.9,
        rollback_on_failure: raw.10 != 0,
        committed: raw.11 != 0,
        error_message: raw.12,
        created_at: ts_from_db(&raw.13)?,
        updated_at: ts_from_db(&raw.14)?,
        started_at: opt_ts_from_db(raw.15)?,
        completed_at: opt_ts_from_db(raw.16)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn deployment(host_id: &str, short_id: &str, name: &str) -> DeploymentRecord {
        let now = Utc::now();
        DeploymentRecord {
            id: format!("{host_id}:{short_id}"),
            host_id: host_id.to_string(),
            name: name.to_string(),
            deployment_type: DeploymentType::Stack,
            definition: "services:\n  web:\n    image: nginx:latest\n".into(),
            stack_name: None,
            status: "pending".into(),
            progress_percent: 0,
            current_stage: String::new(),
            stage_percent: 0,
            rollback_on_failure: true,
            committed: false,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::deployment;
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_unique_name_per_host() {
        let db = seeded().await;
        db.insert_deployment(&deployment("h1", "aaa111bbb222", "web"))
            .await
            .unwrap();
        let err = db
            .insert_deployment(&deployment("h1", "ccc333ddd444", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_status_update_stamps_timestamps() {
        let db = seeded().await;
        db.insert_deployment(&deployment("h1", "aaa111bbb222", "web"))
            .await
            .unwrap();

        db.update_deployment_status("h1:aaa111bbb222", "validating", 10, "validating", 0, false, None)
            .await
            .unwrap();
        let d = db.get_deployment("h1:aaa111bbb222").await.unwrap().unwrap();
        assert!(d.started_at.is_some());
        assert!(d.completed_at.is_none());

        db.update_deployment_status("h1:aaa111bbb222", "running", 100, "running", 100, true, None)
            .await
            .unwrap();
        let d = db.get_deployment("h1:aaa111bbb222").await.unwrap().unwrap();
        let completed = d.completed_at.unwrap();
        assert!(d.started_at.unwrap() <= completed);
    }

    #[tokio::test]
    async fn test_metadata_set_null_on_deployment_delete() {
        let db = seeded().await;
        db.insert_deployment(&deployment("h1", "aaa111bbb222", "web"))
            .await
            .unwrap();
        db.upsert_deployment_metadata(
            "h1:abc123def456",
            "h1",
            Some("h1:aaa111bbb222"),
            true,
            Some("web"),
        )
        .await
        .unwrap();

        assert!(db.delete_deployment("h1:aaa111bbb222").await.unwrap());

        let meta = db
            .get_deployment_metadata("h1:abc123def456")
            .await
            .unwrap()
            .unwrap();
        assert!(meta.deployment_id.is_none());
        assert!(meta.is_managed);
    }
}
