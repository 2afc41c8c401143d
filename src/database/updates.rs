//! Container update records and update policies

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{opt_ts_from_db, ts_to_db, Database, DatabaseError, DatabaseResult};

/// Whether the update check tracks the newest digest behind the tag or
/// treats the tag as an exact pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatingTagMode {
    Latest,
    Exact,
}

impl FloatingTagMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FloatingTagMode::Latest => "latest",
            FloatingTagMode::Exact => "exact",
        }
    }

    fn from_db(s: &str) -> DatabaseResult<Self> {
        match s {
            "latest" => Ok(FloatingTagMode::Latest),
            "exact" => Ok(FloatingTagMode::Exact),
            other => Err(DatabaseError::Serialization(format!(
                "unknown floating tag mode {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUpdateRecord {
    pub container_id: String,
    pub host_id: String,
    pub current_image: String,
    pub current_digest: Option<String>,
    pub latest_image: String,
    pub latest_digest: Option<String>,
    pub update_available: bool,
    pub floating_tag_mode: FloatingTagMode,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePolicyRecord {
    pub id: i64,
    pub pattern: String,
    /// One of `critical`, `databases`, `proxies`, `monitoring`.
    pub category: String,
    pub enabled: bool,
}

impl Database {
    pub async fn upsert_container_update(
        &self,
        record: &ContainerUpdateRecord,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO container_updates (container_id, host_id, current_image, current_digest, \
             latest_image, latest_digest, update_available, floating_tag_mode, last_checked_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9) \
             ON CONFLICT(container_id) DO UPDATE SET \
             current_image=?3, current_digest=?4, latest_image=?5, latest_digest=?6, \
             update_available=?7, floating_tag_mode=?8, last_checked_at=?9",
            params![
                record.container_id,
                record.host_id,
                record.current_image,
                record.current_digest,
                record.latest_image,
                record.latest_digest,
                record.update_available as i64,
                record.floating_tag_mode.as_str(),
                record.last_checked_at.map(ts_to_db),
            ],
        )?;
        Ok(())
    }

    pub async fn get_container_update(
        &self,
        composite_key: &str,
    ) -> DatabaseResult<Option<ContainerUpdateRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                &format!("{UPDATE_SELECT} WHERE container_id = ?1"),
                [composite_key],
                row_to_update_raw,
            )
            .optional()?;
        raw.map(raw_to_update).transpose()
    }

    pub async fn list_container_updates(&self) -> DatabaseResult<Vec<ContainerUpdateRecord>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(UPDATE_SELECT)?;
        let raws = stmt
            .query_map([], row_to_update_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(raw_to_update).collect()
    }

    pub async fn count_updates_available(&self) -> DatabaseResult<usize> {
        let conn = self.conn().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM container_updates WHERE update_available = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub async fn delete_container_update(&self, composite_key: &str) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute(
            "DELETE FROM container_updates WHERE container_id = ?1",
            [composite_key],
        )?;
        Ok(n > 0)
    }

    pub async fn insert_update_policy(
        &self,
        pattern: &str,
        category: &str,
        enabled: bool,
    ) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO update_policies (pattern, category, enabled) VALUES (?1,?2,?3)",
            params![pattern, category, enabled as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn list_update_policies(&self, only_enabled: bool) -> DatabaseResult<Vec<UpdatePolicyRecord>> {
        let conn = self.conn().await;
        let sql = format!(
            "SELECT id, pattern, category, enabled FROM update_policies{} ORDER BY id",
            if only_enabled { " WHERE enabled = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UpdatePolicyRecord {
                    id: row.get(0)?,
                    pattern: row.get(1)?,
                    category: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

const UPDATE_SELECT: &str = "SELECT container_id, host_id, current_image, current_digest, \
     latest_image, latest_digest, update_available, floating_tag_mode, last_checked_at \
     FROM container_updates";

type RawUpdate = (
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    i64,
    String,
    Option<String>,
);

fn row_to_update_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawUpdate> {
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
    ))
}

fn raw_to_update(raw: RawUpdate) -> DatabaseResult<ContainerUpdateRecord> {
    Ok(ContainerUpdateRecord {
        container_id: raw.0,
        host_id: raw.1,
        current_image: raw.2,
        current_digest: raw.3,
        latest_image: raw.4,
        latest_digest: raw.5,
        update_available: raw.6 != 0,
        floating_tag_mode: FloatingTagMode::from_db(&raw.7)?,
        last_checked_at: opt_ts_from_db(raw.8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    fn record(key: &str) -> ContainerUpdateRecord {
        ContainerUpdateRecord {
            container_id: key.to_string(),
            host_id: "h1".into(),
            current_image: "nginx:1.25".into(),
            current_digest: Some("sha256:aaa".into()),
            latest_image: "nginx:1.25".into(),
            latest_digest: Some("sha256:bbb".into()),
            update_available: true,
            floating_tag_mode: FloatingTagMode::Latest,
            last_checked_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_update_record_roundtrip() {
        let db = seeded().await;
        db.upsert_container_update(&record("h1:abc123def456"))
            .await
            .unwrap();

        let loaded = db
            .get_container_update("h1:abc123def456")
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.update_available);
        assert_eq!(loaded.floating_tag_mode, FloatingTagMode::Latest);
        assert_eq!(db.count_updates_available().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_policies_filter_enabled() {
        let db = seeded().await;
        db.insert_update_policy("postgres*", "databases", true)
            .await
            .unwrap();
        db.insert_update_policy("redis*", "databases", false)
            .await
            .unwrap();

        assert_eq!(db.list_update_policies(true).await.unwrap().len(), 1);
        assert_eq!(db.list_update_policies(false).await.unwrap().len(), 2);
    }
}
