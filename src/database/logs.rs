//! Event and audit log records
//!
//! Both tables are append-only and survive host deletion; the cleanup
//! path never touches them.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{ts_from_db, ts_to_db, Database, DatabaseResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub host_id: Option<String>,
    pub container_id: Option<String>,
    pub event_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub severity: String,
    pub user_id: Option<i64>,
    pub client_ip: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Database {
    pub async fn log_event(
        &self,
        host_id: Option<&str>,
        container_id: Option<&str>,
        event_type: &str,
        message: &str,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO event_log (host_id, container_id, event_type, message, created_at) \
             VALUES (?1,?2,?3,?4,?5)",
            params![host_id, container_id, event_type, message, ts_to_db(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn recent_events(&self, limit: usize) -> DatabaseResult<Vec<EventLogEntry>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT id, host_id, container_id, event_type, message, created_at \
             FROM event_log ORDER BY id DESC LIMIT ?1",
        )?;
        let raws = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter()
            .map(|raw| {
                Ok(EventLogEntry {
                    id: raw.0,
                    host_id: raw.1,
                    container_id: raw.2,
                    event_type: raw.3,
                    message: raw.4,
                    created_at: ts_from_db(&raw.5)?,
                })
            })
            .collect()
    }

    pub async fn log_audit(
        &self,
        event_type: &str,
        severity: &str,
        user_id: Option<i64>,
        client_ip: Option<&str>,
        details: &serde_json::Value,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO audit_log (event_type, severity, user_id, client_ip, details, created_at) \
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                event_type,
                severity,
                user_id,
                client_ip,
                details.to_string(),
                ts_to_db(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub async fn recent_audit_entries(&self, limit: usize) -> DatabaseResult<Vec<AuditEntry>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, severity, user_id, client_ip, details, created_at \
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let raws = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter()
            .map(|raw| {
                Ok(AuditEntry {
                    id: raw.0,
                    event_type: raw.1,
                    severity: raw.2,
                    user_id: raw.3,
                    client_ip: raw.4,
                    details: serde_json::from_str(&raw.5).unwrap_or(serde_json::Value::Null),
                    created_at: ts_from_db(&raw.6)?,
                })
            })
            .collect()
    }
}
