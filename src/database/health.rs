//! HTTP health check configuration records

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{Database, DatabaseResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub container_id: String,
    pub host_id: String,
    pub enabled: bool,
    pub url: String,
    pub method: String,
    /// `"200"`, `"200,201"` or `"200-299"`.
    pub expected_status_codes: String,
    pub timeout_s: u64,
    pub interval_s: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub follow_redirects: bool,
    pub verify_ssl: bool,
    pub headers: HashMap<String, String>,
    /// `{"username": ..., "password": ...}` when basic auth is set.
    pub auth: Option<serde_json::Value>,
    pub auto_restart_on_failure: bool,
    pub max_restart_attempts: u32,
    pub restart_retry_delay_s: u64,
    pub current_status: String,
    /// "backend" runs the probe here; "agent" pushes it to the host agent.
    pub check_from: String,
}

impl Database {
    pub async fn upsert_health_check(&self, check: &HealthCheckRecord) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO health_checks (container_id, host_id, enabled, url, method, \
             expected_status_codes, timeout_s, interval_s, failure_threshold, success_threshold, \
             follow_redirects, verify_ssl, headers, auth, auto_restart_on_failure, \
             max_restart_attempts, restart_retry_delay_s, current_status, check_from) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19) \
             ON CONFLICT(container_id) DO UPDATE SET \
             enabled=?3, url=?4, method=?5, expected_status_codes=?6, timeout_s=?7, interval_s=?8, \
             failure_threshold=?9, success_threshold=?10, follow_redirects=?11, verify_ssl=?12, \
             headers=?13, auth=?14, auto_restart_on_failure=?15, max_restart_attempts=?16, \
             restart_retry_delay_s=?17, check_from=?19",
            params![
                check.container_id,
                check.host_id,
                check.enabled as i64,
                check.url,
                check.method,
                check.expected_status_codes,
                check.timeout_s as i64,
                check.interval_s as i64,
                check.failure_threshold as i64,
                check.success_threshold as i64,
                check.follow_redirects as i64,
                check.verify_ssl as i64,
                serde_json::to_string(&check.headers)?,
                check.auth.as_ref().map(|v| v.to_string()),
                check.auto_restart_on_failure as i64,
                check.max_restart_attempts as i64,
                check.restart_retry_delay_s as i64,
                check.current_status,
                check.check_from,
            ],
        )?;
        Ok(())
    }

    pub async fn get_health_check(
        &self,
        composite_key: &str,
    ) -> DatabaseResult<Option<HealthCheckRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                &format!("{HEALTH_SELECT} WHERE container_id = ?1"),
                [composite_key],
                row_to_check,
            )
            .optional()?;
        Ok(raw)
    }

    /// Enabled checks, the set the checker loads on (re)configuration.
    pub async fn list_enabled_health_checks(&self) -> DatabaseResult<Vec<HealthCheckRecord>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(&format!("{HEALTH_SELECT} WHERE enabled = 1"))?;
        let rows = stmt
            .query_map([], row_to_check)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn set_health_status(
        &self,
        composite_key: &str,
        status: &str,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE health_checks SET current_status = ?2 WHERE container_id = ?1",
            params![composite_key, status],
        )?;
        Ok(())
    }

    pub async fn delete_health_check(&self, composite_key: &str) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute(
            "DELETE FROM health_checks WHERE container_id = ?1",
            [composite_key],
        )?;
        Ok(n > 0)
    }
}

const HEALTH_SELECT: &str = "SELECT container_id, host_id, enabled, url, method, \
     expected_status_codes, timeout_s, interval_s, failure_threshold, success_threshold, \
     follow_redirects, verify_ssl, headers, auth, auto_restart_on_failure, max_restart_attempts, \
     restart_retry_delay_s, current_status, check_from FROM health_checks";

fn row_to_check(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealthCheckRecord> {
    let headers: String = row.get(12)?;
    let auth: Option<String> = row.get(13)?;
    Ok(HealthCheckRecord {
        container_id: row.get(0)?,
        host_id: row.get(1)?,
        enabled: row.get::<_, i64>(2)? != 0,
        url: row.get(3)?,
        method: row.get(4)?,
        expected_status_codes: row.get(5)?,
        timeout_s: row.get::<_, i64>(6)? as u64,
        interval_s: row.get::<_, i64>(7)? as u64,
        failure_threshold: row.get::<_, i64>(8)? as u32,
        success_threshold: row.get::<_, i64>(9)? as u32,
        follow_redirects: row.get::<_, i64>(10)? != 0,
        verify_ssl: row.get::<_, i64>(11)? != 0,
        headers: serde_json::from_str(&headers).unwrap_or_default(),
        auth: auth.and_then(|v| serde_json::from_str(&v).ok()),
        auto_restart_on_failure: row.get::<_, i64>(14)? != 0,
        max_restart_attempts: row.get::<_, i64>(15)? as u32,
        restart_retry_delay_s: row.get::<_, i64>(16)? as u64,
        current_status: row.get(17)?,
        check_from: row.get(18)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn check(host_id: &str, short_id: &str) -> HealthCheckRecord {
        HealthCheckRecord {
            container_id: format!("{host_id}:{short_id}"),
            host_id: host_id.to_string(),
            enabled: true,
            url: "http://localhost:8080/health".into(),
            method: "GET".into(),
            expected_status_codes: "200-299".into(),
            timeout_s: 5,
            interval_s: 30,
            failure_threshold: 3,
            success_threshold: 1,
            follow_redirects: true,
            verify_ssl: true,
            headers: HashMap::new(),
            auth: None,
            auto_restart_on_failure: true,
            max_restart_attempts: 3,
            restart_retry_delay_s: 60,
            current_status: "unknown".into(),
            check_from: "backend".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::check;
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_health_check_roundtrip() {
        let db = seeded().await;
        db.upsert_health_check(&check("h1", "abc123def456"))
            .await
            .unwrap();

        let loaded = db
            .get_health_check("h1:abc123def456")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.failure_threshold, 3);
        assert_eq!(loaded.current_status, "unknown");
    }

    #[tokio::test]
    async fn test_list_filters_disabled() {
        let db = seeded().await;
        let mut disabled = check("h1", "abc123def456");
        disabled.enabled = false;
        db.upsert_health_check(&disabled).await.unwrap();
        db.upsert_health_check(&check("h1", "def456abc123"))
            .await
            .unwrap();

        let enabled = db.list_enabled_health_checks().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].container_id, "h1:def456abc123");
    }

    #[tokio::test]
    async fn test_status_update_persists() {
        let db = seeded().await;
        db.upsert_health_check(&check("h1", "abc123def456"))
            .await
            .unwrap();
        db.set_health_status("h1:abc123def456", "unhealthy")
            .await
            .unwrap();
        let loaded = db
            .get_health_check("h1:abc123def456")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.current_status, "unhealthy");
    }
}
