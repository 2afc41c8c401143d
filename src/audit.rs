//! Security audit trail
//!
//! Thin wrapper over the audit_log table. Security-kind events are
//! always recorded, regardless of log level.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::database::Database;

#[derive(Clone)]
pub struct SecurityAudit {
    db: Arc<Database>,
}

impl SecurityAudit {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn log_event(
        &self,
        event_type: &str,
        severity: &str,
        user_id: Option<i64>,
        client_ip: Option<&str>,
        details: Value,
    ) {
        if let Err(e) = self
            .db
            .log_audit(event_type, severity, user_id, client_ip, &details)
            .await
        {
            // Auditing must never take a request down with it.
            warn!(event_type, "audit write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;
    use serde_json::json;

    #[tokio::test]
    async fn test_event_recorded() {
        let db = Arc::new(seeded().await);
        let audit = SecurityAudit::new(db.clone());
        audit
            .log_event(
                "session_ip_mismatch",
                "warning",
                Some(1),
                Some("10.1.2.3"),
                json!({"expected": "10.0.0.1"}),
            )
            .await;

        let entries = db.recent_audit_entries(5).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "session_ip_mismatch");
    }
}
