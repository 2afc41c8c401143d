//! Fleet state persistence
//!
//! SQLite-backed store for hosts, container-scoped records, alert rules
//! and instances, health check configs, deployments and updates. All
//! container-scoped tables key on the composite `"{host_id}:{short_id}"`
//! form and hang off `hosts` with `ON DELETE CASCADE`, so removing a host
//! removes its dependents in one statement.

mod alerts;
mod auth;
mod channels;
mod containers;
mod deployments;
mod health;
mod hosts;
mod logs;
mod stacks;
mod tags;
mod updates;

pub use alerts::{AlertInstance, AlertRuleRecord, AlertState, BlackoutWindow, ChannelRef};
pub use auth::{ActionTokenRecord, ApiKeyRecord, SessionRecord, UserRecord};
pub use channels::ChannelRecord;
pub use containers::{AutoRestartConfig, DesiredState, DesiredStateRecord};
pub use deployments::{DeploymentMetadataRecord, DeploymentRecord, DeploymentType};
pub use health::HealthCheckRecord;
pub use hosts::{CleanupCounts, ConnectionType, HostRecord, MigrationOutcome, TlsMaterial};
pub use logs::{AuditEntry, EventLogEntry};
pub use stacks::{StackRecord, TemplateRecord};
pub use tags::{TagAssignment, TagRecord};
pub use updates::{ContainerUpdateRecord, FloatingTagMode, UpdatePolicyRecord};

#[cfg(test)]
pub(crate) use alerts::test_support as alert_fixtures;
#[cfg(test)]
pub(crate) use deployments::test_support as deployment_fixtures;
#[cfg(test)]
pub(crate) use health::test_support as health_fixtures;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Result as SqliteResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation, kept distinct so the update pipeline can
    /// apply its narrow success-fallback during tag migration.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DatabaseError::Integrity(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => DatabaseError::Sqlite(e),
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Serialize a UTC timestamp for storage. Always carries the trailing `Z`.
pub(crate) fn ts_to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_db(raw: &str) -> DatabaseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn opt_ts_from_db(raw: Option<String>) -> DatabaseResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(ts_from_db).transpose()
}

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL for concurrent readers; foreign_keys for the CASCADE /
        // SET NULL actions the schema depends on.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        Self::init_tables(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) async fn conn(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Initialize database tables. Idempotent: re-running on an existing
    /// database is a no-op, so upgrades only ever add.
    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                connection_type TEXT NOT NULL CHECK (connection_type IN ('local','remote','agent')),
                tls_ca TEXT,
                tls_cert TEXT,
                tls_key TEXT,
                engine_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                replaced_by_host_id TEXT,
                system_info TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auto_restart_configs (
                container_id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                container_name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS desired_states (
                container_id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                container_name TEXT NOT NULL,
                desired TEXT NOT NULL CHECK (desired IN ('should_run','on_demand','unspecified'))
            );

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                color TEXT NOT NULL DEFAULT '#6b7280',
                kind TEXT NOT NULL DEFAULT 'user' CHECK (kind IN ('user','system'))
            );

            CREATE TABLE IF NOT EXISTS tag_assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                subject_type TEXT NOT NULL CHECK (subject_type IN ('container','host')),
                subject_id TEXT NOT NULL,
                order_index INTEGER NOT NULL DEFAULT 0,
                provenance TEXT NOT NULL DEFAULT 'user',
                UNIQUE (tag_id, subject_type, subject_id)
            );

            CREATE TABLE IF NOT EXISTS notification_channels (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                config TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS alert_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                scope_type TEXT NOT NULL CHECK (scope_type IN ('host','container','tag','global')),
                scope_id TEXT,
                operator TEXT,
                threshold REAL,
                window_secs INTEGER,
                severity TEXT NOT NULL DEFAULT 'warning',
                notify_channels TEXT NOT NULL DEFAULT '[]',
                cooldown_minutes INTEGER NOT NULL DEFAULT 0,
                blackout_windows TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                trigger_events TEXT,
                trigger_states TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                dedup_key TEXT NOT NULL,
                rule_id TEXT NOT NULL REFERENCES alert_rules(id) ON DELETE CASCADE,
                scope_type TEXT NOT NULL,
                scope_id TEXT,
                entity_key TEXT,
                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'open' CHECK (state IN ('open','snoozed','resolved')),
                message TEXT NOT NULL DEFAULT '',
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                resolved_at TEXT,
                suppressed_by_blackout INTEGER NOT NULL DEFAULT 0,
                notified_at TEXT,
                last_notification_attempt_at TEXT,
                next_retry_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            );

            -- At most one open alert per dedup key.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_open_dedup
                ON alerts(dedup_key) WHERE state = 'open';

            CREATE TABLE IF NOT EXISTS health_checks (
                container_id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                enabled INTEGER NOT NULL DEFAULT 1,
                url TEXT NOT NULL,
                method TEXT NOT NULL DEFAULT 'GET',
                expected_status_codes TEXT NOT NULL DEFAULT '200-299',
                timeout_s INTEGER NOT NULL DEFAULT 10,
                interval_s INTEGER NOT NULL DEFAULT 30,
                failure_threshold INTEGER NOT NULL DEFAULT 3,
                success_threshold INTEGER NOT NULL DEFAULT 1,
                follow_redirects INTEGER NOT NULL DEFAULT 1,
                verify_ssl INTEGER NOT NULL DEFAULT 1,
                headers TEXT,
                auth TEXT,
                auto_restart_on_failure INTEGER NOT NULL DEFAULT 0,
                max_restart_attempts INTEGER NOT NULL DEFAULT 3,
                restart_retry_delay_s INTEGER NOT NULL DEFAULT 60,
                current_status TEXT NOT NULL DEFAULT 'unknown' CHECK (current_status IN ('healthy','unhealthy','unknown')),
                check_from TEXT NOT NULL DEFAULT 'backend' CHECK (check_from IN ('backend','agent'))
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                deployment_type TEXT NOT NULL CHECK (deployment_type IN ('container','stack')),
                definition TEXT NOT NULL,
                stack_name TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                progress_percent INTEGER NOT NULL DEFAULT 0,
                current_stage TEXT NOT NULL DEFAULT '',
                stage_percent INTEGER NOT NULL DEFAULT 0,
                rollback_on_failure INTEGER NOT NULL DEFAULT 1,
                committed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                UNIQUE (host_id, name)
            );

            CREATE TABLE IF NOT EXISTS deployment_metadata (
                container_id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                deployment_id TEXT REFERENCES deployments(id) ON DELETE SET NULL,
                is_managed INTEGER NOT NULL DEFAULT 1,
                service_name TEXT
            );

            CREATE TABLE IF NOT EXISTS container_updates (
                container_id TEXT PRIMARY KEY,
                host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                current_image TEXT NOT NULL,
                current_digest TEXT,
                latest_image TEXT NOT NULL,
                latest_digest TEXT,
                update_available INTEGER NOT NULL DEFAULT 0,
                floating_tag_mode TEXT NOT NULL DEFAULT 'latest' CHECK (floating_tag_mode IN ('latest','exact')),
                last_checked_at TEXT
            );

            CREATE TABLE IF NOT EXISTS update_policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL,
                category TEXT NOT NULL CHECK (category IN ('critical','databases','proxies','monitoring')),
                enabled INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_prefs (
                user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                prefs TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                client_ip TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                key_prefix TEXT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                last_used_at TEXT,
                revoked_at TEXT
            );

            CREATE TABLE IF NOT EXISTS action_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_hash TEXT NOT NULL UNIQUE,
                token_prefix TEXT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                action_type TEXT NOT NULL,
                action_params TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used_at TEXT,
                used_from_ip TEXT,
                revoked_at TEXT
            );

            CREATE TABLE IF NOT EXISTS registration_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_hash TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                used_at TEXT
            );

            CREATE TABLE IF NOT EXISTS stacks (
                name TEXT PRIMARY KEY,
                compose_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL,
                is_builtin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_id TEXT,
                container_id TEXT,
                event_type TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL DEFAULT 'info',
                user_id INTEGER,
                client_ip TEXT,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_rule ON alerts(rule_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_retry ON alerts(next_retry_at)
                WHERE next_retry_at IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_assignments_subject
                ON tag_assignments(subject_type, subject_id);
            CREATE INDEX IF NOT EXISTS idx_metadata_deployment
                ON deployment_metadata(deployment_id);
            CREATE INDEX IF NOT EXISTS idx_event_log_host ON event_log(host_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_action_tokens_user ON action_tokens(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            "#,
        )?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A database seeded with one user and one active remote host, the
    /// baseline most store tests need.
    pub async fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("admin", "x", true).await.unwrap();
        db.insert_host(&HostRecord::remote("h1", "host-one", "tcp://10.0.0.1:2376"))
            .await
            .unwrap();
        db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_idempotent_schema() {
        let db = Database::open_in_memory().unwrap();
        // Re-running the DDL must not fail on an initialized database.
        let conn = db.conn().await;
        Database::init_tables(&conn).unwrap();
    }

    #[test]
    fn test_timestamp_roundtrip_keeps_z_suffix() {
        let now = Utc::now();
        let raw = ts_to_db(now);
        assert!(raw.ends_with('Z'));
        let parsed = ts_from_db(&raw).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
