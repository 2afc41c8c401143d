//! Users, sessions, API keys, action tokens and registration tokens

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{opt_ts_from_db, ts_from_db, ts_to_db, Database, DatabaseError, DatabaseResult};

/// Preference blobs above this size are rejected with 413 upstream.
pub const MAX_PREFS_BYTES: usize = 100 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: i64,
    pub client_ip: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub name: String,
    pub key_prefix: String,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionTokenRecord {
    pub id: i64,
    pub token_hash: String,
    pub token_prefix: String,
    pub user_id: i64,
    pub action_type: String,
    pub action_params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_from_ip: Option<String>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Database {
    pub async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO users (username, password_hash, is_admin, created_at) VALUES (?1,?2,?3,?4)",
            params![username, password_hash, is_admin as i64, ts_to_db(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_user(&self, id: i64) -> DatabaseResult<Option<UserRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT id, username, password_hash, is_admin, created_at FROM users WHERE id = ?1",
            [id],
            row_to_user,
        )
        .optional()?
        .map(raw_to_user)
        .transpose()
    }

    pub async fn get_user_by_name(&self, username: &str) -> DatabaseResult<Option<UserRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT id, username, password_hash, is_admin, created_at FROM users WHERE username = ?1",
            [username],
            row_to_user,
        )
        .optional()?
        .map(raw_to_user)
        .transpose()
    }

    pub async fn set_user_prefs(&self, user_id: i64, prefs_json: &str) -> DatabaseResult<()> {
        if prefs_json.len() > MAX_PREFS_BYTES {
            return Err(DatabaseError::Other(format!(
                "preferences exceed {MAX_PREFS_BYTES} bytes"
            )));
        }
        // Must be a JSON document, not arbitrary bytes.
        let _: serde_json::Value = serde_json::from_str(prefs_json)?;
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO user_prefs (user_id, prefs, updated_at) VALUES (?1,?2,?3) \
             ON CONFLICT(user_id) DO UPDATE SET prefs=?2, updated_at=?3",
            params![user_id, prefs_json, ts_to_db(Utc::now())],
        )?;
        Ok(())
    }

    pub async fn get_user_prefs(&self, user_id: i64) -> DatabaseResult<Option<String>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT prefs FROM user_prefs WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    // --- sessions ---

    pub async fn insert_session(&self, session: &SessionRecord) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO sessions (id, user_id, client_ip, created_at, expires_at, last_seen_at) \
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                session.id,
                session.user_id,
                session.client_ip,
                ts_to_db(session.created_at),
                ts_to_db(session.expires_at),
                ts_to_db(session.last_seen_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> DatabaseResult<Option<SessionRecord>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT id, user_id, client_ip, created_at, expires_at, last_seen_at \
             FROM sessions WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
        .map(|raw| {
            Ok(SessionRecord {
                id: raw.0,
                user_id: raw.1,
                client_ip: raw.2,
                created_at: ts_from_db(&raw.3)?,
                expires_at: ts_from_db(&raw.4)?,
                last_seen_at: ts_from_db(&raw.5)?,
            })
        })
        .transpose()
    }

    pub async fn touch_session(&self, id: &str, seen: DateTime<Utc>) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE sessions SET last_seen_at = ?2 WHERE id = ?1",
            params![id, ts_to_db(seen)],
        )?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Oldest-first session list for a user; used to enforce the
    /// max-active-sessions cap.
    pub async fn session_ids_for_user(&self, user_id: i64) -> DatabaseResult<Vec<String>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT id FROM sessions WHERE user_id = ?1 ORDER BY created_at ASC",
        )?;
        let ids = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub async fn sweep_expired_sessions(&self, now: DateTime<Utc>) -> DatabaseResult<usize> {
        let conn = self.conn().await;
        let n = conn.execute(
            "DELETE FROM sessions WHERE expires_at < ?1",
            [ts_to_db(now)],
        )?;
        Ok(n)
    }

    // --- API keys ---

    pub async fn insert_api_key(
        &self,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        user_id: i64,
    ) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO api_keys (name, key_hash, key_prefix, user_id, created_at) \
             VALUES (?1,?2,?3,?4,?5)",
            params![name, key_hash, key_prefix, user_id, ts_to_db(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up a non-revoked API key by hash and stamp its last use.
    pub async fn use_api_key(&self, key_hash: &str) -> DatabaseResult<Option<ApiKeyRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                "SELECT id, name, key_prefix, user_id, created_at, last_used_at, revoked_at \
                 FROM api_keys WHERE key_hash = ?1 AND revoked_at IS NULL",
                [key_hash],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some(raw) = raw else { return Ok(None) };

        conn.execute(
            "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
            params![raw.0, ts_to_db(Utc::now())],
        )?;

        Ok(Some(ApiKeyRecord {
            id: raw.0,
            name: raw.1,
            key_prefix: raw.2,
            user_id: raw.3,
            created_at: ts_from_db(&raw.4)?,
            last_used_at: opt_ts_from_db(raw.5)?,
            revoked_at: opt_ts_from_db(raw.6)?,
        }))
    }

    pub async fn revoke_api_key(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute(
            "UPDATE api_keys SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
            params![id, ts_to_db(Utc::now())],
        )?;
        Ok(n > 0)
    }

    // --- action tokens ---

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_action_token(
        &self,
        token_hash: &str,
        token_prefix: &str,
        user_id: i64,
        action_type: &str,
        action_params: &serde_json::Value,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO action_tokens (token_hash, token_prefix, user_id, action_type, \
             action_params, created_at, expires_at) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                token_hash,
                token_prefix,
                user_id,
                action_type,
                action_params.to_string(),
                ts_to_db(created_at),
                ts_to_db(expires_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_action_token_by_hash(
        &self,
        token_hash: &str,
    ) -> DatabaseResult<Option<ActionTokenRecord>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                "SELECT id, token_hash, token_prefix, user_id, action_type, action_params, \
                 created_at, expires_at, used_at, used_from_ip, revoked_at \
                 FROM action_tokens WHERE token_hash = ?1",
                [token_hash],
                row_to_action_token,
            )
            .optional()?;
        raw.map(raw_to_action_token).transpose()
    }

    pub async fn count_active_action_tokens(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> DatabaseResult<usize> {
        let conn = self.conn().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_tokens WHERE user_id = ?1 AND used_at IS NULL \
             AND revoked_at IS NULL AND expires_at > ?2",
            params![user_id, ts_to_db(now)],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Revoke the user's oldest still-active tokens. Returns how many
    /// were revoked.
    pub async fn revoke_oldest_action_tokens(
        &self,
        user_id: i64,
        limit: usize,
    ) -> DatabaseResult<usize> {
        let conn = self.conn().await;
        let n = conn.execute(
            "UPDATE action_tokens SET revoked_at = ?3 WHERE id IN (\
                 SELECT id FROM action_tokens WHERE user_id = ?1 AND used_at IS NULL \
                 AND revoked_at IS NULL ORDER BY created_at ASC LIMIT ?2)",
            params![user_id, limit as i64, ts_to_db(Utc::now())],
        )?;
        Ok(n)
    }

    pub async fn mark_action_token_used(
        &self,
        id: i64,
        used_at: DateTime<Utc>,
        client_ip: &str,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE action_tokens SET used_at = ?2, used_from_ip = ?3 WHERE id = ?1",
            params![id, ts_to_db(used_at), client_ip],
        )?;
        Ok(())
    }

    /// Maintenance sweep: expired unused and revoked tokens go
    /// immediately, used tokens are kept seven days for the audit trail.
    pub async fn cleanup_action_tokens(&self, now: DateTime<Utc>) -> DatabaseResult<usize> {
        let seven_days_ago = now - Duration::days(7);
        let conn = self.conn().await;
        let expired = conn.execute(
            "DELETE FROM action_tokens WHERE expires_at < ?1 AND used_at IS NULL",
            [ts_to_db(now)],
        )?;
        let old_used = conn.execute(
            "DELETE FROM action_tokens WHERE used_at IS NOT NULL AND used_at < ?1",
            [ts_to_db(seven_days_ago)],
        )?;
        let revoked = conn.execute("DELETE FROM action_tokens WHERE revoked_at IS NOT NULL", [])?;
        Ok(expired + old_used + revoked)
    }

    // --- registration tokens ---

    pub async fn insert_registration_token(
        &self,
        token_hash: &str,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> DatabaseResult<i64> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO registration_tokens (token_hash, name, created_at, expires_at) \
             VALUES (?1,?2,?3,?4)",
            params![
                token_hash,
                name,
                ts_to_db(Utc::now()),
                expires_at.map(ts_to_db)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// A registration token is valid when it exists, is unexpired and
    /// unused. Marks it used on success.
    pub async fn consume_registration_token(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute(
            "UPDATE registration_tokens SET used_at = ?2 WHERE token_hash = ?1 \
             AND used_at IS NULL AND (expires_at IS NULL OR expires_at > ?2)",
            params![token_hash, ts_to_db(now)],
        )?;
        Ok(n > 0)
    }
}

type RawActionToken = (
    i64,
    String,
    String,
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn row_to_action_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawActionToken> {
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
    ))
}

fn raw_to_action_token(raw: RawActionToken) -> DatabaseResult<ActionTokenRecord> {
    Ok(ActionTokenRecord {
        id: raw.0,
        token_hash: raw.1,
        token_prefix: raw.2,
        user_id: raw.3,
        action_type: raw.4,
        action_params: serde_json::from_str(&raw.5)?,
        created_at: ts_from_db(&raw.6)?,
        expires_at: ts_from_db(&raw.7)?,
        used_at: opt_ts_from_db(raw.8)?,
        used_from_ip: raw.9,
        revoked_at: opt_ts_from_db(raw.10)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn raw_to_user(raw: (i64, String, String, i64, String)) -> DatabaseResult<UserRecord> {
    Ok(UserRecord {
        id: raw.0,
        username: raw.1,
        password_hash: raw.2,
        is_admin: raw.3 != 0,
        created_at: ts_from_db(&raw.4)?,
    })
}
