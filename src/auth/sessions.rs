//! Signed cookie sessions
//!
//! Session IDs are random, stored server-side, and carried in an
//! HMAC-signed cookie. Validation rebinds the session to the client IP
//! that created it; an IP change invalidates the session and is audited.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::json;
use sha2::Sha256;

use crate::audit::SecurityAudit;
use crate::database::{Database, SessionRecord};
use crate::error::{DockMonError, Result};

type HmacSha256 = Hmac<Sha256>;

/// The authenticated principal attached to a request.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    pub user_id: i64,
    pub session_id: Option<String>,
}

#[derive(Clone)]
pub struct SessionService {
    db: Arc<Database>,
    audit: SecurityAudit,
    secret: Vec<u8>,
    ttl: Duration,
    max_sessions_per_user: usize,
}

impl SessionService {
    pub fn new(
        db: Arc<Database>,
        audit: SecurityAudit,
        secret: Vec<u8>,
        ttl_hours: i64,
        max_sessions_per_user: usize,
    ) -> Self {
        Self {
            db,
            audit,
            secret,
            ttl: Duration::hours(ttl_hours),
            max_sessions_per_user,
        }
    }

    /// Create a session and return the signed cookie value.
    pub async fn create(&self, user_id: i64, client_ip: &str) -> Result<String> {
        // Enforce the per-user cap by evicting oldest sessions first.
        let existing = self
            .db
            .session_ids_for_user(user_id)
            .await
            .map_err(internal)?;
        if existing.len() >= self.max_sessions_per_user {
            let evict = existing.len() + 1 - self.max_sessions_per_user;
            for id in existing.iter().take(evict) {
                let _ = self.db.delete_session(id).await;
            }
        }

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let session_id = URL_SAFE_NO_PAD.encode(raw);

        let now = Utc::now();
        self.db
            .insert_session(&SessionRecord {
                id: session_id.clone(),
                user_id,
                client_ip: client_ip.to_string(),
                created_at: now,
                expires_at: now + self.ttl,
                last_seen_at: now,
            })
            .await
            .map_err(internal)?;

        Ok(self.sign(&session_id))
    }

    /// Validate a signed cookie for a request from `client_ip`.
    pub async fn validate(&self, cookie_value: &str, client_ip: &str) -> Result<SessionAuth> {
        let session_id = self
            .verify(cookie_value)
            .ok_or_else(|| DockMonError::Unauthorized("invalid session cookie".into()))?;

        let session = self
            .db
            .get_session(&session_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| DockMonError::Unauthorized("unknown session".into()))?;

        let now = Utc::now();
        if session.expires_at <= now {
            let _ = self.db.delete_session(&session_id).await;
            return Err(DockMonError::Unauthorized("session expired".into()));
        }

        if session.client_ip != client_ip {
            // A moved session is treated as stolen, not roaming.
            let _ = self.db.delete_session(&session_id).await;
            self.audit
                .log_event(
                    "session_ip_mismatch",
                    "warning",
                    Some(session.user_id),
                    Some(client_ip),
                    json!({"bound_ip": session.client_ip}),
                )
                .await;
            return Err(DockMonError::Security(
                "session bound to a different address".into(),
            ));
        }

        let _ = self.db.touch_session(&session_id, now).await;

        Ok(SessionAuth {
            user_id: session.user_id,
            session_id: Some(session_id),
        })
    }

    pub async fn destroy(&self, cookie_value: &str) -> Result<()> {
        if let Some(session_id) = self.verify(cookie_value) {
            self.db.delete_session(&session_id).await.map_err(internal)?;
        }
        Ok(())
    }

    pub async fn sweep_expired(&self) -> Result<usize> {
        self.db
            .sweep_expired_sessions(Utc::now())
            .await
            .map_err(internal)
    }

    fn sign(&self, session_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key size");
        mac.update(session_id.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{session_id}.{signature}")
    }

    /// Verify the cookie's signature; returns the session ID on success.
    fn verify(&self, cookie_value: &str) -> Option<String> {
        let (session_id, signature) = cookie_value.split_once('.')?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).ok()?;
        mac.update(session_id.as_bytes());
        let decoded = URL_SAFE_NO_PAD.decode(signature).ok()?;
        mac.verify_slice(&decoded).ok()?;
        Some(session_id.to_string())
    }
}

fn internal(e: crate::database::DatabaseError) -> DockMonError {
    DockMonError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    async fn service() -> (SessionService, Arc<Database>) {
        let db = Arc::new(seeded().await);
        let audit = SecurityAudit::new(db.clone());
        (
            SessionService::new(db.clone(), audit, b"test-secret".to_vec(), 24, 3),
            db,
        )
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let (service, _db) = service().await;
        let cookie = service.create(1, "10.0.0.1").await.unwrap();

        let auth = service.validate(&cookie, "10.0.0.1").await.unwrap();
        assert_eq!(auth.user_id, 1);
    }

    #[tokio::test]
    async fn test_tampered_cookie_rejected() {
        let (service, _db) = service().await;
        let cookie = service.create(1, "10.0.0.1").await.unwrap();
        let mut tampered = cookie.clone();
        tampered.push('x');

        let err = service.validate(&tampered, "10.0.0.1").await.unwrap_err();
        assert!(matches!(err, DockMonError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_ip_change_invalidates_and_audits() {
        let (service, db) = service().await;
        let cookie = service.create(1, "10.0.0.1").await.unwrap();

        let err = service.validate(&cookie, "10.9.9.9").await.unwrap_err();
        assert!(matches!(err, DockMonError::Security(_)));

        // The session is gone even from the original address.
        let err = service.validate(&cookie, "10.0.0.1").await.unwrap_err();
        assert!(matches!(err, DockMonError::Unauthorized(_)));

        let entries = db.recent_audit_entries(5).await.unwrap();
        assert_eq!(entries[0].event_type, "session_ip_mismatch");
    }

    #[tokio::test]
    async fn test_max_sessions_evicts_oldest() {
        let (service, db) = service().await;
        let first = service.create(1, "10.0.0.1").await.unwrap();
        for _ in 0..3 {
            service.create(1, "10.0.0.1").await.unwrap();
        }

        assert_eq!(db.session_ids_for_user(1).await.unwrap().len(), 3);
        assert!(service.validate(&first, "10.0.0.1").await.is_err());
    }
}
