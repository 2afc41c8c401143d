//! One-time action tokens for notification links
//!
//! A notification can carry a URL that triggers a parameterized action
//! (update this container, restart that one) without a logged-in
//! session. Tokens are random, stored hashed, time-bound, single-use and
//! capped per user.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::audit::SecurityAudit;
use crate::database::Database;
use crate::error::{DockMonError, Result};

pub const ACTION_TOKEN_PREFIX: &str = "dockmon_action_";
const TTL_HOURS: i64 = 24;
/// Active-token cap per user; prevents token table bloat.
const MAX_PER_USER: usize = 100;
/// How many of the oldest tokens to revoke when the cap is hit.
const EVICT_BATCH: usize = 10;

/// Outcome of validating a presented token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValidation {
    Valid {
        token_id: i64,
        user_id: i64,
        username: String,
        action_type: String,
        action_params: serde_json::Value,
        hours_remaining: f64,
    },
    Invalid {
        /// One of `invalid_format`, `not_found`, `revoked`,
        /// `already_used`, `expired`, `user_deleted`.
        reason: &'static str,
    },
}

/// Generate a token; returns `(plaintext, token_id)`. The plaintext is
/// never stored.
pub async fn generate_action_token(
    db: &Database,
    user_id: i64,
    action_type: &str,
    action_params: serde_json::Value,
    ttl_hours: Option<i64>,
) -> Result<(String, i64)> {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let plaintext = format!("{ACTION_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw));

    let token_hash = hex::encode(Sha256::digest(plaintext.as_bytes()));
    let token_prefix = token_hash[..12].to_string();

    let now = Utc::now();
    let expires_at = now + Duration::hours(ttl_hours.unwrap_or(TTL_HOURS));

    let active = db
        .count_active_action_tokens(user_id, now)
        .await
        .map_err(internal)?;
    if active >= MAX_PER_USER {
        let revoked = db
            .revoke_oldest_action_tokens(user_id, EVICT_BATCH)
            .await
            .map_err(internal)?;
        info!(user_id, revoked, "revoked old action tokens (cap reached)");
    }

    let token_id = db
        .insert_action_token(
            &token_hash,
            &token_prefix,
            user_id,
            action_type,
            &action_params,
            now,
            expires_at,
        )
        .await
        .map_err(internal)?;

    Ok((plaintext, token_id))
}

/// Validate a presented token. With `mark_used` (the execute endpoint),
/// success consumes the token and records the caller's address. Every
/// rejection is logged as a security event with its distinct reason.
pub async fn validate_action_token(
    db: &Database,
    audit: &SecurityAudit,
    token: &str,
    client_ip: &str,
    mark_used: bool,
) -> Result<TokenValidation> {
    if token.is_empty() || !token.starts_with(ACTION_TOKEN_PREFIX) {
        warn!(client_ip, "action token with bad format");
        audit
            .log_event(
                "action_token_invalid_format",
                "warning",
                None,
                Some(client_ip),
                json!({"reason": "missing prefix"}),
            )
            .await;
        return Ok(TokenValidation::Invalid {
            reason: "invalid_format",
        });
    }

    let token_hash = hex::encode(Sha256::digest(token.as_bytes()));

    let Some(record) = db
        .get_action_token_by_hash(&token_hash)
        .await
        .map_err(internal)?
    else {
        warn!(client_ip, prefix = &token_hash[..12], "action token not found");
        audit
            .log_event(
                "action_token_not_found",
                "warning",
                None,
                Some(client_ip),
                json!({"token_hash_prefix": &token_hash[..12]}),
            )
            .await;
        return Ok(TokenValidation::Invalid { reason: "not_found" });
    };

    if record.revoked_at.is_some() {
        audit
            .log_event(
                "action_token_revoked_used",
                "warning",
                Some(record.user_id),
                Some(client_ip),
                json!({"token_prefix": record.token_prefix}),
            )
            .await;
        return Ok(TokenValidation::Invalid { reason: "revoked" });
    }

    if let Some(used_at) = record.used_at {
        audit
            .log_event(
                "action_token_replay_attempt",
                "warning",
                Some(record.user_id),
                Some(client_ip),
                json!({
                    "token_prefix": record.token_prefix,
                    "original_use_ip": record.used_from_ip,
                    "used_at": used_at.to_rfc3339(),
                }),
            )
            .await;
        return Ok(TokenValidation::Invalid {
            reason: "already_used",
        });
    }

    let now = Utc::now();
    if now > record.expires_at {
        audit
            .log_event(
                "action_token_expired_used",
                "warning",
                Some(record.user_id),
                Some(client_ip),
                json!({"token_prefix": record.token_prefix}),
            )
            .await;
        return Ok(TokenValidation::Invalid { reason: "expired" });
    }

    let Some(user) = db.get_user(record.user_id).await.map_err(internal)? else {
        warn!(client_ip, "action token for deleted user");
        return Ok(TokenValidation::Invalid {
            reason: "user_deleted",
        });
    };

    if mark_used {
        db.mark_action_token_used(record.id, now, client_ip)
            .await
            .map_err(internal)?;
        audit
            .log_event(
                "action_token_used",
                "info",
                Some(record.user_id),
                Some(client_ip),
                json!({
                    "token_prefix": record.token_prefix,
                    "action_type": record.action_type,
                }),
            )
            .await;
    }

    let hours_remaining = (record.expires_at - now).num_seconds() as f64 / 3600.0;

    Ok(TokenValidation::Valid {
        token_id: record.id,
        user_id: record.user_id,
        username: user.username,
        action_type: record.action_type,
        action_params: record.action_params,
        hours_remaining: (hours_remaining * 10.0).round() / 10.0,
    })
}

fn internal(e: crate::database::DatabaseError) -> DockMonError {
    DockMonError::Internal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;
    use std::sync::Arc;

    async fn setup() -> (Arc<Database>, SecurityAudit) {
        let db = Arc::new(seeded().await);
        let audit = SecurityAudit::new(db.clone());
        (db, audit)
    }

    #[tokio::test]
    async fn test_generate_and_validate() {
        let (db, audit) = setup().await;
        let (token, _) = generate_action_token(
            &db,
            1,
            "container_update",
            json!({"host_id": "h1", "container_id": "abc123def456"}),
            None,
        )
        .await
        .unwrap();

        assert!(token.starts_with(ACTION_TOKEN_PREFIX));

        match validate_action_token(&db, &audit, &token, "10.0.0.1", false)
            .await
            .unwrap()
        {
            TokenValidation::Valid {
                action_type,
                action_params,
                ..
            } => {
                assert_eq!(action_type, "container_update");
                assert_eq!(action_params["host_id"], "h1");
            }
            other => panic!("expected valid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_use() {
        let (db, audit) = setup().await;
        let (token, _) =
            generate_action_token(&db, 1, "container_restart", json!({}), None)
                .await
                .unwrap();

        // Execute consumes it.
        assert!(matches!(
            validate_action_token(&db, &audit, &token, "10.0.0.1", true)
                .await
                .unwrap(),
            TokenValidation::Valid { .. }
        ));

        // Replay is rejected and audited.
        assert_eq!(
            validate_action_token(&db, &audit, &token, "10.0.0.2", true)
                .await
                .unwrap(),
            TokenValidation::Invalid {
                reason: "already_used"
            }
        );

        let entries = db.recent_audit_entries(5).await.unwrap();
        assert!(entries
            .iter()
            .any(|e| e.event_type == "action_token_replay_attempt"));
    }

    #[tokio::test]
    async fn test_distinct_rejection_reasons() {
        let (db, audit) = setup().await;

        assert_eq!(
            validate_action_token(&db, &audit, "garbage", "ip", false)
                .await
                .unwrap(),
            TokenValidation::Invalid {
                reason: "invalid_format"
            }
        );

        assert_eq!(
            validate_action_token(
                &db,
                &audit,
                &format!("{ACTION_TOKEN_PREFIX}unknown"),
                "ip",
                false
            )
            .await
            .unwrap(),
            TokenValidation::Invalid { reason: "not_found" }
        );

        // Expired.
        let (token, id) =
            generate_action_token(&db, 1, "t", json!({}), Some(-1)).await.unwrap();
        assert_eq!(
            validate_action_token(&db, &audit, &token, "ip", false)
                .await
                .unwrap(),
            TokenValidation::Invalid { reason: "expired" }
        );
        let _ = id;
    }

    #[tokio::test]
    async fn test_cap_revokes_oldest() {
        let (db, _audit) = setup().await;
        for _ in 0..100 {
            generate_action_token(&db, 1, "t", json!({}), None)
                .await
                .unwrap();
        }
        // The 101st generation triggers the oldest-10 revocation.
        generate_action_token(&db, 1, "t", json!({}), None)
            .await
            .unwrap();

        let active = db
            .count_active_action_tokens(1, Utc::now())
            .await
            .unwrap();
        assert_eq!(active, 91);
    }
}
