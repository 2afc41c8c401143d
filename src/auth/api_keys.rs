//! API keys for non-browser clients
//!
//! Presented as `Authorization: Bearer dmk_...`; stored hashed.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::database::{ApiKeyRecord, Database};
use crate::error::{DockMonError, Result};

const API_KEY_PREFIX: &str = "dmk_";

/// Create an API key; returns the plaintext exactly once.
pub async fn generate_api_key(db: &Database, user_id: i64, name: &str) -> Result<(String, i64)> {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let plaintext = format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw));

    let key_hash = hex::encode(Sha256::digest(plaintext.as_bytes()));
    // Shown in listings so the user can tell keys apart.
    let display_prefix = &plaintext[..API_KEY_PREFIX.len() + 8];

    let id = db
        .insert_api_key(name, &key_hash, display_prefix, user_id)
        .await
        .map_err(|e| DockMonError::Internal(e.to_string()))?;

    Ok((plaintext, id))
}

/// Resolve a presented bearer token to its key record, if valid.
pub async fn authenticate_api_key(db: &Database, bearer: &str) -> Result<Option<ApiKeyRecord>> {
    if !bearer.starts_with(API_KEY_PREFIX) {
        return Ok(None);
    }
    let key_hash = hex::encode(Sha256::digest(bearer.as_bytes()));
    db.use_api_key(&key_hash)
        .await
        .map_err(|e| DockMonError::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_generate_and_authenticate() {
        let db = seeded().await;
        let (plaintext, _) = generate_api_key(&db, 1, "ci").await.unwrap();

        let record = authenticate_api_key(&db, &plaintext)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.user_id, 1);
        assert!(record.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_revoked_key_rejected() {
        let db = seeded().await;
        let (plaintext, id) = generate_api_key(&db, 1, "ci").await.unwrap();
        db.revoke_api_key(id).await.unwrap();

        assert!(authenticate_api_key(&db, &plaintext)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_wrong_prefix_short_circuits() {
        let db = seeded().await;
        assert!(authenticate_api_key(&db, "not-a-key")
            .await
            .unwrap()
            .is_none());
    }
}
