//! Container ID normalization and composite key handling
//!
//! Every persisted reference to a container uses the composite key
//! `"{host_id}:{short_container_id}"` so that clones of a host (same
//! container IDs, different host) never collide in the database.

use thiserror::Error;

/// Length of a Docker short container ID.
pub const SHORT_ID_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("host id must not be empty")]
    EmptyHostId,

    #[error("container id must be exactly {SHORT_ID_LEN} characters, got {0}")]
    BadContainerIdLength(usize),

    #[error("malformed composite key: {0}")]
    Malformed(String),
}

/// Normalize a container ID to its 12-character short form.
///
/// Accepts both the 64-char full ID and the 12-char short ID. Inputs
/// shorter than 12 characters pass through unchanged so the caller can
/// decide how to fail; this function never errors.
pub fn normalize_container_id(id: &str) -> &str {
    if id.len() > SHORT_ID_LEN {
        &id[..SHORT_ID_LEN]
    } else {
        id
    }
}

/// Build the composite key `"{host_id}:{container_id}"`.
///
/// Strict by contract: the host ID must be non-empty and the container ID
/// must already be in short form. Callers normalize at the API boundary.
pub fn make_composite_key(host_id: &str, container_id: &str) -> Result<String, KeyError> {
    if host_id.is_empty() {
        return Err(KeyError::EmptyHostId);
    }
    if container_id.len() != SHORT_ID_LEN {
        return Err(KeyError::BadContainerIdLength(container_id.len()));
    }
    Ok(format!("{}:{}", host_id, container_id))
}

/// Split a composite key back into `(host_id, short_container_id)`.
///
/// The host ID may itself contain `:` (UUIDs never do, but imported hosts
/// have used URLs as IDs), so the split is on the *last* separator.
pub fn parse_composite_key(key: &str) -> Result<(&str, &str), KeyError> {
    let (host_id, container_id) = key
        .rsplit_once(':')
        .ok_or_else(|| KeyError::Malformed(key.to_string()))?;
    if host_id.is_empty() {
        return Err(KeyError::EmptyHostId);
    }
    if container_id.len() != SHORT_ID_LEN {
        return Err(KeyError::BadContainerIdLength(container_id.len()));
    }
    Ok((host_id, container_id))
}

/// Deployment IDs follow the same composite scheme as container keys.
pub fn make_deployment_key(host_id: &str, deployment_id: &str) -> Result<String, KeyError> {
    make_composite_key(host_id, normalize_container_id(deployment_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_short_id_unchanged() {
        assert_eq!(normalize_container_id("abc123def456"), "abc123def456");
    }

    #[test]
    fn test_normalize_full_id_truncated() {
        let full = "67c5d214133846c397f4d9947f28cb513377db1fcc74633efd0d13793c45d4f2";
        assert_eq!(normalize_container_id(full), "67c5d2141338");
    }

    #[test]
    fn test_normalize_shorter_than_12_passthrough() {
        assert_eq!(normalize_container_id("abc123"), "abc123");
        assert_eq!(normalize_container_id(""), "");
    }

    #[test]
    fn test_normalize_idempotent() {
        let full = "abc123def456".repeat(5);
        let once = normalize_container_id(&full);
        assert_eq!(normalize_container_id(once), once);
    }

    #[test]
    fn test_make_composite_key() {
        assert_eq!(
            make_composite_key("h1", "abc123def456").unwrap(),
            "h1:abc123def456"
        );
    }

    #[test]
    fn test_make_composite_key_rejects_empty_host() {
        assert_eq!(
            make_composite_key("", "abc123def456"),
            Err(KeyError::EmptyHostId)
        );
    }

    #[test]
    fn test_make_composite_key_rejects_bad_length() {
        assert_eq!(
            make_composite_key("h1", "abc123"),
            Err(KeyError::BadContainerIdLength(6))
        );
        let full = "67c5d214133846c397f4d9947f28cb513377db1fcc74633efd0d13793c45d4f2";
        assert_eq!(
            make_composite_key("h1", full),
            Err(KeyError::BadContainerIdLength(64))
        );
    }

    #[test]
    fn test_parse_composite_key_roundtrip() {
        let full = "67c5d214133846c397f4d9947f28cb513377db1fcc74633efd0d13793c45d4f2";
        let key = make_composite_key("host-a", normalize_container_id(full)).unwrap();
        let (host, short) = parse_composite_key(&key).unwrap();
        assert_eq!(host, "host-a");
        assert_eq!(short, &full[..12]);
    }

    #[test]
    fn test_parse_composite_key_host_with_colon() {
        let key = "tcp://10.0.0.5:2376:abc123def456";
        let (host, short) = parse_composite_key(key).unwrap();
        assert_eq!(host, "tcp://10.0.0.5:2376");
        assert_eq!(short, "abc123def456");
    }

    #[test]
    fn test_parse_composite_key_malformed() {
        assert!(matches!(
            parse_composite_key("no-separator"),
            Err(KeyError::Malformed(_))
        ));
        assert!(matches!(
            parse_composite_key(":abc123def456"),
            Err(KeyError::EmptyHostId)
        ));
        assert!(matches!(
            parse_composite_key("h1:short"),
            Err(KeyError::BadContainerIdLength(5))
        ));
    }

    #[test]
    fn test_cross_host_collision_keys_distinct() {
        let k1 = make_composite_key("h1", "abc123def456").unwrap();
        let k2 = make_composite_key("h2", "abc123def456").unwrap();
        assert_ne!(k1, k2);
    }
}
