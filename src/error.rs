use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the daemon. Variants map to the stable `kind`
/// strings surfaced in API responses; background loops classify into the
/// same kinds before recording failures.
#[derive(Error, Debug)]
pub enum DockMonError {
    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Reachable-but-failing dependency (Docker API, registry, webhook).
    #[error("{0}")]
    Transient(String),

    /// Misconfiguration; retrying cannot help.
    #[error("{0}")]
    Permanent(String),

    /// Database constraint violation. Only the update pipeline's tag
    /// migration treats this as success; everywhere else it surfaces.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Token reuse, session IP change, attack patterns. Always audited.
    #[error("{0}")]
    Security(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Key error: {0}")]
    Key(#[from] crate::keys::KeyError),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DockMonError {
    /// Stable kind string included in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            DockMonError::Validation(_) | DockMonError::Key(_) => "validation",
            DockMonError::NotFound(_) => "not_found",
            DockMonError::Conflict(_) => "conflict",
            DockMonError::Unauthorized(_) | DockMonError::Forbidden(_) => "authz",
            DockMonError::Transient(_) | DockMonError::Docker(_) => "transient",
            DockMonError::Permanent(_) => "permanent",
            DockMonError::Integrity(_) => "integrity",
            DockMonError::Security(_) => "security",
            DockMonError::Database(_) | DockMonError::Internal(_) => "internal",
        }
    }

    /// Whether a retry with backoff could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DockMonError::Transient(_) | DockMonError::Docker(_))
    }
}

impl From<rusqlite::Error> for DockMonError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DockMonError::Integrity(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => DockMonError::Database(e),
        }
    }
}

impl IntoResponse for DockMonError {
    fn into_response(self) -> Response {
        let status = match &self {
            DockMonError::Validation(_) | DockMonError::Key(_) => StatusCode::BAD_REQUEST,
            DockMonError::NotFound(_) => StatusCode::NOT_FOUND,
            DockMonError::Conflict(_) | DockMonError::Integrity(_) => StatusCode::CONFLICT,
            DockMonError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DockMonError::Forbidden(_) | DockMonError::Security(_) => StatusCode::FORBIDDEN,
            DockMonError::Transient(_) | DockMonError::Docker(_) => StatusCode::BAD_GATEWAY,
            DockMonError::Permanent(_)
            | DockMonError::Database(_)
            | DockMonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": true,
            "kind": self.kind(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DockMonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_stable() {
        assert_eq!(DockMonError::Validation("x".into()).kind(), "validation");
        assert_eq!(DockMonError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(DockMonError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(DockMonError::Unauthorized("x".into()).kind(), "authz");
        assert_eq!(DockMonError::Transient("x".into()).kind(), "transient");
        assert_eq!(DockMonError::Permanent("x".into()).kind(), "permanent");
        assert_eq!(DockMonError::Integrity("x".into()).kind(), "integrity");
        assert_eq!(DockMonError::Security("x".into()).kind(), "security");
    }

    #[test]
    fn test_constraint_violation_maps_to_integrity() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: tag_assignments".into()),
        );
        let err: DockMonError = sqlite_err.into();
        assert!(matches!(err, DockMonError::Integrity(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DockMonError::Transient("registry timeout".into()).is_transient());
        assert!(!DockMonError::Permanent("bad tls".into()).is_transient());
    }
}
