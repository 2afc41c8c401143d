//! Update policy guardrails and batch pre-flight validation

use serde::Serialize;

use crate::database::UpdatePolicyRecord;

/// Simple `*` wildcard matcher for policy patterns.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], text)
                    || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            (Some(p), Some(t)) if p == t => inner(&pattern[1..], &text[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// One container considered for update.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub composite_key: String,
    pub image: String,
    /// The DockMon controller itself; blocked from self-destructive
    /// updates through the generic path. Derived server-side from the
    /// image, never taken from a request body.
    pub is_self: bool,
}

impl UpdateCandidate {
    pub fn new(composite_key: String, image: String) -> Self {
        let is_self = is_self_image(&image);
        Self {
            composite_key,
            image,
            is_self,
        }
    }
}

/// Does this image name the DockMon controller or agent?
///
/// Compared on the repository's final path segment with the registry
/// and tag stripped, so `ghcr.io/darthnorse/dockmon:2.1` and plain
/// `dockmon` both match while `dockmon-exporter` does not.
pub fn is_self_image(image: &str) -> bool {
    let repo = image
        .rsplit_once(':')
        .filter(|(_, tag)| !tag.contains('/'))
        .map(|(repo, _)| repo)
        .unwrap_or(image);
    let repo = repo.split_once('@').map(|(repo, _)| repo).unwrap_or(repo);
    let name = repo.rsplit('/').next().unwrap_or(repo);
    matches!(name, "dockmon" | "dockmon-agent")
}

#[derive(Debug, Clone, Serialize)]
pub struct WarnedUpdate {
    pub container_id: String,
    pub image: String,
    pub matched_pattern: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedUpdate {
    pub container_id: String,
    pub image: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub allowed: usize,
    pub warned: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchValidation {
    pub allowed: Vec<String>,
    pub warned: Vec<WarnedUpdate>,
    pub blocked: Vec<BlockedUpdate>,
    pub summary: BatchSummary,
}

/// Categorize candidates against enabled policies.
///
/// - `blocked`: the controller itself, always — it cannot update itself
///   through the generic path, whether or not any policy row exists;
/// - `warned`: any enabled-pattern match (the first match wins and is
///   reported back);
/// - `allowed`: everything else.
pub fn validate_batch(
    policies: &[UpdatePolicyRecord],
    candidates: &[UpdateCandidate],
) -> BatchValidation {
    let mut allowed = Vec::new();
    let mut warned = Vec::new();
    let mut blocked = Vec::new();

    for candidate in candidates {
        if candidate.is_self {
            blocked.push(BlockedUpdate {
                container_id: candidate.composite_key.clone(),
                image: candidate.image.clone(),
                reason: "cannot update itself".to_string(),
            });
            continue;
        }

        let matched = policies
            .iter()
            .filter(|p| p.enabled)
            .find(|p| glob_match(&p.pattern, &candidate.image));

        match matched {
            Some(policy) => {
                warned.push(WarnedUpdate {
                    container_id: candidate.composite_key.clone(),
                    image: candidate.image.clone(),
                    matched_pattern: policy.pattern.clone(),
                    category: policy.category.clone(),
                });
            }
            None => allowed.push(candidate.composite_key.clone()),
        }
    }

    let summary = BatchSummary {
        total: candidates.len(),
        allowed: allowed.len(),
        warned: warned.len(),
        blocked: blocked.len(),
    };

    BatchValidation {
        allowed,
        warned,
        blocked,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(id: i64, pattern: &str, category: &str, enabled: bool) -> UpdatePolicyRecord {
        UpdatePolicyRecord {
            id,
            pattern: pattern.to_string(),
            category: category.to_string(),
            enabled,
        }
    }

    fn candidate(key: &str, image: &str) -> UpdateCandidate {
        UpdateCandidate {
            composite_key: key.to_string(),
            image: image.to_string(),
            is_self: false,
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("postgres*", "postgres:16"));
        assert!(glob_match("*redis*", "bitnami/redis:7"));
        assert!(glob_match("nginx", "nginx"));
        assert!(!glob_match("postgres*", "mysql:8"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn test_batch_categorization() {
        let policies = vec![
            policy(1, "postgres*", "databases", true),
            policy(2, "*dockmon*", "critical", true),
            policy(3, "redis*", "databases", false),
        ];

        let result = validate_batch(
            &policies,
            &[
                candidate("h1:bbbbbbbbbbbb", "postgres:16"),
                candidate("h1:cccccccccccc", "redis:7"),
                candidate("h1:dddddddddddd", "nginx:latest"),
                UpdateCandidate::new(
                    "h1:aaaaaaaaaaaa".into(),
                    "ghcr.io/darthnorse/dockmon:2".into(),
                ),
            ],
        );

        assert_eq!(result.summary.total, 4);
        assert_eq!(result.warned.len(), 1);
        assert_eq!(result.warned[0].matched_pattern, "postgres*");
        // Disabled policy does not warn.
        assert!(result.allowed.contains(&"h1:cccccccccccc".to_string()));
        assert!(result.allowed.contains(&"h1:dddddddddddd".to_string()));
        assert_eq!(result.blocked.len(), 1);
        assert_eq!(result.blocked[0].container_id, "h1:aaaaaaaaaaaa");
    }

    #[test]
    fn test_self_blocked_without_any_policy() {
        // No policy rows at all: the controller is still blocked.
        let result = validate_batch(
            &[],
            &[UpdateCandidate::new("h1:aaaaaaaaaaaa".into(), "dockmon:latest".into())],
        );
        assert_eq!(result.blocked.len(), 1);
        assert_eq!(result.blocked[0].reason, "cannot update itself");
        assert!(result.allowed.is_empty());
    }

    #[test]
    fn test_critical_match_without_self_is_warned() {
        // A critical pattern match on something that is not the
        // controller warns rather than blocks.
        let policies = vec![policy(1, "*exporter*", "critical", true)];
        let result = validate_batch(
            &policies,
            &[candidate("h1:bbbbbbbbbbbb", "dockmon-exporter:1")],
        );
        assert_eq!(result.warned.len(), 1);
        assert!(result.blocked.is_empty());
    }

    #[test]
    fn test_is_self_image_shapes() {
        assert!(is_self_image("dockmon"));
        assert!(is_self_image("dockmon:latest"));
        assert!(is_self_image("ghcr.io/darthnorse/dockmon:2.1"));
        assert!(is_self_image("registry.example.com:5000/ops/dockmon-agent:1"));
        assert!(is_self_image("dockmon@sha256:abc"));
        assert!(!is_self_image("dockmon-exporter:1"));
        assert!(!is_self_image("nginx:latest"));
        assert!(!is_self_image("grafana/dockmonitor"));
    }
}
