//! Label preservation across container recreation
//!
//! A container's labels are its image's defaults plus whatever the user
//! (or compose/Traefik) added at create time. Recreating with a new
//! image must carry the additions but not the old image's defaults,
//! which the new image supersedes.

use std::collections::HashMap;

/// Labels present on the container that are not image defaults.
///
/// Comparison is case-sensitive and exact, whitespace included: a
/// container label whose value differs from the image default is a user
/// override and is kept. Inputs are never mutated.
pub fn extract_user_labels(
    container_labels: &HashMap<String, String>,
    image_labels: &HashMap<String, String>,
) -> HashMap<String, String> {
    container_labels
        .iter()
        .filter(|(key, value)| image_labels.get(*key) != Some(*value))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The label set for the recreated container: user labels plus the
/// compose and Traefik labels that wire the container into its project
/// and routing, whether or not the old image also declared them.
pub fn preserved_labels(
    container_labels: &HashMap<String, String>,
    image_labels: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut labels = extract_user_labels(container_labels, image_labels);
    for (key, value) in container_labels {
        if key.starts_with("com.docker.compose.") || key.starts_with("traefik.") {
            labels.insert(key.clone(), value.clone());
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_image_defaults_subtracted() {
        let container = map(&[
            ("maintainer", "nginx docs <docs@nginx.com>"),
            ("my.custom", "value"),
        ]);
        let image = map(&[("maintainer", "nginx docs <docs@nginx.com>")]);

        let user = extract_user_labels(&container, &image);
        assert_eq!(user, map(&[("my.custom", "value")]));
    }

    #[test]
    fn test_overridden_default_kept() {
        let container = map(&[("maintainer", "me")]);
        let image = map(&[("maintainer", "nginx docs")]);
        assert_eq!(
            extract_user_labels(&container, &image),
            map(&[("maintainer", "me")])
        );
    }

    #[test]
    fn test_comparison_is_exact_including_whitespace() {
        let container = map(&[("label", "value ")]);
        let image = map(&[("label", "value")]);
        // Trailing whitespace differs: user override.
        assert_eq!(
            extract_user_labels(&container, &image),
            map(&[("label", "value ")])
        );
    }

    #[test]
    fn test_case_sensitive() {
        let container = map(&[("Label", "x")]);
        let image = map(&[("label", "x")]);
        assert_eq!(extract_user_labels(&container, &image), map(&[("Label", "x")]));
    }

    #[test]
    fn test_inputs_not_mutated() {
        let container = map(&[("a", "1"), ("b", "2")]);
        let image = map(&[("a", "1")]);
        let container_before = container.clone();
        let image_before = image.clone();

        let _ = extract_user_labels(&container, &image);

        assert_eq!(container, container_before);
        assert_eq!(image, image_before);
    }

    #[test]
    fn test_compose_and_traefik_always_preserved() {
        let container = map(&[
            ("com.docker.compose.project", "shop"),
            ("traefik.http.routers.web.rule", "Host(`x`)"),
            ("maintainer", "nginx docs"),
        ]);
        // Even when the image itself carries the compose label.
        let image = map(&[
            ("com.docker.compose.project", "shop"),
            ("maintainer", "nginx docs"),
        ]);

        let preserved = preserved_labels(&container, &image);
        assert_eq!(preserved["com.docker.compose.project"], "shop");
        assert_eq!(preserved["traefik.http.routers.web.rule"], "Host(`x`)");
        assert!(!preserved.contains_key("maintainer"));
    }
}
