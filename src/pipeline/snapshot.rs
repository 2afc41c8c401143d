//! Snapshot construction and label-derived tags

use std::collections::BTreeSet;

use crate::docker::ContainerBrief;
use crate::events::ContainerSnapshot;

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service";
const EXPLICIT_TAG_LABEL: &str = "dockmon.tag";

/// Synthesize tags from Docker labels.
///
/// - `com.docker.compose.project: p` -> `compose:p`
/// - `com.docker.swarm.service: s` -> `swarm:s`
/// - `dockmon.tag: a,b` -> `a`, `b`
pub fn derive_tags(labels: &std::collections::HashMap<String, String>) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();

    if let Some(project) = labels.get(COMPOSE_PROJECT_LABEL) {
        if !project.is_empty() {
            tags.insert(format!("compose:{project}"));
        }
    }
    if let Some(service) = labels.get(SWARM_SERVICE_LABEL) {
        if !service.is_empty() {
            tags.insert(format!("swarm:{service}"));
        }
    }
    if let Some(list) = labels.get(EXPLICIT_TAG_LABEL) {
        for tag in list.split(',') {
            let tag = tag.trim();
            if !tag.is_empty() {
                tags.insert(tag.to_string());
            }
        }
    }

    tags
}

/// Normalized snapshot: label-derived tags unioned with the user's
/// assignments.
pub fn build_snapshot(
    host_id: &str,
    brief: &ContainerBrief,
    user_tags: &[String],
) -> ContainerSnapshot {
    let mut derived_tags = derive_tags(&brief.labels);
    derived_tags.extend(user_tags.iter().cloned());

    ContainerSnapshot {
        composite_key: format!("{host_id}:{}", brief.short_id),
        host_id: host_id.to_string(),
        short_id: brief.short_id.clone(),
        name: brief.name.clone(),
        image: brief.image.clone(),
        state: brief.state,
        status_text: brief.status.clone(),
        labels: brief.labels.clone(),
        derived_tags,
        created_at: brief.created_at,
    }
}
