//! Short-lived container info cache
//!
//! Restart execution and result reporting need container names without
//! issuing a list call per probe; entries go stale after 30 seconds and
//! refresh per host on demand. Readers accept staleness.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::docker::SessionManager;
use crate::keys::make_composite_key;

const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CachedContainer {
    pub short_id: String,
    pub name: String,
    pub host_id: String,
}

pub struct ContainerCache {
    entries: DashMap<String, CachedContainer>,
    refreshed: DashMap<String, Instant>,
}

impl ContainerCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            refreshed: DashMap::new(),
        }
    }

    /// Look up a container, refreshing the owning host's listing when
    /// the cached view is older than the TTL.
    pub async fn get(
        &self,
        manager: &Arc<SessionManager>,
        host_id: &str,
        composite_key: &str,
    ) -> Option<CachedContainer> {
        let stale = self
            .refreshed
            .get(host_id)
            .map(|at| at.elapsed() > CACHE_TTL)
            .unwrap_or(true);

        if stale {
            self.refresh_host(manager, host_id).await;
        }

        self.entries.get(composite_key).map(|e| e.value().clone())
    }

    async fn refresh_host(&self, manager: &Arc<SessionManager>, host_id: &str) {
        let Ok(session) = manager.ensure(host_id).await else {
            return;
        };
        let Ok(containers) = session.list_containers(true).await else {
            return;
        };

        // Drop this host's old entries before repopulating.
        self.entries.retain(|_, v| v.host_id != host_id);
        for brief in containers {
            if let Ok(key) = make_composite_key(host_id, &brief.short_id) {
                self.entries.insert(
                    key,
                    CachedContainer {
                        short_id: brief.short_id,
                        name: brief.name,
                        host_id: host_id.to_string(),
                    },
                );
            }
        }
        self.refreshed.insert(host_id.to_string(), Instant::now());
    }
}

impl Default for ContainerCache {
    fn default() -> Self {
        Self::new()
    }
}
