//! Shared container health wait helper
//!
//! Used by the deployment executor after start and by the update
//! pipeline before declaring a recreated container good.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::session::HostSession;

/// How long a container without a HEALTHCHECK must stay running before
/// it counts as healthy.
const STABILITY_WINDOW: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Wait for a container to become demonstrably healthy.
///
/// - With a Docker HEALTHCHECK: polls until the status settles on
///   `healthy` (true) or `unhealthy` (false).
/// - Without one: waits for `Running`, then requires three more seconds
///   of continued running; a crash inside the window is a failure.
/// - Any Docker API failure returns false; this helper never raises.
///
/// Short-circuits as soon as a verdict is reachable.
pub async fn wait_for_container_health(
    session: &HostSession,
    container_id: &str,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    let mut running_since: Option<Instant> = None;

    loop {
        if Instant::now() >= deadline {
            debug!(container = container_id, "health wait timed out");
            return false;
        }

        let inspect = match session.inspect(container_id).await {
            Ok(inspect) => inspect,
            Err(e) => {
                debug!(container = container_id, "health wait inspect failed: {e}");
                return false;
            }
        };

        match inspect.health_status.as_deref() {
            Some("healthy") => return true,
            Some("unhealthy") => return false,
            Some(_) => {
                // "starting": keep polling until the check settles.
                running_since = None;
            }
            None => {
                if inspect.running {
                    let since = *running_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= STABILITY_WINDOW {
                        return true;
                    }
                } else if running_since.is_some() {
                    // Ran and then crashed inside the stability window.
                    return false;
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
    }
}
