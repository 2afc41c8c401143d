//! Per-host Docker sessions and their lifecycle

mod health_wait;
mod manager;
mod pull;
mod session;

pub use health_wait::wait_for_container_health;
pub use manager::{SessionManager, SessionManagerConfig};
pub use pull::{pull_image_with_progress, LayerProgress, PullProgress};
pub use session::{classify_error, ContainerBrief, HostSession, InspectBrief, SessionError};
