//! HTTP health checking with episode-based auto-restart

mod cache;
mod checker;

pub use cache::{CachedContainer, ContainerCache};
pub use checker::{status_matches, HealthChecker, ProbeDecision};
