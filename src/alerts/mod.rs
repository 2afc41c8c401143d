//! Alert evaluation engine

mod engine;
mod model;
mod retry;

pub use engine::AlertEngine;
pub use model::{dedup_key, AlertKind, AlertScope, BlackoutSchedule};
pub use retry::{next_retry_delay, run_retry_loop, MAX_NOTIFICATION_RETRIES};
