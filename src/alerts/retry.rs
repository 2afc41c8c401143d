//! Notification retry loop
//!
//! Transient dispatch failures leave a persisted `next_retry_at` on the
//! alert; this loop wakes the due ones and re-dispatches through the
//! engine. Delays grow exponentially with jitter and give up after a
//! bounded number of attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{debug, warn};

use super::engine::AlertEngine;
use crate::database::Database;

pub const MAX_NOTIFICATION_RETRIES: u32 = 5;
const BASE_DELAY_SECS: i64 = 60;
const MAX_DELAY_SECS: i64 = 3600;
/// Fractional jitter applied to every delay.
const JITTER: f64 = 0.2;

/// Delay before attempt `retry_count + 1`, or `None` once the budget is
/// spent.
pub fn next_retry_delay(retry_count: u32) -> Option<Duration> {
    if retry_count >= MAX_NOTIFICATION_RETRIES {
        return None;
    }
    let base = (BASE_DELAY_SECS << retry_count).min(MAX_DELAY_SECS) as f64;
    let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
    Some(Duration::seconds((base * (1.0 + jitter)) as i64))
}

/// Wake on due retries until shutdown.
pub async fn run_retry_loop(db: Arc<Database>, engine: Arc<AlertEngine>) {
    let mut interval = tokio::time::interval(StdDuration::from_secs(30));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let now = Utc::now();
        let due = match db.alerts_due_for_retry(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!("retry sweep failed: {e}");
                continue;
            }
        };
        if due.is_empty() {
            continue;
        }

        let rules: HashMap<String, _> = match db.list_alert_rules(false).await {
            Ok(rules) => rules.into_iter().map(|r| (r.id.clone(), r)).collect(),
            Err(e) => {
                warn!("rule load failed during retry sweep: {e}");
                continue;
            }
        };

        for alert in due {
            if alert.retry_count as u32 > MAX_NOTIFICATION_RETRIES {
                // Budget exhausted; stop waking for this alert.
                let _ = db
                    .record_notification_attempt(&alert.id, now, true, None)
                    .await;
                continue;
            }

            let Some(rule) = rules.get(&alert.rule_id) else {
                // Rule deleted since the alert opened; nothing to send.
                let _ = db
                    .record_notification_attempt(&alert.id, now, true, None)
                    .await;
                continue;
            };

            debug!(alert = %alert.id, attempt = alert.retry_count, "retrying notification");
            engine.dispatch(&alert, rule, now).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_cap() {
        let first = next_retry_delay(0).unwrap();
        assert!(first.num_seconds() >= 48 && first.num_seconds() <= 72);

        let third = next_retry_delay(2).unwrap();
        assert!(third.num_seconds() >= 192 && third.num_seconds() <= 288);

        // Far along, the cap dominates even with jitter.
        let capped = next_retry_delay(4).unwrap();
        assert!(capped.num_seconds() <= (MAX_DELAY_SECS as f64 * (1.0 + JITTER)) as i64);
    }

    #[test]
    fn test_budget_exhausts() {
        assert!(next_retry_delay(MAX_NOTIFICATION_RETRIES).is_none());
        assert!(next_retry_delay(MAX_NOTIFICATION_RETRIES + 3).is_none());
    }

    #[test]
    fn test_jitter_varies() {
        let samples: Vec<i64> = (0..32)
            .map(|_| next_retry_delay(1).unwrap().num_seconds())
            .collect();
        let first = samples[0];
        // With +/-20% jitter, 32 identical samples would be astonishing.
        assert!(samples.iter().any(|s| *s != first));
    }
}
