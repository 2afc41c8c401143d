//! Alert rules and alert instances

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{opt_ts_from_db, ts_from_db, ts_to_db, Database, DatabaseError, DatabaseResult};

/// A channel reference in a rule's `notify_channels` list.
///
/// New rules store integer channel IDs; legacy rules stored type strings
/// ("discord"), which resolve to at most one channel per type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelRef {
    Id(i64),
    Type(String),
}

/// Weekday/time interval during which a rule stays silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutWindow {
    /// 0 = Monday ... 6 = Sunday
    pub weekdays: Vec<u8>,
    /// "HH:MM"
    pub start: String,
    /// "HH:MM"
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleRecord {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub scope_type: String,
    pub scope_id: Option<String>,
    pub operator: Option<String>,
    pub threshold: Option<f64>,
    pub window_secs: Option<i64>,
    pub severity: String,
    pub notify_channels: Vec<ChannelRef>,
    pub cooldown_minutes: i64,
    pub blackout_windows: Vec<BlackoutWindow>,
    pub enabled: bool,
    /// `None` means "not filtering on events"; an empty list normalizes
    /// to `None` at the storage boundary.
    pub trigger_events: Option<Vec<String>>,
    pub trigger_states: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertRuleRecord {
    /// Empty trigger lists are stored as NULL so "no filter" has one
    /// representation.
    fn normalized_triggers(&self) -> (Option<String>, Option<String>) {
        let ser = |v: &Option<Vec<String>>| -> Option<String> {
            match v {
                Some(list) if !list.is_empty() => serde_json::to_string(list).ok(),
                _ => None,
            }
        };
        (ser(&self.trigger_events), ser(&self.trigger_states))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Open,
    Snoozed,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Open => "open",
            AlertState::Snoozed => "snoozed",
            AlertState::Resolved => "resolved",
        }
    }

    fn from_db(s: &str) -> DatabaseResult<Self> {
        match s {
            "open" => Ok(AlertState::Open),
            "snoozed" => Ok(AlertState::Snoozed),
            "resolved" => Ok(AlertState::Resolved),
            other => Err(DatabaseError::Serialization(format!(
                "unknown alert state {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInstance {
    pub id: String,
    pub dedup_key: String,
    pub rule_id: String,
    pub scope_type: String,
    pub scope_id: Option<String>,
    pub entity_key: Option<String>,
    pub kind: String,
    pub severity: String,
    pub state: AlertState,
    pub message: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub suppressed_by_blackout: bool,
    pub notified_at: Option<DateTime<Utc>>,
    pub last_notification_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
}

impl Database {
    pub async fn insert_alert_rule(&self, rule: &AlertRuleRecord) -> DatabaseResult<()> {
        let (events, states) = rule.normalized_triggers();
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO alert_rules (id, name, kind, scope_type, scope_id, operator, threshold, \
             window_secs, severity, notify_channels, cooldown_minutes, blackout_windows, enabled, \
             trigger_events, trigger_states, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                rule.id,
                rule.name,
                rule.kind,
                rule.scope_type,
                rule.scope_id,
                rule.operator,
                rule.threshold,
                rule.window_secs,
                rule.severity,
                serde_json::to_string(&rule.notify_channels)?,
                rule.cooldown_minutes,
                if rule.blackout_windows.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&rule.blackout_windows)?)
                },
                rule.enabled as i64,
                events,
                states,
                ts_to_db(rule.created_at),
                ts_to_db(rule.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn list_alert_rules(&self, only_enabled: bool) -> DatabaseResult<Vec<AlertRuleRecord>> {
        let conn = self.conn().await;
        let sql = format!(
            "SELECT id, name, kind, scope_type, scope_id, operator, threshold, window_secs, \
             severity, notify_channels, cooldown_minutes, blackout_windows, enabled, \
             trigger_events, trigger_states, created_at, updated_at FROM alert_rules{}",
            if only_enabled { " WHERE enabled = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<f64>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, i64>(12)? != 0,
                    row.get::<_, Option<String>>(13)?,
                    row.get::<_, Option<String>>(14)?,
                    row.get::<_, String>(15)?,
                    row.get::<_, String>(16)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter()
            .map(|raw| {
                let parse_list = |v: Option<String>| -> DatabaseResult<Option<Vec<String>>> {
                    match v {
                        None => Ok(None),
                        Some(s) => {
                            let list: Vec<String> = serde_json::from_str(&s)?;
                            Ok(if list.is_empty() { None } else { Some(list) })
                        }
                    }
                };
                Ok(AlertRuleRecord {
                    id: raw.0,
                    name: raw.1,
                    kind: raw.2,
                    scope_type: raw.3,
                    scope_id: raw.4,
                    operator: raw.5,
                    threshold: raw.6,
                    window_secs: raw.7,
                    severity: raw.8,
                    notify_channels: serde_json::from_str(&raw.9)?,
                    cooldown_minutes: raw.10,
                    blackout_windows: raw
                        .11
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?
                        .unwrap_or_default(),
                    enabled: raw.12,
                    trigger_events: parse_list(raw.13)?,
                    trigger_states: parse_list(raw.14)?,
                    created_at: ts_from_db(&raw.15)?,
                    updated_at: ts_from_db(&raw.16)?,
                })
            })
            .collect()
    }

    pub async fn delete_alert_rule(&self, id: &str) -> DatabaseResult<bool> {
        let conn = self.conn().await;
        let n = conn.execute("DELETE FROM alert_rules WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Remove a channel from every rule's notify list; rules that would
    /// be left without channels are deleted. Returns the names of the
    /// deleted rules.
    pub async fn remove_channel_from_rules(&self, channel_id: i64) -> DatabaseResult<Vec<String>> {
        let rules = self.list_alert_rules(false).await?;
        let mut deleted = Vec::new();

        for rule in rules {
            let remaining: Vec<ChannelRef> = rule
                .notify_channels
                .iter()
                .filter(|c| !matches!(c, ChannelRef::Id(id) if *id == channel_id))
                .cloned()
                .collect();

            if remaining.len() == rule.notify_channels.len() {
                continue;
            }

            let conn = self.conn().await;
            if remaining.is_empty() {
                conn.execute("DELETE FROM alert_rules WHERE id = ?1", [&rule.id])?;
                deleted.push(rule.name);
            } else {
                conn.execute(
                    "UPDATE alert_rules SET notify_channels = ?2, updated_at = ?3 WHERE id = ?1",
                    params![
                        rule.id,
                        serde_json::to_string(&remaining)?,
                        ts_to_db(Utc::now())
                    ],
                )?;
            }
        }

        Ok(deleted)
    }

    pub async fn insert_alert(&self, alert: &AlertInstance) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO alerts (id, dedup_key, rule_id, scope_type, scope_id, entity_key, kind, \
             severity, state, message, first_seen, last_seen, resolved_at, suppressed_by_blackout, \
             notified_at, last_notification_attempt_at, next_retry_at, retry_count) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                alert.id,
                alert.dedup_key,
                alert.rule_id,
                alert.scope_type,
                alert.scope_id,
                alert.entity_key,
                alert.kind,
                alert.severity,
                alert.state.as_str(),
                alert.message,
                ts_to_db(alert.first_seen),
                ts_to_db(alert.last_seen),
                alert.resolved_at.map(ts_to_db),
                alert.suppressed_by_blackout as i64,
                alert.notified_at.map(ts_to_db),
                alert.last_notification_attempt_at.map(ts_to_db),
                alert.next_retry_at.map(ts_to_db),
                alert.retry_count,
            ],
        )?;
        Ok(())
    }

    pub async fn get_open_alert(&self, dedup_key: &str) -> DatabaseResult<Option<AlertInstance>> {
        let conn = self.conn().await;
        let raw = conn
            .query_row(
                &format!("{ALERT_SELECT} WHERE dedup_key = ?1 AND state = 'open'"),
                [dedup_key],
                row_to_alert_raw,
            )
            .optional()?;
        raw.map(raw_to_alert).transpose()
    }

    pub async fn touch_alert(&self, id: &str, last_seen: DateTime<Utc>) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE alerts SET last_seen = ?2 WHERE id = ?1",
            params![id, ts_to_db(last_seen)],
        )?;
        Ok(())
    }

    pub async fn resolve_alert(&self, id: &str) -> DatabaseResult<()> {
        let conn = self.conn().await;
        conn.execute(
            "UPDATE alerts SET state = 'resolved', resolved_at = ?2, next_retry_at = NULL \
             WHERE id = ?1",
            params![id, ts_to_db(Utc::now())],
        )?;
        Ok(())
    }

    /// Record a dispatch outcome on an alert.
    pub async fn record_notification_attempt(
        &self,
        id: &str,
        attempted_at: DateTime<Utc>,
        succeeded: bool,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> DatabaseResult<()> {
        let conn = self.conn().await;
        if succeeded {
            conn.execute(
                "UPDATE alerts SET notified_at = ?2, last_notification_attempt_at = ?2, \
                 next_retry_at = NULL WHERE id = ?1",
                params![id, ts_to_db(attempted_at)],
            )?;
        } else {
            conn.execute(
                "UPDATE alerts SET last_notification_attempt_at = ?2, next_retry_at = ?3, \
                 retry_count = retry_count + 1 WHERE id = ?1",
                params![id, ts_to_db(attempted_at), next_retry_at.map(ts_to_db)],
            )?;
        }
        Ok(())
    }

    /// Alerts whose retry is due.
    pub async fn alerts_due_for_retry(
        &self,
        now: DateTime<Utc>,
    ) -> DatabaseResult<Vec<AlertInstance>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(&format!(
            "{ALERT_SELECT} WHERE state = 'open' AND next_retry_at IS NOT NULL \
             AND next_retry_at <= ?1"
        ))?;
        let raws = stmt
            .query_map([ts_to_db(now)], row_to_alert_raw)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(raw_to_alert).collect()
    }

    pub async fn count_open_alerts(&self) -> DatabaseResult<usize> {
        let conn = self.conn().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE state = 'open'",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

const ALERT_SELECT: &str = "SELECT id, dedup_key, rule_id, scope_type, scope_id, entity_key, \
     kind, severity, state, message, first_seen, last_seen, resolved_at, suppressed_by_blackout, \
     notified_at, last_notification_attempt_at, next_retry_at, retry_count FROM alerts";

type RawAlert = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
);

fn row_to_alert_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAlert> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
    ))
}

fn raw_to_alert(raw: RawAlert) -> DatabaseResult<AlertInstance> {
    Ok(AlertInstance {
        id: raw.0,
        dedup_key: raw.1,
        rule_id: raw.2,
        scope_type: raw.3,
        scope_id: raw.4,
        entity_key: raw.5,
        kind: raw.6,
        severity: raw.7,
        state: AlertState::from_db(&raw.8)?,
        message: raw.9,
        first_seen: ts_from_db(&raw.10)?,
        last_seen: ts_from_db(&raw.11)?,
        resolved_at: opt_ts_from_db(raw.12)?,
        suppressed_by_blackout: raw.13 != 0,
        notified_at: opt_ts_from_db(raw.14)?,
        last_notification_attempt_at: opt_ts_from_db(raw.15)?,
        next_retry_at: opt_ts_from_db(raw.16)?,
        retry_count: raw.17,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn rule(id: &str, kind: &str, channels: Vec<ChannelRef>) -> AlertRuleRecord {
        let now = Utc::now();
        AlertRuleRecord {
            id: id.to_string(),
            name: format!("rule-{id}"),
            kind: kind.to_string(),
            scope_type: "global".into(),
            scope_id: None,
            operator: None,
            threshold: None,
            window_secs: None,
            severity: "warning".into(),
            notify_channels: channels,
            cooldown_minutes: 0,
            blackout_windows: Vec::new(),
            enabled: true,
            trigger_events: None,
            trigger_states: Some(vec!["exited".into()]),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn open_alert(id: &str, rule_id: &str, dedup_key: &str) -> AlertInstance {
        let now = Utc::now();
        AlertInstance {
            id: id.to_string(),
            dedup_key: dedup_key.to_string(),
            rule_id: rule_id.to_string(),
            scope_type: "global".into(),
            scope_id: None,
            entity_key: Some("h1:abc123def456".into()),
            kind: "container_stopped".into(),
            severity: "warning".into(),
            state: AlertState::Open,
            message: "container stopped".into(),
            first_seen: now,
            last_seen: now,
            resolved_at: None,
            suppressed_by_blackout: false,
            notified_at: None,
            last_notification_attempt_at: None,
            next_retry_at: None,
            retry_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{open_alert, rule};
    use super::*;
    use crate::database::test_support::seeded;

    #[tokio::test]
    async fn test_empty_trigger_list_normalizes_to_null() {
        let db = seeded().await;
        let mut r = rule("r1", "container_stopped", vec![ChannelRef::Id(1)]);
        r.trigger_events = Some(vec![]);
        r.trigger_states = Some(vec!["exited".into()]);
        db.insert_alert_rule(&r).await.unwrap();

        let loaded = db.list_alert_rules(true).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].trigger_events.is_none());
        assert_eq!(loaded[0].trigger_states.as_ref().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_refs_mixed_forms_roundtrip() {
        let db = seeded().await;
        let r = rule(
            "r1",
            "container_stopped",
            vec![ChannelRef::Id(1), ChannelRef::Type("discord".into())],
        );
        db.insert_alert_rule(&r).await.unwrap();

        let loaded = db.list_alert_rules(true).await.unwrap();
        assert_eq!(
            loaded[0].notify_channels,
            vec![ChannelRef::Id(1), ChannelRef::Type("discord".into())]
        );
    }

    #[tokio::test]
    async fn test_at_most_one_open_alert_per_dedup_key() {
        let db = seeded().await;
        db.insert_alert_rule(&rule("r1", "container_stopped", vec![ChannelRef::Id(1)]))
            .await
            .unwrap();
        db.insert_alert(&open_alert("a1", "r1", "k1")).await.unwrap();
        let err = db
            .insert_alert(&open_alert("a2", "r1", "k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Integrity(_)));

        // Resolving frees the dedup key for a new open instance.
        db.resolve_alert("a1").await.unwrap();
        db.insert_alert(&open_alert("a2", "r1", "k1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_schedule_roundtrip() {
        let db = seeded().await;
        db.insert_alert_rule(&rule("r1", "container_stopped", vec![ChannelRef::Id(1)]))
            .await
            .unwrap();
        db.insert_alert(&open_alert("a1", "r1", "k1")).await.unwrap();

        let now = Utc::now();
        db.record_notification_attempt("a1", now, false, Some(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let due = db.alerts_due_for_retry(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);

        db.record_notification_attempt("a1", now, true, None)
            .await
            .unwrap();
        assert!(db.alerts_due_for_retry(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_channel_deletes_orphaned_rules() {
        let db = seeded().await;
        db.insert_alert_rule(&rule("r1", "container_stopped", vec![ChannelRef::Id(7)]))
            .await
            .unwrap();
        db.insert_alert_rule(&rule(
            "r2",
            "host_offline",
            vec![ChannelRef::Id(7), ChannelRef::Id(8)],
        ))
        .await
        .unwrap();

        let deleted = db.remove_channel_from_rules(7).await.unwrap();
        assert_eq!(deleted, vec!["rule-r1".to_string()]);

        let rules = db.list_alert_rules(false).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].notify_channels, vec![ChannelRef::Id(8)]);
    }
}
