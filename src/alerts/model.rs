//! Alert rule model: kinds, scopes, dedup keys and blackout windows

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::database::{AlertRuleRecord, BlackoutWindow};

/// Closed set of alert kinds. There is no rule DSL; each kind carries
/// its own evaluation wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    ContainerStopped,
    ContainerUnhealthy,
    CpuHigh,
    MemoryHigh,
    DiskHigh,
    HostOffline,
    UpdateAvailable,
    RestartLoop,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ContainerStopped => "container_stopped",
            AlertKind::ContainerUnhealthy => "container_unhealthy",
            AlertKind::CpuHigh => "cpu_high",
            AlertKind::MemoryHigh => "memory_high",
            AlertKind::DiskHigh => "disk_high",
            AlertKind::HostOffline => "host_offline",
            AlertKind::UpdateAvailable => "update_available",
            AlertKind::RestartLoop => "restart_loop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "container_stopped" => AlertKind::ContainerStopped,
            "container_unhealthy" => AlertKind::ContainerUnhealthy,
            "cpu_high" => AlertKind::CpuHigh,
            "memory_high" => AlertKind::MemoryHigh,
            "disk_high" => AlertKind::DiskHigh,
            "host_offline" => AlertKind::HostOffline,
            "update_available" => AlertKind::UpdateAvailable,
            "restart_loop" => AlertKind::RestartLoop,
            _ => return None,
        })
    }

    /// Kinds that fire on state/event triggers must carry at least one
    /// trigger list.
    pub fn needs_triggers(&self) -> bool {
        matches!(self, AlertKind::ContainerStopped | AlertKind::RestartLoop)
    }
}

/// Parsed rule scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertScope {
    Global,
    Host(String),
    Container(String),
    /// Rule tags; a container matches when the intersection with its
    /// effective tags is non-empty.
    Tag(Vec<String>),
}

impl AlertScope {
    pub fn from_rule(rule: &AlertRuleRecord) -> Option<Self> {
        match rule.scope_type.as_str() {
            "global" => Some(AlertScope::Global),
            "host" => rule.scope_id.clone().map(AlertScope::Host),
            "container" => rule.scope_id.clone().map(AlertScope::Container),
            "tag" => rule.scope_id.as_ref().map(|raw| {
                AlertScope::Tag(
                    raw.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect(),
                )
            }),
            _ => None,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            AlertScope::Global => "global",
            AlertScope::Host(_) => "host",
            AlertScope::Container(_) => "container",
            AlertScope::Tag(_) => "tag",
        }
    }

    pub fn id_str(&self) -> String {
        match self {
            AlertScope::Global => String::new(),
            AlertScope::Host(id) | AlertScope::Container(id) => id.clone(),
            AlertScope::Tag(tags) => tags.join(","),
        }
    }

    /// Does a container with these coordinates fall inside the scope?
    pub fn matches_container(
        &self,
        host_id: &str,
        composite_key: &str,
        tags: &BTreeSet<String>,
    ) -> bool {
        match self {
            AlertScope::Global => true,
            AlertScope::Host(id) => id == host_id,
            AlertScope::Container(key) => key == composite_key,
            AlertScope::Tag(rule_tags) => rule_tags.iter().any(|t| tags.contains(t)),
        }
    }

    pub fn matches_host(&self, host_id: &str) -> bool {
        match self {
            AlertScope::Global => true,
            AlertScope::Host(id) => id == host_id,
            AlertScope::Container(_) | AlertScope::Tag(_) => false,
        }
    }
}

/// Canonical alert identity: `kind|scope_type:scope_id|entity`.
///
/// The entity component is the container composite key for
/// container-level kinds and the host ID for host-level ones; it is
/// omitted when the scope already pins a single entity (host and
/// container scopes carry it in the scope ID).
///
/// Keeping the entity under global and tag scopes is an assumption:
/// only host-scope keys (entity omitted) are attested anywhere, but
/// dropping it there would collapse every entity matched by a broad
/// rule into one open alert, which contradicts the at-most-one-open
/// invariant being per entity.
pub fn dedup_key(kind: AlertKind, scope: &AlertScope, entity: Option<&str>) -> String {
    let base = format!("{}|{}:{}", kind.as_str(), scope.type_str(), scope.id_str());
    match (scope, entity) {
        (AlertScope::Host(_), _) | (AlertScope::Container(_), _) => base,
        (_, Some(entity)) => format!("{base}|{entity}"),
        (_, None) => base,
    }
}

/// A rule's blackout windows, evaluated against UTC wall-clock time.
pub struct BlackoutSchedule<'a> {
    windows: &'a [BlackoutWindow],
}

impl<'a> BlackoutSchedule<'a> {
    pub fn new(windows: &'a [BlackoutWindow]) -> Self {
        Self { windows }
    }

    /// True when `at` falls inside any window. Windows whose end is not
    /// after their start wrap past midnight.
    pub fn is_blacked_out(&self, at: DateTime<Utc>) -> bool {
        // Monday = 0, matching the stored weekday convention.
        let weekday = at.weekday().num_days_from_monday() as u8;
        let minutes = (at.hour() * 60 + at.minute()) as i32;

        self.windows.iter().any(|window| {
            let Some(start) = parse_hhmm(&window.start) else {
                return false;
            };
            let Some(end) = parse_hhmm(&window.end) else {
                return false;
            };

            if start < end {
                window.weekdays.contains(&weekday) && minutes >= start && minutes < end
            } else {
                // Overnight: the tail belongs to the previous weekday.
                let prev = (weekday + 6) % 7;
                (window.weekdays.contains(&weekday) && minutes >= start)
                    || (window.weekdays.contains(&prev) && minutes < end)
            }
        })
    }
}

fn parse_hhmm(raw: &str) -> Option<i32> {
    let (h, m) = raw.split_once(':')?;
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if (0..24).contains(&h) && (0..60).contains(&m) {
        Some(h * 60 + m)
    } else {
        None
    }
}

/// Threshold comparison for metric kinds.
pub fn compare(operator: &str, value: f64, threshold: f64) -> bool {
    match operator {
        ">=" => value >= threshold,
        "<=" => value <= threshold,
        ">" => value > threshold,
        "<" => value < threshold,
        "==" => (value - threshold).abs() < f64::EPSILON,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            AlertKind::ContainerStopped,
            AlertKind::ContainerUnhealthy,
            AlertKind::CpuHigh,
            AlertKind::MemoryHigh,
            AlertKind::DiskHigh,
            AlertKind::HostOffline,
            AlertKind::UpdateAvailable,
            AlertKind::RestartLoop,
        ] {
            assert_eq!(AlertKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AlertKind::parse("made_up"), None);
    }

    #[test]
    fn test_dedup_key_per_entity_under_global_scope() {
        let scope = AlertScope::Global;
        let a = dedup_key(
            AlertKind::ContainerStopped,
            &scope,
            Some("h1:abc123def456"),
        );
        let b = dedup_key(
            AlertKind::ContainerStopped,
            &scope,
            Some("h2:abc123def456"),
        );
        assert_ne!(a, b);
        assert_eq!(a, "container_stopped|global:|h1:abc123def456");
    }

    #[test]
    fn test_dedup_key_scope_pinned_omits_entity() {
        let scope = AlertScope::Container("h1:abc123def456".into());
        let key = dedup_key(
            AlertKind::ContainerStopped,
            &scope,
            Some("h1:abc123def456"),
        );
        assert_eq!(key, "container_stopped|container:h1:abc123def456");
    }

    #[test]
    fn test_tag_scope_intersection() {
        let scope = AlertScope::Tag(vec!["prod".into(), "edge".into()]);
        let mut tags = BTreeSet::new();
        tags.insert("edge".to_string());
        assert!(scope.matches_container("h1", "h1:abc123def456", &tags));

        let mut other = BTreeSet::new();
        other.insert("dev".to_string());
        assert!(!scope.matches_container("h1", "h1:abc123def456", &other));
    }

    #[test]
    fn test_blackout_simple_window() {
        let windows = vec![BlackoutWindow {
            weekdays: vec![0, 1, 2, 3, 4],
            start: "22:00".into(),
            end: "23:30".into(),
        }];
        let schedule = BlackoutSchedule::new(&windows);

        // 2026-07-27 is a Monday.
        let inside = Utc.with_ymd_and_hms(2026, 7, 27, 22, 30, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2026, 7, 27, 12, 0, 0).unwrap();
        assert!(schedule.is_blacked_out(inside));
        assert!(!schedule.is_blacked_out(outside));
    }

    #[test]
    fn test_blackout_overnight_window() {
        let windows = vec![BlackoutWindow {
            weekdays: vec![4], // Friday night
            start: "23:00".into(),
            end: "06:00".into(),
        }];
        let schedule = BlackoutSchedule::new(&windows);

        // Friday 23:30 and Saturday 05:00 are both inside.
        let friday_night = Utc.with_ymd_and_hms(2026, 7, 31, 23, 30, 0).unwrap();
        let saturday_morning = Utc.with_ymd_and_hms(2026, 8, 1, 5, 0, 0).unwrap();
        let saturday_noon = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert!(schedule.is_blacked_out(friday_night));
        assert!(schedule.is_blacked_out(saturday_morning));
        assert!(!schedule.is_blacked_out(saturday_noon));
    }

    #[test]
    fn test_compare_operators() {
        assert!(compare(">=", 90.0, 90.0));
        assert!(compare(">", 90.1, 90.0));
        assert!(!compare("<", 90.0, 90.0));
        assert!(compare("==", 42.0, 42.0));
        assert!(!compare("nonsense", 1.0, 1.0));
    }
}
