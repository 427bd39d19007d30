use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────── Schedule Types ────────────────────

/// Recurrence schedule for a notification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire once per day at a fixed time ("HH:MM").
    Daily { time_of_day: String },
    /// Fire every `interval_hours` hours.
    Hourly { interval_hours: u32 },
    /// Fire every `interval_minutes` minutes. An absent interval falls
    /// back to the documented default of 5 minutes.
    Minute {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_minutes: Option<u32>,
    },
}

// ──────────────────── Rule Types ────────────────────

/// A user's configuration binding a dataset, a messaging target, and a
/// recurrence schedule. At most one active rule may exist per
/// (user_id, target_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    /// Unique rule ID, assigned at creation.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Destination group/channel identifier.
    pub target_id: String,
    /// Reference to the dataset this rule evaluates.
    pub dataset_ref: String,
    /// Recurrence schedule.
    pub schedule: ScheduleKind,
    /// Set after each successful fire attempt (evaluated, not necessarily
    /// sent; zero matches still counts as an attempt).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Next scheduled fire instant. Absent means "needs recomputation".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Deactivation is logical; inactive rules are retained for history.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Payload for creating or updating a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub user_id: String,
    pub target_id: String,
    pub dataset_ref: String,
    pub schedule: ScheduleKind,
}

// ──────────────────── Dataset Types ────────────────────

/// One normalized spreadsheet row, as produced by the dataset loader.
/// The expiry field is already normalized to `D.M.YYYY` text (or absent
/// when the source value could not be interpreted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<String>,
    #[serde(default)]
    pub customer: String,
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub premium: String,
    #[serde(default)]
    pub company: String,
}

// ──────────────────── Channel Types ────────────────────

/// Connection lifecycle event emitted by the messaging channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    Connected { user_id: String },
    Disconnected { user_id: String },
}

/// One entry of the dispatch audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub user_id: String,
    pub target_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_kind_serde() {
        let kind = ScheduleKind::Daily {
            time_of_day: "09:00".into(),
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains("\"kind\":\"daily\""));
        let parsed: ScheduleKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, kind);
    }

    #[test]
    fn test_minute_interval_absent() {
        let json = r#"{"kind":"minute"}"#;
        let parsed: ScheduleKind = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            ScheduleKind::Minute {
                interval_minutes: None
            }
        );
    }

    #[test]
    fn test_rule_serde_roundtrip() {
        let rule = NotificationRule {
            id: "r-1".into(),
            user_id: "u-1".into(),
            target_id: "group-1".into(),
            dataset_ref: "policies-2025".into(),
            schedule: ScheduleKind::Hourly { interval_hours: 2 },
            last_fired_at: None,
            next_fire_at: None,
            active: true,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&rule).unwrap();
        // Absent timestamps are omitted, not serialized as null.
        assert!(!json.contains("last_fired_at"));
        let parsed: NotificationRule = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "r-1");
        assert!(parsed.active);
    }

    #[test]
    fn test_dataset_row_defaults() {
        let json = r#"{"customer":"Alice"}"#;
        let row: DatasetRow = serde_json::from_str(json).unwrap();
        assert!(row.expiry.is_none());
        assert_eq!(row.customer, "Alice");
        assert!(row.plate.is_empty());
    }

    #[test]
    fn test_channel_event_serde() {
        let ev = ChannelEvent::Connected {
            user_id: "u-1".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"connected\""));
        let parsed: ChannelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ev);
    }
}
