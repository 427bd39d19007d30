//! polibot-store: SQLite-backed rule persistence.
//!
//! Stores notification rules (with their schedule parameters and fire
//! timestamps) and the dispatch audit log. The scheduler consumes this
//! through the [`RuleStore`] trait; [`SqliteRuleStore`] is the production
//! implementation. Deactivation is logical: rules are never deleted, so
//! history survives.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use polibot_types::{DispatchRecord, NotificationRule, ScheduleKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("rule not found: {0}")]
    RuleNotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence contract consumed by the scheduler.
///
/// All calls have synchronous semantics: the scheduler awaits completion
/// before considering a state transition durable.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    /// Active rules for one user, in creation order.
    async fn load_active(&self, user_id: &str) -> Result<Vec<NotificationRule>>;

    /// Fetch one rule by id, active or not.
    async fn get(&self, rule_id: &str) -> Result<Option<NotificationRule>>;

    /// Insert or replace a rule.
    async fn upsert(&self, rule: &NotificationRule) -> Result<()>;

    /// Record a completed fire: both `last_fired_at` and `next_fire_at`.
    async fn record_fire(
        &self,
        rule_id: &str,
        last_fired_at: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record a re-arm without a fire (catch-up rescheduling).
    async fn record_next_fire(&self, rule_id: &str, next_fire_at: DateTime<Utc>) -> Result<()>;

    /// Logically deactivate a rule. Returns false if no matching active
    /// rule exists (idempotent).
    async fn deactivate(&self, rule_id: &str, user_id: &str) -> Result<bool>;

    /// Users that currently have at least one active rule.
    async fn active_user_ids(&self) -> Result<Vec<String>>;

    /// Append a dispatched message to the audit log.
    async fn log_dispatch(&self, user_id: &str, target_id: &str, body: &str) -> Result<()>;

    /// Audit log for one user, most recent first.
    async fn dispatch_history(&self, user_id: &str) -> Result<Vec<DispatchRecord>>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS notification_rules (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        dataset_ref TEXT NOT NULL,
        schedule_kind TEXT NOT NULL,
        time_of_day TEXT,
        interval_hours INTEGER,
        interval_minutes INTEGER,
        last_fired_at TEXT,
        next_fire_at TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS dispatch_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        body TEXT NOT NULL,
        sent_at TEXT NOT NULL
    );";

const RULE_COLUMNS: &str = "id, user_id, target_id, dataset_ref, schedule_kind, time_of_day, \
     interval_hours, interval_minutes, last_fired_at, next_fire_at, active, created_at";

/// SQLite-backed [`RuleStore`].
pub struct SqliteRuleStore {
    conn: Arc<Mutex<Connection>>,
}

/// Split a schedule into its discriminator and parameter columns.
fn schedule_columns(kind: &ScheduleKind) -> (&'static str, Option<String>, Option<i64>, Option<i64>) {
    match kind {
        ScheduleKind::Daily { time_of_day } => ("daily", Some(time_of_day.clone()), None, None),
        ScheduleKind::Hourly { interval_hours } => {
            ("hourly", None, Some(*interval_hours as i64), None)
        }
        ScheduleKind::Minute { interval_minutes } => (
            "minute",
            None,
            None,
            interval_minutes.map(|m| m as i64),
        ),
    }
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRule> {
    let kind: String = row.get(4)?;
    let schedule = match kind.as_str() {
        "daily" => ScheduleKind::Daily {
            time_of_day: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        },
        "hourly" => ScheduleKind::Hourly {
            interval_hours: row.get::<_, Option<i64>>(6)?.unwrap_or_default() as u32,
        },
        "minute" => ScheduleKind::Minute {
            interval_minutes: row.get::<_, Option<i64>>(7)?.map(|m| m as u32),
        },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown schedule kind: {other}").into(),
            ));
        }
    };
    Ok(NotificationRule {
        id: row.get(0)?,
        user_id: row.get(1)?,
        target_id: row.get(2)?,
        dataset_ref: row.get(3)?,
        schedule,
        last_fired_at: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| s.parse().ok()),
        next_fire_at: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| s.parse().ok()),
        active: row.get::<_, i64>(10)? != 0,
        created_at: row
            .get::<_, String>(11)?
            .parse()
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl SqliteRuleStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Rule store opened: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait::async_trait]
impl RuleStore for SqliteRuleStore {
    async fn load_active(&self, user_id: &str) -> Result<Vec<NotificationRule>> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM notification_rules \
                 WHERE user_id = ?1 AND active = 1 ORDER BY created_at"
            ))?;
            // One unreadable row must not take the user's healthy rules
            // with it: skip and log instead of failing the whole load.
            let rules = stmt
                .query_map(rusqlite::params![user_id], row_to_rule)?
                .filter_map(|row| match row {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        tracing::warn!(user = %user_id, "Skipping unreadable rule row: {e}");
                        None
                    }
                })
                .collect();
            Ok(rules)
        })
        .await?
    }

    async fn get(&self, rule_id: &str) -> Result<Option<NotificationRule>> {
        let conn = self.conn.clone();
        let rule_id = rule_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM notification_rules WHERE id = ?1"
            ))?;
            let rule = stmt
                .query_row(rusqlite::params![rule_id], row_to_rule)
                .optional()?;
            Ok(rule)
        })
        .await?
    }

    async fn upsert(&self, rule: &NotificationRule) -> Result<()> {
        let conn = self.conn.clone();
        let rule = rule.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let (kind, time_of_day, hours, minutes) = schedule_columns(&rule.schedule);
            conn.execute(
                "INSERT OR REPLACE INTO notification_rules \
                     (id, user_id, target_id, dataset_ref, schedule_kind, time_of_day, \
                      interval_hours, interval_minutes, last_fired_at, next_fire_at, active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    rule.id,
                    rule.user_id,
                    rule.target_id,
                    rule.dataset_ref,
                    kind,
                    time_of_day,
                    hours,
                    minutes,
                    rule.last_fired_at.map(|t| t.to_rfc3339()),
                    rule.next_fire_at.map(|t| t.to_rfc3339()),
                    rule.active as i64,
                    rule.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn record_fire(
        &self,
        rule_id: &str,
        last_fired_at: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let rule_id = rule_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "UPDATE notification_rules SET last_fired_at = ?1, next_fire_at = ?2 WHERE id = ?3",
                rusqlite::params![
                    last_fired_at.to_rfc3339(),
                    next_fire_at.to_rfc3339(),
                    rule_id
                ],
            )?;
            if count == 0 {
                return Err(StoreError::RuleNotFound(rule_id));
            }
            Ok(())
        })
        .await?
    }

    async fn record_next_fire(&self, rule_id: &str, next_fire_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.clone();
        let rule_id = rule_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "UPDATE notification_rules SET next_fire_at = ?1 WHERE id = ?2",
                rusqlite::params![next_fire_at.to_rfc3339(), rule_id],
            )?;
            if count == 0 {
                return Err(StoreError::RuleNotFound(rule_id));
            }
            Ok(())
        })
        .await?
    }

    async fn deactivate(&self, rule_id: &str, user_id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let rule_id = rule_id.to_string();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "UPDATE notification_rules SET active = 0 \
                 WHERE id = ?1 AND user_id = ?2 AND active = 1",
                rusqlite::params![rule_id, user_id],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    async fn active_user_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT user_id FROM notification_rules WHERE active = 1 ORDER BY user_id",
            )?;
            let users = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await?
    }

    async fn log_dispatch(&self, user_id: &str, target_id: &str, body: &str) -> Result<()> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();
        let target_id = target_id.to_string();
        let body = body.to_string();
        let sent_at = Utc::now().to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO dispatch_log (user_id, target_id, body, sent_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![user_id, target_id, body, sent_at],
            )?;
            Ok(())
        })
        .await?
    }

    async fn dispatch_history(&self, user_id: &str) -> Result<Vec<DispatchRecord>> {
        let conn = self.conn.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT user_id, target_id, body, sent_at FROM dispatch_log \
                 WHERE user_id = ?1 ORDER BY sent_at DESC, id DESC",
            )?;
            let records = stmt
                .query_map(rusqlite::params![user_id], |row| {
                    Ok(DispatchRecord {
                        user_id: row.get(0)?,
                        target_id: row.get(1)?,
                        body: row.get(2)?,
                        sent_at: row
                            .get::<_, String>(3)?
                            .parse()
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await?
    }
}
