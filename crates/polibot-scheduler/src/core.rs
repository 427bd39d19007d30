//! SchedulerCore: per-rule timers, the fire pipeline and catch-up.
//!
//! Each active rule owns exactly one timer slot in a process-wide registry.
//! A slot carries a generation counter; arm, cancel and replace swap the
//! slot under a single lock, and a completed fire only re-arms when its
//! generation is still current. Firing I/O (dataset fetch, channel send,
//! persistence) always runs outside the lock.
//!
//! Timer handles are sleepers only: at expiry the fire runs as a detached
//! task, so cancelling a rule never aborts a firing already in progress;
//! the in-flight fire completes and its re-arm is skipped by the
//! generation check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use polibot_dataset::DatasetLoader;
use polibot_matcher::{expiring_today, render_message};
use polibot_store::RuleStore;
use polibot_types::{NotificationRule, RuleSpec};

use crate::calc::{next_fire, validate_schedule};
use crate::channel::Channel;
use crate::error::SchedulerError;

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// What to do with a persisted rule when the channel comes (back) up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpAction {
    /// Resume the timer for the stored `next_fire_at` unchanged.
    Resume(DateTime<Utc>),
    /// Treat as never scheduled: compute a fresh next fire and persist it.
    ArmFresh,
    /// The slot was missed while disconnected: fire immediately.
    FireNow,
}

/// Catch-up decision for one rule. The same-day-already-fired case is
/// checked before the missed-deadline case on purpose: a rule that fired
/// once today must not be double-fired just because a stale `next_fire_at`
/// is overdue.
pub fn catch_up_action(
    last_fired_at: Option<DateTime<Utc>>,
    next_fire_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> CatchUpAction {
    if let (Some(last), Some(next)) = (last_fired_at, next_fire_at) {
        if last.date_naive() == now.date_naive() && next > now {
            return CatchUpAction::Resume(next);
        }
    }
    let (Some(_), Some(next)) = (last_fired_at, next_fire_at) else {
        return CatchUpAction::ArmFresh;
    };
    if next <= now {
        CatchUpAction::FireNow
    } else {
        CatchUpAction::Resume(next)
    }
}

/// The recurring notification scheduler.
pub struct SchedulerCore {
    pub(crate) store: Arc<dyn RuleStore>,
    pub(crate) loader: Arc<dyn DatasetLoader>,
    pub(crate) channel: Arc<dyn Channel>,
    timers: Mutex<HashMap<String, TimerSlot>>,
    next_generation: AtomicU64,
}

impl SchedulerCore {
    pub fn new(
        store: Arc<dyn RuleStore>,
        loader: Arc<dyn DatasetLoader>,
        channel: Arc<dyn Channel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            loader,
            channel,
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    // ─── Rule management surface ───────────────────────────

    /// Create a rule: validates the schedule, enforces one active rule per
    /// (user, target), computes the first fire instant and arms the timer.
    pub async fn create_rule(self: &Arc<Self>, spec: RuleSpec) -> Result<String, SchedulerError> {
        validate_schedule(&spec.schedule).map_err(SchedulerError::InvalidSchedule)?;
        let existing = self.store.load_active(&spec.user_id).await?;
        if existing.iter().any(|r| r.target_id == spec.target_id) {
            return Err(SchedulerError::DuplicateTarget(spec.target_id));
        }

        let now = Utc::now();
        let next = next_fire(&spec.schedule, now);
        let rule = NotificationRule {
            id: Uuid::new_v4().to_string(),
            user_id: spec.user_id,
            target_id: spec.target_id,
            dataset_ref: spec.dataset_ref,
            schedule: spec.schedule,
            last_fired_at: None,
            next_fire_at: Some(next),
            active: true,
            created_at: now,
        };
        self.store.upsert(&rule).await?;
        self.arm_at(&rule, next);
        info!(rule_id = %rule.id, next = %next, "Rule created and armed");
        Ok(rule.id)
    }

    /// Update a rule's target, dataset or schedule. The rule must be
    /// active and owned by `spec.user_id`. The old timer handle is
    /// replaced atomically with the new one.
    pub async fn update_rule(
        self: &Arc<Self>,
        rule_id: &str,
        spec: RuleSpec,
    ) -> Result<(), SchedulerError> {
        validate_schedule(&spec.schedule).map_err(SchedulerError::InvalidSchedule)?;
        let current = self
            .store
            .get(rule_id)
            .await?
            .filter(|r| r.active && r.user_id == spec.user_id)
            .ok_or_else(|| SchedulerError::RuleNotFound(rule_id.to_string()))?;

        let siblings = self.store.load_active(&current.user_id).await?;
        if siblings
            .iter()
            .any(|r| r.id != rule_id && r.target_id == spec.target_id)
        {
            return Err(SchedulerError::DuplicateTarget(spec.target_id));
        }

        let now = Utc::now();
        let next = next_fire(&spec.schedule, now);
        let rule = NotificationRule {
            target_id: spec.target_id,
            dataset_ref: spec.dataset_ref,
            schedule: spec.schedule,
            next_fire_at: Some(next),
            ..current
        };
        self.store.upsert(&rule).await?;
        self.arm_at(&rule, next);
        info!(rule_id = %rule.id, next = %next, "Rule updated, timer replaced");
        Ok(())
    }

    /// Deactivate a rule. Cancels its timer synchronously before the store
    /// transition; an in-flight fire may still complete but will not
    /// re-arm. Returns false if no matching active rule existed.
    pub async fn deactivate_rule(&self, rule_id: &str, user_id: &str) -> Result<bool, SchedulerError> {
        self.cancel(rule_id);
        let removed = self.store.deactivate(rule_id, user_id).await?;
        if removed {
            info!(rule_id, "Rule deactivated, timer cancelled");
        }
        Ok(removed)
    }

    /// Active rules for a user.
    pub async fn list_rules(&self, user_id: &str) -> Result<Vec<NotificationRule>, SchedulerError> {
        Ok(self.store.load_active(user_id).await?)
    }

    /// Re-arm every active rule of a user, applying the catch-up policy.
    /// Called on channel reconnect and at process start.
    pub async fn rearm_all(self: &Arc<Self>, user_id: &str) -> Result<(), SchedulerError> {
        let rules = self.store.load_active(user_id).await?;
        info!(user = %user_id, count = rules.len(), "Re-arming rules");
        let now = Utc::now();
        for rule in rules {
            match catch_up_action(rule.last_fired_at, rule.next_fire_at, now) {
                CatchUpAction::Resume(at) => {
                    debug!(rule_id = %rule.id, at = %at, "Resuming stored fire instant");
                    self.arm_at(&rule, at);
                }
                CatchUpAction::ArmFresh => {
                    let next = next_fire(&rule.schedule, now);
                    if let Err(e) = self.store.record_next_fire(&rule.id, next).await {
                        warn!(rule_id = %rule.id, "Failed to persist next fire: {e}");
                    }
                    debug!(rule_id = %rule.id, next = %next, "Armed fresh");
                    self.arm_at(&rule, next);
                }
                CatchUpAction::FireNow => {
                    info!(rule_id = %rule.id, "Fire missed while disconnected, firing now");
                    self.arm_at(&rule, now);
                }
            }
        }
        Ok(())
    }

    /// Rule ids that currently hold a timer slot.
    pub fn armed_rules(&self) -> Vec<String> {
        self.lock_timers().keys().cloned().collect()
    }

    /// Cancel every timer. Call on process shutdown.
    pub fn shutdown(&self) {
        let mut timers = self.lock_timers();
        info!(count = timers.len(), "Scheduler shutting down, cancelling timers");
        for (_, slot) in timers.drain() {
            slot.handle.abort();
        }
    }

    // ─── Timer registry ────────────────────────────────────

    /// Registry lock. A poisoned lock only means some other holder
    /// panicked; the map itself is still sound, so recover it rather than
    /// taking the whole scheduler down.
    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, TimerSlot>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm (or replace) the timer for a rule. Spawn and slot insert happen
    /// under the registry lock: an already-due sleeper must not be able to
    /// observe the registry before its own slot is in it, or its fire would
    /// read as stale and the rule would be silently dropped.
    fn arm_at(self: &Arc<Self>, rule: &NotificationRule, fire_at: DateTime<Utc>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.lock_timers();
        let handle = self.spawn_timer(rule.clone(), fire_at, generation);
        if let Some(old) = timers.insert(
            rule.id.clone(),
            TimerSlot { generation, handle },
        ) {
            old.handle.abort();
        }
    }

    /// Re-arm after a completed fire, but only if the slot still belongs
    /// to that fire's generation. A rule deactivated or replaced while the
    /// fire was in flight is left alone.
    fn rearm_if_current(
        self: &Arc<Self>,
        rule: &NotificationRule,
        fire_at: DateTime<Utc>,
        fired_generation: u64,
    ) {
        let mut timers = self.lock_timers();
        match timers.get(&rule.id) {
            Some(slot) if slot.generation == fired_generation => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let handle = self.spawn_timer(rule.clone(), fire_at, generation);
                // The displaced handle is our own expired sleeper.
                timers.insert(rule.id.clone(), TimerSlot { generation, handle });
            }
            _ => {
                debug!(rule_id = %rule.id, "Timer cancelled or replaced during fire, skipping re-arm");
            }
        }
    }

    fn cancel(&self, rule_id: &str) {
        if let Some(slot) = self.lock_timers().remove(rule_id) {
            slot.handle.abort();
        }
    }

    fn spawn_timer(
        self: &Arc<Self>,
        rule: NotificationRule,
        fire_at: DateTime<Utc>,
        generation: u64,
    ) -> JoinHandle<()> {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
            // Detach the fire so aborting this sleeper cannot interrupt a
            // firing in progress.
            tokio::spawn(core.clone().fire(rule, generation));
        })
    }

    fn is_current(&self, rule_id: &str, generation: u64) -> bool {
        self.lock_timers()
            .get(rule_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    // ─── Fire pipeline ─────────────────────────────────────

    /// One evaluation + possible-dispatch cycle. Transient failures are
    /// absorbed here; nothing propagates out of a timer callback.
    async fn fire(self: Arc<Self>, rule: NotificationRule, generation: u64) {
        if !self.is_current(&rule.id, generation) {
            debug!(rule_id = %rule.id, "Stale timer fired, ignoring");
            return;
        }

        // Disconnected channel: abort without consuming the fire and retry
        // at the same cadence. A missed-then-retried notification beats a
        // silent loss.
        if !self.channel.is_connected(&rule.user_id).await {
            warn!(rule_id = %rule.id, user = %rule.user_id, "Channel disconnected, deferring fire");
            self.skip_and_rearm(&rule, generation).await;
            return;
        }

        let rows = match self.loader.load_rows(&rule.dataset_ref).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(rule_id = %rule.id, dataset = %rule.dataset_ref, "Dataset unavailable, deferring fire: {e}");
                self.skip_and_rearm(&rule, generation).await;
                return;
            }
        };

        let today = chrono::Local::now().date_naive();
        let matches = expiring_today(&rows, today);
        if matches.is_empty() {
            info!(rule_id = %rule.id, "No policies expiring today, nothing to send");
        } else {
            let body = render_message(&matches, today);
            match self
                .channel
                .send(&rule.user_id, &rule.target_id, &body)
                .await
            {
                Ok(()) => {
                    info!(rule_id = %rule.id, target = %rule.target_id, matches = matches.len(), "Notification dispatched");
                    if let Err(e) = self
                        .store
                        .log_dispatch(&rule.user_id, &rule.target_id, &body)
                        .await
                    {
                        warn!(rule_id = %rule.id, "Failed to write dispatch log: {e}");
                    }
                }
                // One-shot best effort: the attempt is still recorded, the
                // same instant is not retried.
                Err(e) => warn!(rule_id = %rule.id, "Channel send failed: {e}"),
            }
        }

        // The attempt counts whether or not a message went out. Next fire
        // is always computed from now, not from the scheduled instant.
        let fired_at = Utc::now();
        let next = next_fire(&rule.schedule, fired_at);
        if let Err(e) = self.store.record_fire(&rule.id, fired_at, next).await {
            // Durability is best effort relative to availability: the
            // in-memory timer keeps its cadence.
            warn!(rule_id = %rule.id, "Failed to persist fire result: {e}");
        }
        self.rearm_if_current(&rule, next, generation);
    }

    /// Skip a fire without consuming it: `last_fired_at` stays untouched
    /// and the rule is re-armed for the next slot of the same schedule.
    async fn skip_and_rearm(self: &Arc<Self>, rule: &NotificationRule, generation: u64) {
        let next = next_fire(&rule.schedule, Utc::now());
        if let Err(e) = self.store.record_next_fire(&rule.id, next).await {
            warn!(rule_id = %rule.id, "Failed to persist deferred fire: {e}");
        }
        self.rearm_if_current(rule, next, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use polibot_dataset::MemoryDatasetLoader;
    use polibot_store::SqliteRuleStore;
    use polibot_types::{DatasetRow, ScheduleKind};

    struct MockChannel {
        connected: AtomicBool,
        fail_sends: AtomicBool,
        sent: tokio::sync::Mutex<Vec<(String, String, String)>>,
    }

    impl MockChannel {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                fail_sends: AtomicBool::new(false),
                sent: tokio::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Channel for MockChannel {
        async fn is_connected(&self, _user_id: &str) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send(&self, user_id: &str, target_id: &str, body: &str) -> anyhow::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                anyhow::bail!("transport rejected the message");
            }
            self.sent
                .lock()
                .await
                .push((user_id.into(), target_id.into(), body.into()));
            Ok(())
        }
    }

    fn today_row(customer: &str) -> DatasetRow {
        DatasetRow {
            expiry: Some(polibot_matcher::format_date(
                chrono::Local::now().date_naive(),
            )),
            customer: customer.into(),
            plate: "34 A 1".into(),
            premium: "100.00".into(),
            company: "Acme".into(),
        }
    }

    async fn setup(
        connected: bool,
    ) -> (
        Arc<SchedulerCore>,
        Arc<SqliteRuleStore>,
        Arc<MemoryDatasetLoader>,
        Arc<MockChannel>,
    ) {
        let store = Arc::new(SqliteRuleStore::open_in_memory().unwrap());
        let loader = Arc::new(MemoryDatasetLoader::new());
        let channel = MockChannel::new(connected);
        let core = SchedulerCore::new(store.clone(), loader.clone(), channel.clone());
        (core, store, loader, channel)
    }

    fn spec(target: &str) -> RuleSpec {
        RuleSpec {
            user_id: "u-1".into(),
            target_id: target.into(),
            dataset_ref: "policies".into(),
            schedule: ScheduleKind::Daily {
                time_of_day: "09:00".into(),
            },
        }
    }

    fn stored_rule(
        id: &str,
        schedule: ScheduleKind,
        last: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> NotificationRule {
        NotificationRule {
            id: id.into(),
            user_id: "u-1".into(),
            target_id: "g-1".into(),
            dataset_ref: "policies".into(),
            schedule,
            last_fired_at: last,
            next_fire_at: next,
            active: true,
            created_at: Utc::now(),
        }
    }

    // ─── catch-up decision table ───────────────────────────

    #[test]
    fn test_catch_up_already_satisfied_today_resumes() {
        let now = Utc::now();
        let next = now + Duration::hours(2);
        assert_eq!(
            catch_up_action(Some(now - Duration::hours(1)), Some(next), now),
            CatchUpAction::Resume(next)
        );
    }

    #[test]
    fn test_catch_up_never_scheduled_arms_fresh() {
        let now = Utc::now();
        assert_eq!(catch_up_action(None, None, now), CatchUpAction::ArmFresh);
        assert_eq!(
            catch_up_action(None, Some(now + Duration::hours(1)), now),
            CatchUpAction::ArmFresh
        );
        assert_eq!(
            catch_up_action(Some(now), None, now),
            CatchUpAction::ArmFresh
        );
    }

    #[test]
    fn test_catch_up_missed_deadline_fires_now() {
        let now = Utc::now();
        assert_eq!(
            catch_up_action(
                Some(now - Duration::days(2)),
                Some(now - Duration::minutes(2)),
                now
            ),
            CatchUpAction::FireNow
        );
    }

    #[test]
    fn test_catch_up_future_slot_resumes() {
        let now = Utc::now();
        let next = now + Duration::hours(3);
        assert_eq!(
            catch_up_action(Some(now - Duration::days(1)), Some(next), now),
            CatchUpAction::Resume(next)
        );
    }

    // ─── rule management ───────────────────────────────────

    #[tokio::test]
    async fn test_create_rule_arms_and_persists_next_fire() {
        let (core, store, _, _) = setup(true).await;
        let id = core.create_rule(spec("g-1")).await.unwrap();

        assert_eq!(core.armed_rules(), vec![id.clone()]);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert!(stored.next_fire_at.is_some());
        assert!(stored.last_fired_at.is_none());
        assert!(stored.active);
    }

    #[tokio::test]
    async fn test_create_rule_rejects_duplicate_target() {
        let (core, _, _, _) = setup(true).await;
        core.create_rule(spec("g-1")).await.unwrap();
        assert!(matches!(
            core.create_rule(spec("g-1")).await,
            Err(SchedulerError::DuplicateTarget(_))
        ));
        // A different target is fine.
        core.create_rule(spec("g-2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rule_rejects_invalid_schedule() {
        let (core, _, _, _) = setup(true).await;
        let mut bad = spec("g-1");
        bad.schedule = ScheduleKind::Hourly { interval_hours: 0 };
        assert!(matches!(
            core.create_rule(bad).await,
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[tokio::test]
    async fn test_update_rule_replaces_schedule_and_timer() {
        let (core, store, _, _) = setup(true).await;
        let id = core.create_rule(spec("g-1")).await.unwrap();

        let mut updated = spec("g-1");
        updated.schedule = ScheduleKind::Minute {
            interval_minutes: Some(30),
        };
        core.update_rule(&id, updated).await.unwrap();

        assert_eq!(core.armed_rules().len(), 1);
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(
            stored.schedule,
            ScheduleKind::Minute {
                interval_minutes: Some(30)
            }
        );
    }

    #[tokio::test]
    async fn test_update_unknown_rule() {
        let (core, _, _, _) = setup(true).await;
        assert!(matches!(
            core.update_rule("ghost", spec("g-1")).await,
            Err(SchedulerError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_requires_ownership() {
        let (core, _, _, _) = setup(true).await;
        let id = core.create_rule(spec("g-1")).await.unwrap();

        let mut foreign = spec("g-1");
        foreign.user_id = "u-2".into();
        assert!(matches!(
            core.update_rule(&id, foreign).await,
            Err(SchedulerError::RuleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deactivate_cancels_timer_and_hides_rule() {
        let (core, _, _, _) = setup(true).await;
        let id = core.create_rule(spec("g-1")).await.unwrap();

        assert!(core.deactivate_rule(&id, "u-1").await.unwrap());
        assert!(core.armed_rules().is_empty());
        assert!(core.list_rules("u-1").await.unwrap().is_empty());
        // Idempotent.
        assert!(!core.deactivate_rule(&id, "u-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rearm_twice_keeps_single_timer() {
        let (core, store, _, _) = setup(true).await;
        let rule = stored_rule(
            "r-1",
            ScheduleKind::Daily {
                time_of_day: "09:00".into(),
            },
            None,
            None,
        );
        store.upsert(&rule).await.unwrap();

        // Duplicate reconnect events must not duplicate timers.
        core.rearm_all("u-1").await.unwrap();
        core.rearm_all("u-1").await.unwrap();
        assert_eq!(core.armed_rules().len(), 1);
    }

    // ─── firing behavior ───────────────────────────────────

    #[tokio::test]
    async fn test_overdue_rule_fires_immediately_on_rearm() {
        let (core, store, loader, channel) = setup(true).await;
        loader
            .insert("policies", vec![today_row("Alice")])
            .await;
        let now = Utc::now();
        let rule = stored_rule(
            "r-1",
            ScheduleKind::Minute {
                interval_minutes: Some(5),
            },
            Some(now - Duration::days(1)),
            Some(now - Duration::minutes(2)),
        );
        store.upsert(&rule).await.unwrap();

        core.rearm_all("u-1").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        let sent = channel.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "g-1");
        assert!(sent[0].2.contains("Customer: Alice"));
        assert!(sent[0].2.contains("Total: 1"));

        let stored = store.get("r-1").await.unwrap().unwrap();
        assert!(stored.last_fired_at.unwrap() >= now);
        // Next slot computed from the actual fire time, 5 minutes out.
        let next = stored.next_fire_at.unwrap();
        assert!(next > now + Duration::minutes(4));
        assert!(next <= Utc::now() + Duration::minutes(5));
        assert_eq!(core.armed_rules(), vec!["r-1".to_string()]);
    }

    // Arming at an already-due instant makes the sleeper expire
    // immediately on another worker; the fire must still find its own slot
    // registered. Many rules at once to shake out slot registration racing
    // the zero-delay sleeper.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_overdue_rule_fires_after_rearm() {
        let (core, store, loader, channel) = setup(true).await;
        loader.insert("policies", vec![today_row("Alice")]).await;
        let now = Utc::now();
        for i in 0..10 {
            let mut rule = stored_rule(
                &format!("r-{i}"),
                ScheduleKind::Minute {
                    interval_minutes: Some(5),
                },
                Some(now - Duration::days(1)),
                Some(now - Duration::minutes(1)),
            );
            rule.target_id = format!("g-{i}");
            store.upsert(&rule).await.unwrap();
        }

        core.rearm_all("u-1").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        assert_eq!(channel.sent.lock().await.len(), 10);
        assert_eq!(core.armed_rules().len(), 10);
    }

    #[tokio::test]
    async fn test_send_failure_still_consumes_fire_and_rearms() {
        let (core, store, loader, channel) = setup(true).await;
        channel.fail_sends.store(true, Ordering::SeqCst);
        loader.insert("policies", vec![today_row("Alice")]).await;
        let now = Utc::now();
        let rule = stored_rule(
            "r-1",
            ScheduleKind::Minute {
                interval_minutes: Some(5),
            },
            Some(now - Duration::days(1)),
            Some(now - Duration::minutes(1)),
        );
        store.upsert(&rule).await.unwrap();

        core.rearm_all("u-1").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        // One-shot best effort: nothing delivered, nothing audit-logged,
        // but the attempt is consumed and the cadence continues.
        assert!(channel.sent.lock().await.is_empty());
        assert!(store.dispatch_history("u-1").await.unwrap().is_empty());
        let stored = store.get("r-1").await.unwrap().unwrap();
        assert!(stored.last_fired_at.unwrap() >= now);
        assert!(stored.next_fire_at.unwrap() > now);
        assert_eq!(core.armed_rules(), vec!["r-1".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_matches_records_attempt_without_send() {
        let (core, store, loader, channel) = setup(true).await;
        let tomorrow = chrono::Local::now().date_naive() + Duration::days(1);
        loader
            .insert(
                "policies",
                vec![DatasetRow {
                    expiry: Some(polibot_matcher::format_date(tomorrow)),
                    customer: "Bob".into(),
                    plate: String::new(),
                    premium: String::new(),
                    company: String::new(),
                }],
            )
            .await;
        let now = Utc::now();
        let rule = stored_rule(
            "r-1",
            ScheduleKind::Minute {
                interval_minutes: Some(5),
            },
            Some(now - Duration::days(1)),
            Some(now - Duration::minutes(1)),
        );
        store.upsert(&rule).await.unwrap();

        core.rearm_all("u-1").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        assert!(channel.sent.lock().await.is_empty());
        let stored = store.get("r-1").await.unwrap().unwrap();
        // Attempt recorded even though nothing was sent.
        assert!(stored.last_fired_at.is_some());
    }

    #[tokio::test]
    async fn test_disconnected_channel_defers_without_consuming_fire() {
        let (core, store, loader, channel) = setup(false).await;
        loader.insert("policies", vec![today_row("Alice")]).await;
        let now = Utc::now();
        let rule = stored_rule(
            "r-1",
            ScheduleKind::Minute {
                interval_minutes: Some(5),
            },
            Some(now - Duration::days(1)),
            Some(now - Duration::minutes(1)),
        );
        store.upsert(&rule).await.unwrap();

        core.rearm_all("u-1").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        assert!(channel.sent.lock().await.is_empty());
        let stored = store.get("r-1").await.unwrap().unwrap();
        // Not consumed as fired; retry slot persisted.
        assert_eq!(
            stored.last_fired_at.unwrap().timestamp(),
            (now - Duration::days(1)).timestamp()
        );
        assert!(stored.next_fire_at.unwrap() > now);
        assert_eq!(core.armed_rules(), vec!["r-1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_dataset_defers_fire() {
        let (core, store, _, channel) = setup(true).await;
        let now = Utc::now();
        let rule = stored_rule(
            "r-1",
            ScheduleKind::Minute {
                interval_minutes: Some(5),
            },
            Some(now - Duration::days(1)),
            Some(now - Duration::minutes(1)),
        );
        store.upsert(&rule).await.unwrap();

        core.rearm_all("u-1").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        assert!(channel.sent.lock().await.is_empty());
        let stored = store.get("r-1").await.unwrap().unwrap();
        assert_eq!(
            stored.last_fired_at.unwrap().timestamp(),
            (now - Duration::days(1)).timestamp()
        );
        assert_eq!(core.armed_rules(), vec!["r-1".to_string()]);
    }

    #[tokio::test]
    async fn test_deactivation_during_fire_prevents_rearm() {
        let (core, store, loader, _) = setup(true).await;
        loader.insert("policies", vec![today_row("Alice")]).await;
        let now = Utc::now();
        let rule = stored_rule(
            "r-1",
            ScheduleKind::Minute {
                interval_minutes: Some(5),
            },
            Some(now - Duration::days(1)),
            Some(now - Duration::minutes(1)),
        );
        store.upsert(&rule).await.unwrap();

        core.rearm_all("u-1").await.unwrap();
        // Deactivate while the immediate fire may still be in flight: the
        // fire may complete, but no re-arm survives it.
        assert!(core.deactivate_rule("r-1", "u-1").await.unwrap());
        tokio::time::sleep(StdDuration::from_millis(200)).await;

        assert!(core.armed_rules().is_empty());
        assert!(core.list_rules("u-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_survives_poisoned_lock() {
        let (core, _, _, _) = setup(true).await;
        core.create_rule(spec("g-1")).await.unwrap();

        // Panic while holding the registry lock on another thread.
        let core2 = core.clone();
        let _ = std::thread::spawn(move || {
            let _guard = core2.timers.lock().unwrap();
            panic!("holder panicked");
        })
        .join();

        // The map is still sound; registry operations keep working.
        assert_eq!(core.armed_rules().len(), 1);
        core.shutdown();
        assert!(core.armed_rules().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let (core, _, _, _) = setup(true).await;
        core.create_rule(spec("g-1")).await.unwrap();
        core.create_rule(spec("g-2")).await.unwrap();
        assert_eq!(core.armed_rules().len(), 2);

        core.shutdown();
        assert!(core.armed_rules().is_empty());
    }
}
