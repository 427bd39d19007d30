//! On-demand notification sending, bypassing the timers.

use std::sync::Arc;

use tracing::info;

use polibot_matcher::{expiring_today, render_message};

use crate::core::SchedulerCore;
use crate::error::SchedulerError;

/// Thin façade over the scheduler's collaborators for manual ("send now")
/// invocation. Manual sends are out of band: they never touch
/// `last_fired_at`/`next_fire_at`, but successful dispatches still land in
/// the audit log.
pub struct NotificationService {
    core: Arc<SchedulerCore>,
}

impl NotificationService {
    pub fn new(core: Arc<SchedulerCore>) -> Self {
        Self { core }
    }

    /// Evaluate and dispatch immediately for one target. Requires an
    /// active rule for the target and a connected channel. Returns the
    /// number of matching rows (0 means evaluated, nothing to send).
    pub async fn send_now(&self, user_id: &str, target_id: &str) -> Result<usize, SchedulerError> {
        let rules = self.core.store.load_active(user_id).await?;
        let rule = rules
            .iter()
            .find(|r| r.target_id == target_id)
            .ok_or_else(|| SchedulerError::NoRuleConfigured(target_id.to_string()))?;

        if !self.core.channel.is_connected(user_id).await {
            return Err(SchedulerError::ChannelUnavailable(user_id.to_string()));
        }

        let rows = self.core.loader.load_rows(&rule.dataset_ref).await?;
        let today = chrono::Local::now().date_naive();
        let matches = expiring_today(&rows, today);
        if matches.is_empty() {
            info!(user = %user_id, target = %target_id, "Manual send: nothing expiring today");
            return Ok(0);
        }

        let body = render_message(&matches, today);
        self.core
            .channel
            .send(user_id, target_id, &body)
            .await
            .map_err(SchedulerError::Dispatch)?;
        info!(user = %user_id, target = %target_id, matches = matches.len(), "Manual notification dispatched");
        if let Err(e) = self.core.store.log_dispatch(user_id, target_id, &body).await {
            tracing::warn!(user = %user_id, "Failed to write dispatch log: {e}");
        }
        Ok(matches.len())
    }
}
