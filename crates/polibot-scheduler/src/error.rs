//! Scheduler error taxonomy.
//!
//! Mutation calls surface these synchronously to the caller. Transient
//! failures during a fire (channel down, dataset unavailable, persist
//! errors) are absorbed inside the timer callback and never reach this
//! level; rule-level faults stay rule-level.

use polibot_dataset::DatasetError;
use polibot_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid schedule parameters, rejected at create/update.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A second active rule for the same (user, target) pair.
    #[error("an active rule already exists for target {0}")]
    DuplicateTarget(String),

    /// Unknown rule id.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// Manual send requested for a target with no active rule.
    #[error("no rule configured for target {0}")]
    NoRuleConfigured(String),

    /// The channel is not connected for this user.
    #[error("channel not connected for user {0}")]
    ChannelUnavailable(String),

    /// A manual send reached the channel but delivery failed.
    #[error("failed to dispatch notification: {0}")]
    Dispatch(#[source] anyhow::Error),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
