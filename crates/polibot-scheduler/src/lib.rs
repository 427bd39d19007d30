//! polibot-scheduler: the recurring notification scheduler.
//!
//! Owns one timer per active rule. On fire it fetches the rule's dataset,
//! matches rows expiring today, dispatches through the channel, persists
//! the new fire timestamps and re-arms. Rule mutations (create, update,
//! deactivate) and channel reconnects re-arm timers without ever leaving a
//! rule silently dropped or duplicated.

pub mod calc;
pub mod channel;
pub mod core;
pub mod error;
pub mod service;

pub use crate::channel::{run_event_loop, Channel};
pub use crate::core::SchedulerCore;
pub use crate::error::SchedulerError;
pub use crate::service::NotificationService;
