//! Messaging channel boundary.
//!
//! The scheduler never talks to the transport directly; it checks
//! connectivity, sends rendered bodies, and reacts to connection events.
//! Session establishment, pairing and reconnect detection live behind this
//! trait.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use polibot_types::ChannelEvent;

use crate::core::SchedulerCore;

/// Transport-side contract for dispatching notifications.
///
/// Use `&self` for all methods; implementations should use interior
/// mutability for any mutable state.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Whether the user's messaging session is currently connected.
    async fn is_connected(&self, user_id: &str) -> bool;

    /// Deliver `body` to `target_id` on behalf of `user_id`.
    async fn send(&self, user_id: &str, target_id: &str, body: &str) -> anyhow::Result<()>;
}

/// Consume channel connection events and drive the scheduler.
///
/// Connected re-arms every rule of the user (with catch-up); Disconnected
/// cancels nothing: timers keep running and the next send is gated by
/// `is_connected`. Should be spawned as a background task.
pub async fn run_event_loop(core: Arc<SchedulerCore>, mut rx: mpsc::Receiver<ChannelEvent>) {
    info!("Channel event loop started");
    while let Some(event) = rx.recv().await {
        match event {
            ChannelEvent::Connected { user_id } => {
                info!(user = %user_id, "Channel connected, re-arming rules");
                if let Err(e) = core.rearm_all(&user_id).await {
                    warn!(user = %user_id, "Re-arm after reconnect failed: {e}");
                }
            }
            ChannelEvent::Disconnected { user_id } => {
                info!(user = %user_id, "Channel disconnected, timers keep running");
            }
        }
    }
    info!("Channel event loop stopped");
}
