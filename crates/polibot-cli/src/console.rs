//! Console channel: an always-connected transport that prints dispatched
//! notifications to stdout. Useful for local runs and for verifying rules
//! without a real messaging session.

use polibot_scheduler::Channel;

pub struct ConsoleChannel;

#[async_trait::async_trait]
impl Channel for ConsoleChannel {
    async fn is_connected(&self, _user_id: &str) -> bool {
        true
    }

    async fn send(&self, user_id: &str, target_id: &str, body: &str) -> anyhow::Result<()> {
        println!("── notification for {user_id} → {target_id} ──");
        println!("{body}");
        println!("──────────────────────────────────────────────");
        Ok(())
    }
}
