//! Notification dispatch collaborator.
//!
//! Fire-and-forget: failures are logged and never propagated to the
//! sender, since they are not required for message durability.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        conversation_id: &str,
        message_id: &str,
        recipient_ids: &[String],
    ) -> Result<()>;
}

/// Default dispatcher: logs the request and does nothing else. Real
/// providers plug in behind the same trait.
pub struct LogOnlyDispatcher;

#[async_trait]
impl NotificationDispatcher for LogOnlyDispatcher {
    async fn dispatch(
        &self,
        conversation_id: &str,
        message_id: &str,
        recipient_ids: &[String],
    ) -> Result<()> {
        info!(
            "[Notify] message {} in {} for {} recipients",
            message_id,
            conversation_id,
            recipient_ids.len()
        );
        Ok(())
    }
}
