//! Structured (JSON) events received over the text channel.
//!
//! Chat, comments and notifications live outside the collaboration core.
//! Whoever owns them plugs in through [`EventHandler`].

use async_trait::async_trait;

use crate::broadcast::ConnectionInfo;
use crate::protocol::StructuredEvent;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, connection: &ConnectionInfo, event: StructuredEvent);
}

/// Default handler: logs the event type and drops it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventHandler;

#[async_trait]
impl EventHandler for LogEventHandler {
    async fn handle(&self, connection: &ConnectionInfo, event: StructuredEvent) {
        log::debug!(
            "Ignoring '{}' event from connection {} on document {}",
            event.event_type,
            connection.id,
            connection.document_id
        );
    }
}
