use crate::models::NewMessage;
use crate::services::conversation_service::{MembershipStore, MessageStore};
use crate::transport::{EnvelopeHandler, HandlerError};
use crate::websocket::message_types::{Envelope, MessageType};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Writes published envelopes to durable storage.
///
/// Runs on its own subscription, independent of live delivery: a message can reach
/// connected clients and still fail to persist. That window is accepted; history
/// replay on reconnect shows only what was stored.
pub struct PersistenceConsumer {
    members: Arc<dyn MembershipStore>,
    messages: Arc<dyn MessageStore>,
}

impl PersistenceConsumer {
    pub fn new(members: Arc<dyn MembershipStore>, messages: Arc<dyn MessageStore>) -> Self {
        Self { members, messages }
    }

    pub async fn on_envelope(&self, envelope: Envelope) -> Result<(), HandlerError> {
        match envelope.message_type {
            MessageType::Message => {
                let stored = self
                    .messages
                    .append(NewMessage {
                        id: envelope.message_id,
                        conversation_id: envelope.conversation_id,
                        sender_id: envelope.user_id,
                        body: envelope.message,
                        created_at: envelope.timestamp,
                    })
                    .await
                    .map_err(|e| HandlerError::Store(e.to_string()))?;
                debug!(
                    message_id = %stored.id,
                    conversation_id = %stored.conversation_id,
                    "Message persisted"
                );
            }
            MessageType::Read => {
                self.members
                    .mark_read(envelope.conversation_id, envelope.user_id, envelope.timestamp)
                    .await
                    .map_err(|e| HandlerError::Store(e.to_string()))?;
                debug!(
                    user_id = %envelope.user_id,
                    conversation_id = %envelope.conversation_id,
                    "Read cursor updated"
                );
            }
            MessageType::Leave => {
                warn!(
                    user_id = %envelope.user_id,
                    conversation_id = %envelope.conversation_id,
                    "Ignoring published Leave envelope"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EnvelopeHandler for PersistenceConsumer {
    fn name(&self) -> &'static str {
        "db"
    }

    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        self.on_envelope(envelope).await
    }
}
