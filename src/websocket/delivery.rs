use super::message_types::{Envelope, MessageType, OutboundBatch};
use super::ConnectionRegistry;
use crate::transport::{EnvelopeHandler, HandlerError};
use async_trait::async_trait;
use tracing::debug;

/// Fans published chat lines out to the connections registered in this process.
///
/// Read cursors and Leave signals are not chat lines and are never delivered.
pub struct DeliveryHandler {
    registry: ConnectionRegistry,
}

impl DeliveryHandler {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EnvelopeHandler for DeliveryHandler {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn handle(&self, payload: &str) -> Result<(), HandlerError> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        if envelope.message_type != MessageType::Message {
            return Ok(());
        }

        let delivered = self
            .registry
            .deliver(envelope.conversation_id, &OutboundBatch::single(&envelope))
            .await;
        debug!(
            conversation_id = %envelope.conversation_id,
            delivered,
            "Delivered message to local connections"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::ShardRouter;
    use crate::websocket::ClientHandle;
    use chrono::Utc;
    use uuid::Uuid;

    fn payload(kind: MessageType, conv: Uuid) -> String {
        serde_json::to_string(&Envelope {
            message_id: Uuid::new_v4(),
            message_type: kind,
            message: "hello".into(),
            timestamp: Utc::now(),
            user_id: Uuid::new_v4(),
            conversation_id: conv,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_only_chat_lines_are_delivered() {
        let registry = ConnectionRegistry::new();
        let conv = Uuid::new_v4();
        let group = ShardRouter::with_count(1).unwrap().group_of(conv);
        let (handle, mut rx) = ClientHandle::new(Uuid::new_v4(), conv, group);
        registry.add(handle).await.unwrap();
        let handler = DeliveryHandler::new(registry);

        handler.handle(&payload(MessageType::Read, conv)).await.unwrap();
        handler.handle(&payload(MessageType::Leave, conv)).await.unwrap();
        assert!(rx.try_recv().is_err());

        handler.handle(&payload(MessageType::Message, conv)).await.unwrap();
        let batch: OutboundBatch = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].message, "hello");
    }

    #[tokio::test]
    async fn test_no_local_connections_is_ok() {
        let handler = DeliveryHandler::new(ConnectionRegistry::new());
        assert!(handler
            .handle(&payload(MessageType::Message, Uuid::new_v4()))
            .await
            .is_ok());
        assert!(matches!(
            handler.handle("garbage").await,
            Err(HandlerError::Decode(_))
        ));
    }
}
