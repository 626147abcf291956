use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError, Receiver, Sender},
    RwLock,
};
use uuid::Uuid;

use crate::sharding::ShardGroup;
use message_types::OutboundBatch;

pub mod delivery;
pub mod message_types;
pub mod session;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("user {user_id} already connected to conversation {conversation_id}")]
    DuplicateConnection { user_id: Uuid, conversation_id: Uuid },
}

/// Live connection of one user to one conversation.
///
/// The socket itself is owned by its session actor; the registry only holds the
/// sending half of the channel the actor drains into the socket.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub group: ShardGroup,
    pub connected_at: DateTime<Utc>,
    sender: Sender<String>,
}

pub const DEFAULT_SEND_BUFFER: usize = 256;

impl ClientHandle {
    /// Create a handle plus the receiver its session drains.
    pub fn new(user_id: Uuid, conversation_id: Uuid, group: ShardGroup) -> (Self, Receiver<String>) {
        Self::with_capacity(user_id, conversation_id, group, DEFAULT_SEND_BUFFER)
    }

    /// Like [`ClientHandle::new`] with at most `capacity` undelivered batches queued.
    pub fn with_capacity(
        user_id: Uuid,
        conversation_id: Uuid,
        group: ShardGroup,
        capacity: usize,
    ) -> (Self, Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            connection_id: Uuid::new_v4(),
            user_id,
            conversation_id,
            group,
            connected_at: Utc::now(),
            sender: tx,
        };
        (handle, rx)
    }

    /// Queue a frame without waiting.
    pub fn send(&self, text: String) -> Result<(), TrySendError<String>> {
        self.sender.try_send(text)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Per-process index of live connections: conversation -> user -> handle.
///
/// Delivery takes the shared lock; add/remove take the exclusive one. Writes to
/// clients go through bounded channels with `try_send`, so delivery never waits on a
/// socket; a client whose queue is full is evicted.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, HashMap<Uuid, ClientHandle>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Fails, leaving the existing entry untouched, when the
    /// (user, conversation) pair is already registered.
    pub async fn add(&self, handle: ClientHandle) -> Result<(), RegistryError> {
        let mut guard = self.inner.write().await;
        let users = guard.entry(handle.conversation_id).or_default();

        if users.contains_key(&handle.user_id) {
            return Err(RegistryError::DuplicateConnection {
                user_id: handle.user_id,
                conversation_id: handle.conversation_id,
            });
        }

        tracing::debug!(
            user_id = %handle.user_id,
            conversation_id = %handle.conversation_id,
            group = %handle.group,
            "Registered connection, {} in conversation",
            users.len() + 1
        );
        users.insert(handle.user_id, handle);
        Ok(())
    }

    /// Remove a connection. Unknown pairs are ignored.
    pub async fn remove(&self, user_id: Uuid, conversation_id: Uuid) {
        let mut guard = self.inner.write().await;

        if let Some(users) = guard.get_mut(&conversation_id) {
            if users.remove(&user_id).is_some() {
                tracing::debug!(
                    user_id = %user_id,
                    conversation_id = %conversation_id,
                    remaining = users.len(),
                    "Removed connection"
                );
            }

            if users.is_empty() {
                guard.remove(&conversation_id);
                tracing::debug!(conversation_id = %conversation_id, "Conversation has no local connections");
            }
        }
    }

    /// Remove a connection only if it is still the one identified by `connection_id`.
    ///
    /// A session that lost a registration race must not evict the winner.
    pub async fn remove_connection(&self, user_id: Uuid, conversation_id: Uuid, connection_id: Uuid) {
        {
            let guard = self.inner.read().await;
            let current = guard
                .get(&conversation_id)
                .and_then(|users| users.get(&user_id))
                .map(|h| h.connection_id);
            if current != Some(connection_id) {
                return;
            }
        }
        let mut guard = self.inner.write().await;
        if let Some(users) = guard.get_mut(&conversation_id) {
            if users
                .get(&user_id)
                .is_some_and(|h| h.connection_id == connection_id)
            {
                users.remove(&user_id);
            }
            if users.is_empty() {
                guard.remove(&conversation_id);
            }
        }
    }

    pub async fn get(&self, user_id: Uuid, conversation_id: Uuid) -> Option<ClientHandle> {
        let guard = self.inner.read().await;
        guard
            .get(&conversation_id)
            .and_then(|users| users.get(&user_id))
            .cloned()
    }

    /// Write a batch to every local connection of a conversation.
    ///
    /// Returns the number of connections that accepted it. A closed connection is
    /// logged and skipped; its session removes it on the way out. A connection whose
    /// queue is full is removed here, which ends its session.
    pub async fn deliver(&self, conversation_id: Uuid, batch: &OutboundBatch) -> usize {
        let text = match serde_json::to_string(batch) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, error = %e, "Failed to serialize batch");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut stalled = Vec::new();
        {
            let guard = self.inner.read().await;
            let Some(users) = guard.get(&conversation_id) else {
                return 0;
            };

            for handle in users.values() {
                match handle.send(text.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            user_id = %handle.user_id,
                            conversation_id = %conversation_id,
                            "Client send queue full, dropping connection"
                        );
                        stalled.push((handle.user_id, handle.connection_id));
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::warn!(
                            user_id = %handle.user_id,
                            conversation_id = %conversation_id,
                            "Delivery failed, connection closed"
                        );
                    }
                }
            }
        }

        for (user_id, connection_id) in stalled {
            self.remove_connection(user_id, conversation_id, connection_id)
                .await;
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        let guard = self.inner.read().await;
        guard.values().map(HashMap::len).sum()
    }

    pub async fn conversation_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Users connected locally to a conversation.
    pub async fn users_in(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let guard = self.inner.read().await;
        guard
            .get(&conversation_id)
            .map(|users| users.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::ShardRouter;
    use message_types::{ClientFrame, Envelope, MessageType};

    fn group() -> ShardGroup {
        ShardRouter::with_count(1).unwrap().group(0).unwrap()
    }

    fn batch(text: &str) -> OutboundBatch {
        OutboundBatch::single(&Envelope::from_frame(
            ClientFrame {
                message_type: MessageType::Message,
                message: text.into(),
            },
            Uuid::new_v4(),
            Uuid::new_v4(),
        ))
    }

    #[tokio::test]
    async fn test_deliver_reaches_only_matching_conversation() {
        let registry = ConnectionRegistry::new();
        let conv_k = Uuid::new_v4();
        let conv_j = Uuid::new_v4();
        let (a, mut rx_a) = ClientHandle::new(Uuid::new_v4(), conv_k, group());
        let (b, mut rx_b) = ClientHandle::new(Uuid::new_v4(), conv_k, group());
        let (c, mut rx_c) = ClientHandle::new(Uuid::new_v4(), conv_j, group());
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();
        registry.add(c).await.unwrap();

        assert_eq!(registry.deliver(conv_k, &batch("hi")).await, 2);

        assert!(rx_a.try_recv().unwrap().contains("\"hi\""));
        assert!(rx_b.try_recv().unwrap().contains("\"hi\""));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_add_keeps_original() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let (first, _rx1) = ClientHandle::new(user, conv, group());
        let (second, _rx2) = ClientHandle::new(user, conv, group());
        let first_id = first.connection_id;

        registry.add(first).await.unwrap();
        let err = registry.add(second).await.unwrap_err();

        assert_eq!(
            err,
            RegistryError::DuplicateConnection {
                user_id: user,
                conversation_id: conv
            }
        );
        assert_eq!(registry.get(user, conv).await.unwrap().connection_id, first_id);
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_prunes_conversation() {
        let registry = ConnectionRegistry::new();
        let conv = Uuid::new_v4();
        let (a, _rx_a) = ClientHandle::new(Uuid::new_v4(), conv, group());
        let (b, _rx_b) = ClientHandle::new(Uuid::new_v4(), conv, group());
        let (a_id, b_id) = (a.user_id, b.user_id);
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();

        // never added
        registry.remove(Uuid::new_v4(), Uuid::new_v4()).await;
        registry.remove(Uuid::new_v4(), conv).await;
        assert_eq!(registry.connection_count().await, 2);

        registry.remove(a_id, conv).await;
        registry.remove(a_id, conv).await;
        assert_eq!(registry.users_in(conv).await, vec![b_id]);

        registry.remove(b_id, conv).await;
        assert_eq!(registry.conversation_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_does_not_block_others() {
        let registry = ConnectionRegistry::new();
        let conv = Uuid::new_v4();
        let (a, rx_a) = ClientHandle::new(Uuid::new_v4(), conv, group());
        let (b, mut rx_b) = ClientHandle::new(Uuid::new_v4(), conv, group());
        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();
        drop(rx_a);

        assert_eq!(registry.deliver(conv, &batch("still here")).await, 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_evicts_only_that_client() {
        let registry = ConnectionRegistry::new();
        let conv = Uuid::new_v4();
        let (slow, mut rx_slow) = ClientHandle::with_capacity(Uuid::new_v4(), conv, group(), 1);
        let (fast, mut rx_fast) = ClientHandle::new(Uuid::new_v4(), conv, group());
        let (slow_user, fast_user) = (slow.user_id, fast.user_id);
        registry.add(slow).await.unwrap();
        registry.add(fast).await.unwrap();

        assert_eq!(registry.deliver(conv, &batch("one")).await, 2);
        assert_eq!(registry.deliver(conv, &batch("two")).await, 1);

        assert!(registry.get(slow_user, conv).await.is_none());
        assert!(registry.get(fast_user, conv).await.is_some());
        assert_eq!(rx_fast.try_recv().map(|t| t.contains("\"one\"")), Ok(true));
        assert_eq!(rx_fast.try_recv().map(|t| t.contains("\"two\"")), Ok(true));

        // queued frame still drains, then the channel reports the eviction
        assert!(rx_slow.recv().await.is_some());
        assert!(rx_slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_connection_ignores_stale_id() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let (handle, _rx) = ClientHandle::new(user, conv, group());
        let id = handle.connection_id;
        registry.add(handle).await.unwrap();

        registry.remove_connection(user, conv, Uuid::new_v4()).await;
        assert!(registry.get(user, conv).await.is_some());

        registry.remove_connection(user, conv, id).await;
        assert!(registry.get(user, conv).await.is_none());
        assert_eq!(registry.conversation_count().await, 0);
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_conversation() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.deliver(Uuid::new_v4(), &batch("x")).await, 0);
    }
}
