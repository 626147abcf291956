//! In-process conversation store, for single-process setups and tests.

use super::conversation_service::{MembershipStore, MessageStore};
use crate::error::AppError;
use crate::models::{Conversation, Member, Message, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug)]
struct ConversationRecord {
    conversation: Conversation,
    members: Vec<Member>,
    messages: Vec<Message>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryConversationStore {
    inner: Arc<RwLock<HashMap<Uuid, ConversationRecord>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a conversation about `item_id` with the given members.
    pub async fn create_conversation(&self, item_id: Uuid, members: &[Uuid]) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            item_id,
            created_at: now,
        };
        let members = members
            .iter()
            .map(|&user_id| Member {
                conversation_id: conversation.id,
                user_id,
                last_read_at: now,
            })
            .collect();

        self.inner.write().await.insert(
            conversation.id,
            ConversationRecord {
                conversation: conversation.clone(),
                members,
                messages: Vec::new(),
            },
        );
        conversation
    }

    pub async fn conversation(&self, conversation_id: Uuid) -> Option<Conversation> {
        let guard = self.inner.read().await;
        guard.get(&conversation_id).map(|r| r.conversation.clone())
    }

    pub async fn member(&self, conversation_id: Uuid, user_id: Uuid) -> Option<Member> {
        let guard = self.inner.read().await;
        guard
            .get(&conversation_id)?
            .members
            .iter()
            .find(|m| m.user_id == user_id)
            .cloned()
    }

    pub async fn message_count(&self, conversation_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard
            .get(&conversation_id)
            .map(|r| r.messages.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MembershipStore for MemoryConversationStore {
    async fn members(&self, conversation_id: Uuid) -> Result<Vec<Member>, AppError> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(&conversation_id)
            .map(|r| r.members.clone())
            .unwrap_or_default())
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut guard = self.inner.write().await;
        let member = guard
            .get_mut(&conversation_id)
            .and_then(|r| r.members.iter_mut().find(|m| m.user_id == user_id))
            .ok_or_else(|| {
                AppError::Database(format!(
                    "mark_read: user {user_id} is not a member of conversation {conversation_id}"
                ))
            })?;

        member.last_read_at = member.last_read_at.max(at);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryConversationStore {
    async fn append(&self, message: NewMessage) -> Result<Message, AppError> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&message.conversation_id).ok_or_else(|| {
            AppError::Database(format!(
                "append message: conversation {} does not exist",
                message.conversation_id
            ))
        })?;

        if let Some(existing) = record.messages.iter().find(|m| m.id == message.id) {
            return Ok(existing.clone());
        }

        let stored = Message {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body,
            created_at: message.created_at,
        };
        record.messages.push(stored.clone());
        Ok(stored)
    }

    async fn history(&self, conversation_id: Uuid) -> Result<Vec<Message>, AppError> {
        let guard = self.inner.read().await;
        let mut messages = guard
            .get(&conversation_id)
            .map(|r| r.messages.clone())
            .unwrap_or_default();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }
}
