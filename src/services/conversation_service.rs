use crate::error::AppError;
use crate::models::{Member, Message, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

/// Who belongs to a conversation, and how far they have read.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Current members of a live (not deleted) conversation. Empty when unknown.
    async fn members(&self, conversation_id: Uuid) -> Result<Vec<Member>, AppError>;

    /// Move the member's read cursor forward to `at`. Never moves it backwards.
    async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .members(conversation_id)
            .await?
            .iter()
            .any(|m| m.user_id == user_id))
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: NewMessage) -> Result<Message, AppError>;

    /// Full history, oldest first.
    async fn history(&self, conversation_id: Uuid) -> Result<Vec<Message>, AppError>;
}

/// PostgreSQL backed conversation store.
#[derive(Clone)]
pub struct PgConversationStore {
    db: Pool,
}

impl PgConversationStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }
}

fn member_from_row(row: &Row) -> Member {
    Member {
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        last_read_at: row.get("last_read_at"),
    }
}

fn message_from_row(row: &Row) -> Message {
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        body: row.get("body"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl MembershipStore for PgConversationStore {
    async fn members(&self, conversation_id: Uuid) -> Result<Vec<Member>, AppError> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                r#"
                SELECT cm.conversation_id, cm.user_id, cm.last_read_at
                FROM conversation_members cm
                JOIN conversations c ON c.id = cm.conversation_id
                WHERE cm.conversation_id = $1
                  AND c.deleted_at IS NULL
                ORDER BY cm.created_at
                "#,
                &[&conversation_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("members: {e}")))?;

        Ok(rows.iter().map(member_from_row).collect())
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let client = self.db.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE conversation_members
                SET last_read_at = GREATEST(last_read_at, $3)
                WHERE conversation_id = $1 AND user_id = $2
                "#,
                &[&conversation_id, &user_id, &at],
            )
            .await
            .map_err(|e| AppError::Database(format!("mark_read: {e}")))?;

        if updated != 1 {
            return Err(AppError::Database(format!(
                "mark_read: expected 1 row for user {user_id} in conversation {conversation_id}, updated {updated}"
            )));
        }
        Ok(())
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, AppError> {
        let client = self.db.get().await?;
        let rec = client
            .query_opt(
                r#"
                SELECT 1
                FROM conversation_members cm
                JOIN conversations c ON c.id = cm.conversation_id
                WHERE cm.conversation_id = $1
                  AND cm.user_id = $2
                  AND c.deleted_at IS NULL
                LIMIT 1
                "#,
                &[&conversation_id, &user_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("is_member: {e}")))?;
        Ok(rec.is_some())
    }
}

#[async_trait]
impl MessageStore for PgConversationStore {
    async fn append(&self, message: NewMessage) -> Result<Message, AppError> {
        let client = self.db.get().await?;
        // every process consumes the same envelope; the first insert wins
        let inserted = client
            .query_opt(
                r#"
                INSERT INTO messages (id, conversation_id, sender_id, body, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
                RETURNING id, conversation_id, sender_id, body, created_at
                "#,
                &[
                    &message.id,
                    &message.conversation_id,
                    &message.sender_id,
                    &message.body,
                    &message.created_at,
                ],
            )
            .await
            .map_err(|e| AppError::Database(format!("append message: {e}")))?;

        if let Some(row) = inserted {
            return Ok(message_from_row(&row));
        }

        let row = client
            .query_one(
                r#"
                SELECT id, conversation_id, sender_id, body, created_at
                FROM messages
                WHERE id = $1
                "#,
                &[&message.id],
            )
            .await
            .map_err(|e| AppError::Database(format!("append message: {e}")))?;
        Ok(message_from_row(&row))
    }

    async fn history(&self, conversation_id: Uuid) -> Result<Vec<Message>, AppError> {
        let client = self.db.get().await?;
        let rows = client
            .query(
                r#"
                SELECT id, conversation_id, sender_id, body, created_at
                FROM messages
                WHERE conversation_id = $1
                ORDER BY created_at ASC, id ASC
                "#,
                &[&conversation_id],
            )
            .await
            .map_err(|e| AppError::Database(format!("history: {e}")))?;

        Ok(rows.iter().map(message_from_row).collect())
    }
}
