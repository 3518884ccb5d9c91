// src/services/chat_store.rs
// Durable chats and their append-only message history
use crate::models::chat::{Chat, ChatUpdate, Message, MessageRow, NewMessage, DEFAULT_CHAT_TITLE};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, user_id: &str, model: &str) -> StoreResult<Chat>;

    /// Most recently updated first.
    async fn list_chats(&self, user_id: &str) -> StoreResult<Vec<Chat>>;

    /// Returns `None` when the chat does not exist or belongs to someone else.
    async fn find_chat_by_id(&self, chat_id: Uuid, user_id: &str) -> StoreResult<Option<Chat>>;

    async fn update_chat(&self, chat_id: Uuid, update: ChatUpdate) -> StoreResult<()>;

    async fn create_message(&self, message: NewMessage) -> StoreResult<Message>;

    async fn update_message(&self, message_id: Uuid, content: &str) -> StoreResult<()>;

    /// The last `limit` messages, oldest first.
    async fn list_recent_messages(&self, chat_id: Uuid, limit: usize) -> StoreResult<Vec<Message>>;

    async fn list_messages(&self, chat_id: Uuid) -> StoreResult<Vec<Message>>;

    async fn count_messages(&self, chat_id: Uuid) -> StoreResult<i64>;
}

pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_messages(rows: Vec<MessageRow>) -> StoreResult<Vec<Message>> {
    rows.into_iter()
        .map(|row| Message::try_from(row).map_err(StoreError::Corrupt))
        .collect()
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn create_chat(&self, user_id: &str, model: &str) -> StoreResult<Chat> {
        let chat = sqlx::query_as::<_, Chat>(
            r#"
            INSERT INTO chats (id, user_id, title, model, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING id, user_id, title, model, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(DEFAULT_CHAT_TITLE)
        .bind(model)
        .fetch_one(&self.pool)
        .await?;

        Ok(chat)
    }

    async fn list_chats(&self, user_id: &str) -> StoreResult<Vec<Chat>> {
        let chats = sqlx::query_as::<_, Chat>(
            "SELECT id, user_id, title, model, created_at, updated_at FROM chats WHERE user_id = $1 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(chats)
    }

    async fn find_chat_by_id(&self, chat_id: Uuid, user_id: &str) -> StoreResult<Option<Chat>> {
        let chat = sqlx::query_as::<_, Chat>(
            "SELECT id, user_id, title, model, created_at, updated_at FROM chats WHERE id = $1 AND user_id = $2",
        )
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(chat)
    }

    async fn update_chat(&self, chat_id: Uuid, update: ChatUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE chats SET title = COALESCE($2, title), updated_at = $3 WHERE id = $1",
        )
        .bind(chat_id)
        .bind(update.title)
        .bind(update.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "chat", id: chat_id });
        }
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> StoreResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (id, chat_id, role, content, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, chat_id, role, content, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message.chat_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Message::try_from(row).map_err(StoreError::Corrupt)
    }

    async fn update_message(&self, message_id: Uuid, content: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE messages SET content = $2 WHERE id = $1")
            .bind(message_id)
            .bind(content)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "message", id: message_id });
        }
        Ok(())
    }

    async fn list_recent_messages(&self, chat_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, chat_id, role, content, created_at FROM (
                SELECT id, chat_id, role, content, created_at, seq
                FROM messages WHERE chat_id = $1
                ORDER BY seq DESC
                LIMIT $2
            ) recent
            ORDER BY seq ASC
            "#,
        )
        .bind(chat_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn list_messages(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, chat_id, role, content, created_at FROM messages WHERE chat_id = $1 ORDER BY seq ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        into_messages(rows)
    }

    async fn count_messages(&self, chat_id: Uuid) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE chat_id = $1")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
