// src/services/memory_store.rs
// Process-local chat store for development mode and tests
use super::chat_store::{ChatStore, StoreError, StoreResult};
use crate::models::chat::{Chat, ChatUpdate, Message, NewMessage, DEFAULT_CHAT_TITLE};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    chats: HashMap<Uuid, Chat>,
    /// Append order is creation order.
    messages: Vec<Message>,
}

#[derive(Default)]
pub struct InMemoryChatStore {
    inner: RwLock<Inner>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_chat(&self, user_id: &str, model: &str) -> StoreResult<Chat> {
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: DEFAULT_CHAT_TITLE.to_string(),
            model: model.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn list_chats(&self, user_id: &str) -> StoreResult<Vec<Chat>> {
        let inner = self.inner.read().await;
        let mut chats: Vec<Chat> = inner
            .chats
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn find_chat_by_id(&self, chat_id: Uuid, user_id: &str) -> StoreResult<Option<Chat>> {
        let inner = self.inner.read().await;
        Ok(inner
            .chats
            .get(&chat_id)
            .filter(|c| c.user_id == user_id)
            .cloned())
    }

    async fn update_chat(&self, chat_id: Uuid, update: ChatUpdate) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let chat = inner
            .chats
            .get_mut(&chat_id)
            .ok_or(StoreError::NotFound { entity: "chat", id: chat_id })?;
        if let Some(title) = update.title {
            chat.title = title;
        }
        chat.updated_at = update.updated_at;
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> StoreResult<Message> {
        let mut inner = self.inner.write().await;
        if !inner.chats.contains_key(&message.chat_id) {
            return Err(StoreError::NotFound { entity: "chat", id: message.chat_id });
        }
        let message = Message {
            id: Uuid::new_v4(),
            chat_id: message.chat_id,
            role: message.role,
            content: message.content,
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn update_message(&self, message_id: Uuid, content: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(StoreError::NotFound { entity: "message", id: message_id })?;
        message.content = content.to_string();
        Ok(())
    }

    async fn list_recent_messages(&self, chat_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        let all = self.list_messages(chat_id).await?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn list_messages(&self, chat_id: Uuid) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn count_messages(&self, chat_id: Uuid) -> StoreResult<i64> {
        let inner = self.inner.read().await;
        Ok(inner.messages.iter().filter(|m| m.chat_id == chat_id).count() as i64)
    }
}
