// src/ai/credentials.rs
// Per-user provider API keys
use super::ProviderKind;
use crate::services::chat_store::{StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait ProviderCredentialStore: Send + Sync {
    async fn get_key(&self, user_id: &str, provider: ProviderKind) -> StoreResult<Option<String>>;

    async fn set_key(&self, user_id: &str, provider: ProviderKind, api_key: &str) -> StoreResult<()>;

    /// Returns whether a key was removed.
    async fn delete_key(&self, user_id: &str, provider: ProviderKind) -> StoreResult<bool>;

    async fn list_providers(&self, user_id: &str) -> StoreResult<Vec<ProviderKind>>;
}

pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProviderCredentialStore for PgCredentialStore {
    async fn get_key(&self, user_id: &str, provider: ProviderKind) -> StoreResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT api_key FROM user_api_keys WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(key,)| key))
    }

    async fn set_key(&self, user_id: &str, provider: ProviderKind, api_key: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_api_keys (user_id, provider, api_key, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (user_id, provider)
            DO UPDATE SET api_key = EXCLUDED.api_key, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(api_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_key(&self, user_id: &str, provider: ProviderKind) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM user_api_keys WHERE user_id = $1 AND provider = $2")
            .bind(user_id)
            .bind(provider.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_providers(&self, user_id: &str) -> StoreResult<Vec<ProviderKind>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT provider FROM user_api_keys WHERE user_id = $1 ORDER BY provider",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(provider,)| provider.parse().map_err(StoreError::Corrupt))
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    keys: RwLock<HashMap<(String, ProviderKind), String>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProviderCredentialStore for InMemoryCredentialStore {
    async fn get_key(&self, user_id: &str, provider: ProviderKind) -> StoreResult<Option<String>> {
        Ok(self
            .keys
            .read()
            .await
            .get(&(user_id.to_string(), provider))
            .cloned())
    }

    async fn set_key(&self, user_id: &str, provider: ProviderKind, api_key: &str) -> StoreResult<()> {
        self.keys
            .write()
            .await
            .insert((user_id.to_string(), provider), api_key.to_string());
        Ok(())
    }

    async fn delete_key(&self, user_id: &str, provider: ProviderKind) -> StoreResult<bool> {
        Ok(self
            .keys
            .write()
            .await
            .remove(&(user_id.to_string(), provider))
            .is_some())
    }

    async fn list_providers(&self, user_id: &str) -> StoreResult<Vec<ProviderKind>> {
        let mut providers: Vec<ProviderKind> = self
            .keys
            .read()
            .await
            .keys()
            .filter(|(owner, _)| owner == user_id)
            .map(|(_, provider)| *provider)
            .collect();
        providers.sort_by_key(|p| p.as_str());
        Ok(providers)
    }
}
