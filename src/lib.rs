// lib.rs - Main library file that exports all modules
use std::sync::Arc;

pub mod ai;
pub mod config;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

use ai::bridge::AiBridge;
use ai::credentials::ProviderCredentialStore;
use config::Config;
use services::chat_store::ChatStore;
use services::message_pipeline::MessagePipeline;
use services::quota::QuotaTracker;

// AppState holds the storage backends, the AI bridge and the message pipeline built on top of them
pub struct AppState {
    pub config: Config,
    pub db_pool: Option<sqlx::PgPool>, // None when running with the in-memory backend
    pub chat_store: Arc<dyn ChatStore>,
    pub quota: Arc<dyn QuotaTracker>,
    pub credentials: Arc<dyn ProviderCredentialStore>,
    pub bridge: Arc<AiBridge>,
    pub pipeline: Arc<MessagePipeline>,
}
