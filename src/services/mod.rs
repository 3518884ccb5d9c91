// src/services/mod.rs
pub mod chat_store;
pub mod file_ingestor;
pub mod memory_store;
pub mod message_pipeline;
pub mod quota;

pub use chat_store::{ChatStore, PgChatStore};
pub use file_ingestor::{DefaultFileIngestor, FileIngestor};
pub use memory_store::InMemoryChatStore;
pub use message_pipeline::MessagePipeline;
pub use quota::{InMemoryQuotaTracker, PgQuotaTracker, QuotaTracker};
