// src/config.rs
// Runtime configuration, read once at startup from the environment (.env is loaded by main)
use crate::ai::ProviderKind;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub storage: StorageBackend,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub jwt_secret: String,
    /// Explicit model catalog (`AI_MODELS=gpt-4o=openai,claude-sonnet-4-5=anthropic`).
    /// Empty means the built-in catalog.
    pub models: Vec<(String, ProviderKind)>,
    pub default_model: Option<String>,
    pub anthropic_base_url: String,
    pub openai_base_url: String,
    pub ai_request_timeout: Duration,
    pub ai_stream_idle_timeout: Duration,
    pub ai_max_tokens: u32,
    pub chat_history_limit: usize,
    pub stream_flush_interval: Duration,
    pub max_upload_bytes: usize,
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so parsing can be exercised without
    /// touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage = match get("STORAGE_BACKEND").as_deref() {
            None | Some("postgres") => StorageBackend::Postgres,
            Some("memory") => StorageBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let database_url = get("DATABASE_URL");
        if storage == StorageBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let models = match get("AI_MODELS") {
            Some(raw) => parse_model_list(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            storage,
            database_url,
            db_max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 5)?,
            jwt_secret,
            models,
            default_model: get("DEFAULT_MODEL"),
            anthropic_base_url: get("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            ai_request_timeout: Duration::from_secs(parse_or(&get, "AI_REQUEST_TIMEOUT_SECS", 120)?),
            ai_stream_idle_timeout: Duration::from_secs(parse_or(&get, "AI_STREAM_IDLE_TIMEOUT_SECS", 60)?),
            ai_max_tokens: parse_or(&get, "AI_MAX_TOKENS", 4096)?,
            chat_history_limit: parse_or(&get, "CHAT_HISTORY_LIMIT", 10)?,
            stream_flush_interval: Duration::from_millis(parse_or(&get, "STREAM_FLUSH_INTERVAL_MS", 1000)?),
            max_upload_bytes: parse_or(&get, "MAX_UPLOAD_BYTES", 20 * 1024 * 1024)?,
            system_prompt: get("SYSTEM_PROMPT"),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn parse_model_list(raw: &str) -> Result<Vec<(String, ProviderKind)>, ConfigError> {
    let mut seen = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (model, provider) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
            key: "AI_MODELS",
            value: entry.to_string(),
        })?;
        let provider = provider.trim().parse::<ProviderKind>().map_err(|_| ConfigError::Invalid {
            key: "AI_MODELS",
            value: entry.to_string(),
        })?;
        seen.insert(model.trim().to_string(), provider);
    }

    let mut models: Vec<_> = seen.into_iter().collect();
    models.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn memory_backend_does_not_need_database_url() {
        let config = Config::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.chat_history_limit, 10);
        assert_eq!(config.ai_request_timeout, Duration::from_secs(120));
        assert!(config.models.is_empty());
    }

    #[test]
    fn postgres_backend_requires_database_url() {
        let err = Config::from_lookup(lookup(&[("JWT_SECRET", "secret")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn parses_model_catalog() {
        let config = Config::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
            ("AI_MODELS", "gpt-4o=openai, claude-sonnet-4-5=anthropic"),
        ]))
        .unwrap();

        assert_eq!(
            config.models,
            vec![
                ("claude-sonnet-4-5".to_string(), ProviderKind::Anthropic),
                ("gpt-4o".to_string(), ProviderKind::OpenAi),
            ]
        );
    }

    #[test]
    fn rejects_bad_numbers_and_providers() {
        let err = Config::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
            ("CHAT_HISTORY_LIMIT", "ten"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CHAT_HISTORY_LIMIT", .. }));

        let err = Config::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
            ("AI_MODELS", "mystery-1=acme"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AI_MODELS", .. }));
    }
}
