// src/ai/registry.rs
use super::{AiError, ProviderKind};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub id: String,
    pub provider: ProviderKind,
    pub supports_images: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("model catalog is empty")]
    Empty,
    #[error("default model {0} is not in the catalog")]
    UnknownDefault(String),
    #[error("model {model} needs provider {provider}, which is not registered")]
    ProviderMissing { model: String, provider: ProviderKind },
}

const DEFAULT_CATALOG: &[(&str, ProviderKind, bool)] = &[
    ("claude-sonnet-4-5", ProviderKind::Anthropic, true),
    ("claude-opus-4-1", ProviderKind::Anthropic, true),
    ("claude-3-5-haiku-latest", ProviderKind::Anthropic, true),
    ("gpt-4o", ProviderKind::OpenAi, true),
    ("gpt-4o-mini", ProviderKind::OpenAi, true),
    ("gpt-4.1", ProviderKind::OpenAi, true),
    ("o3-mini", ProviderKind::OpenAi, false),
];

/// Explicit model id -> provider table.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelSpec>,
    default_model: String,
}

impl ModelRegistry {
    pub fn default_catalog() -> Self {
        let models = DEFAULT_CATALOG
            .iter()
            .map(|(id, provider, images)| ModelSpec {
                id: id.to_string(),
                provider: *provider,
                supports_images: *images,
            })
            .collect();
        Self::from_specs(models, None)
    }

    /// Configured entries replace the built-in catalog. Image support is assumed except for the `o*` reasoning line.
    pub fn from_config(entries: &[(String, ProviderKind)], default_model: Option<&str>) -> Self {
        if entries.is_empty() {
            let mut registry = Self::default_catalog();
            if let Some(model) = default_model {
                registry.default_model = model.to_string();
            }
            return registry;
        }

        let models = entries
            .iter()
            .map(|(id, provider)| ModelSpec {
                id: id.clone(),
                provider: *provider,
                supports_images: !(id.starts_with('o') && id[1..].starts_with(|c: char| c.is_ascii_digit())),
            })
            .collect();
        Self::from_specs(models, default_model)
    }

    pub fn from_specs(specs: Vec<ModelSpec>, default_model: Option<&str>) -> Self {
        let default_model = default_model
            .map(str::to_string)
            .or_else(|| specs.first().map(|s| s.id.clone()))
            .unwrap_or_default();
        let models = specs.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self { models, default_model }
    }

    pub fn resolve(&self, model: &str) -> Result<&ModelSpec, AiError> {
        self.models
            .get(model)
            .ok_or_else(|| AiError::UnknownModel(model.to_string()))
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn models(&self) -> Vec<&ModelSpec> {
        let mut models: Vec<_> = self.models.values().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Startup check: every model's provider is available and the default model exists.
    pub fn validate(&self, providers: &HashSet<ProviderKind>) -> Result<(), RegistryError> {
        if self.models.is_empty() {
            return Err(RegistryError::Empty);
        }
        if !self.models.contains_key(&self.default_model) {
            return Err(RegistryError::UnknownDefault(self.default_model.clone()));
        }
        for spec in self.models() {
            if !providers.contains(&spec.provider) {
                return Err(RegistryError::ProviderMissing {
                    model: spec.id.clone(),
                    provider: spec.provider,
                });
            }
        }
        Ok(())
    }
}
