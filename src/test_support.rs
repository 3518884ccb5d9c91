// src/test_support.rs
// Scripted provider and in-memory fixtures shared by unit tests
use crate::ai::bridge::AiBridge;
use crate::ai::credentials::{InMemoryCredentialStore, ProviderCredentialStore};
use crate::ai::registry::{ModelRegistry, ModelSpec};
use crate::ai::{AiError, AiProvider, Completion, CompletionRequest, DeltaStream, ProviderKind};
use crate::config::Config;
use crate::models::chat::Chat;
use crate::services::chat_store::ChatStore;
use crate::services::file_ingestor::DefaultFileIngestor;
use crate::services::memory_store::InMemoryChatStore;
use crate::services::message_pipeline::{MessagePipeline, PipelineSettings};
use crate::services::quota::{InMemoryQuotaTracker, QuotaError, QuotaTracker};
use crate::models::quota::LimitStatus;
use crate::AppState;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_MODEL: &str = "claude-test";
pub const TEST_USER: &str = "user-1";

#[derive(Debug, Clone)]
pub enum Step {
    Delta(String),
    Error { status: u16, body: String },
    /// Never produces another item.
    Stall,
}

impl Step {
    pub fn delta(text: &str) -> Self {
        Step::Delta(text.to_string())
    }
}

pub struct ScriptedProvider {
    kind: ProviderKind,
    steps: Vec<Step>,
    reject: Option<(u16, String)>,
    requests: Mutex<Vec<CompletionRequest>>,
    keys: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind, steps: Vec<Step>) -> Self {
        Self {
            kind,
            steps,
            reject: None,
            requests: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
        }
    }

    /// Refuse every call up front with the given HTTP status and body.
    pub fn rejecting(kind: ProviderKind, status: u16, body: &str) -> Self {
        Self {
            reject: Some((status, body.to_string())),
            ..Self::new(kind, Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_key(&self) -> Option<String> {
        self.keys.lock().unwrap().last().cloned()
    }

    fn record(&self, api_key: &str, request: &CompletionRequest) -> Result<(), AiError> {
        self.requests.lock().unwrap().push(request.clone());
        self.keys.lock().unwrap().push(api_key.to_string());
        match &self.reject {
            Some((status, body)) => Err(AiError::from_response(*status, body.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, api_key: &str, request: &CompletionRequest) -> Result<Completion, AiError> {
        self.record(api_key, request)?;
        let mut content = String::new();
        for step in &self.steps {
            match step {
                Step::Delta(text) => content.push_str(text),
                Step::Error { status, body } => return Err(AiError::from_response(*status, body.clone())),
                Step::Stall => futures::future::pending::<()>().await,
            }
        }
        Ok(Completion {
            content,
            model: request.model.clone(),
            tokens_used: None,
        })
    }

    async fn stream(&self, api_key: &str, request: &CompletionRequest) -> Result<DeltaStream, AiError> {
        self.record(api_key, request)?;
        let steps = self.steps.clone();
        Ok(async_stream::stream! {
            for step in steps {
                match step {
                    Step::Delta(text) => yield Ok(text),
                    Step::Error { status, body } => {
                        yield Err(AiError::from_response(status, body));
                        return;
                    }
                    Step::Stall => futures::future::pending::<()>().await,
                }
            }
        }
        .boxed())
    }
}

/// Quota backend whose storage is always down.
pub struct BrokenQuota;

#[async_trait]
impl QuotaTracker for BrokenQuota {
    async fn check_limit(&self, _user_id: &str) -> Result<LimitStatus, QuotaError> {
        Err(QuotaError::Corrupt("quota storage offline".to_string()))
    }

    async fn increment_usage(&self, _user_id: &str) -> Result<(), QuotaError> {
        Err(QuotaError::Corrupt("quota storage offline".to_string()))
    }
}

pub struct Harness {
    pub store: Arc<InMemoryChatStore>,
    pub quota: Arc<InMemoryQuotaTracker>,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub provider: Arc<ScriptedProvider>,
    pub bridge: Arc<AiBridge>,
    pub pipeline: MessagePipeline,
    pub chat: Chat,
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        history_limit: 10,
        flush_interval: Duration::from_millis(1000),
        max_tokens: 256,
        system_prompt: None,
    }
}

pub async fn harness(steps: Vec<Step>) -> Harness {
    harness_with(ScriptedProvider::new(ProviderKind::Anthropic, steps), None).await
}

/// Builds a pipeline over in-memory backends with a key already stored for the test user.
/// `quota_override` replaces the quota tracker the pipeline talks to; `Harness::quota` is then unused by it.
pub async fn harness_with(provider: ScriptedProvider, quota_override: Option<Arc<dyn QuotaTracker>>) -> Harness {
    let store = Arc::new(InMemoryChatStore::new());
    let quota = Arc::new(InMemoryQuotaTracker::new());
    let credentials = Arc::new(InMemoryCredentialStore::new());
    credentials
        .set_key(TEST_USER, ProviderKind::Anthropic, "sk-test")
        .await
        .unwrap();
    let provider = Arc::new(provider);

    let registry = ModelRegistry::from_specs(
        vec![ModelSpec {
            id: TEST_MODEL.to_string(),
            provider: ProviderKind::Anthropic,
            supports_images: true,
        }],
        Some(TEST_MODEL),
    );
    let bridge = Arc::new(
        AiBridge::new(
            registry,
            vec![provider.clone() as Arc<dyn AiProvider>],
            credentials.clone() as Arc<dyn ProviderCredentialStore>,
            Duration::from_secs(5),
        )
        .unwrap(),
    );

    let pipeline = MessagePipeline::new(
        store.clone(),
        quota_override.unwrap_or_else(|| quota.clone() as Arc<dyn QuotaTracker>),
        Arc::new(DefaultFileIngestor::new(1024 * 1024)),
        bridge.clone(),
        settings(),
    );
    let chat = store.create_chat(TEST_USER, TEST_MODEL).await.unwrap();

    Harness {
        store,
        quota,
        credentials,
        provider,
        bridge,
        pipeline,
        chat,
    }
}

/// Memory-backed application state over the harness backends, with the default upload limit.
pub fn app_state(h: &Harness) -> Arc<AppState> {
    let config = Config::from_lookup(|key| match key {
        "STORAGE_BACKEND" => Some("memory".to_string()),
        "JWT_SECRET" => Some("test-secret".to_string()),
        _ => None,
    })
    .unwrap();

    let pipeline = MessagePipeline::new(
        h.store.clone(),
        h.quota.clone(),
        Arc::new(DefaultFileIngestor::new(config.max_upload_bytes)),
        h.bridge.clone(),
        settings(),
    );

    Arc::new(AppState {
        config,
        db_pool: None,
        chat_store: h.store.clone(),
        quota: h.quota.clone(),
        credentials: h.credentials.clone(),
        bridge: h.bridge.clone(),
        pipeline: Arc::new(pipeline),
    })
}
