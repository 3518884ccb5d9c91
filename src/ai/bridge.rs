// src/ai/bridge.rs
// Routes a request to the provider that serves its model, using the caller's own key
use super::credentials::ProviderCredentialStore;
use super::registry::{ModelRegistry, RegistryError};
use super::{AiError, AiProvider, Completion, CompletionRequest, DeltaStream, ProviderKind};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct AiBridge {
    registry: ModelRegistry,
    providers: HashMap<ProviderKind, Arc<dyn AiProvider>>,
    credentials: Arc<dyn ProviderCredentialStore>,
    stream_idle_timeout: Duration,
}

impl AiBridge {
    /// Fails when the registry names a model no registered provider can serve.
    pub fn new(
        registry: ModelRegistry,
        providers: Vec<Arc<dyn AiProvider>>,
        credentials: Arc<dyn ProviderCredentialStore>,
        stream_idle_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let providers: HashMap<_, _> = providers.into_iter().map(|p| (p.kind(), p)).collect();
        let kinds: HashSet<_> = providers.keys().copied().collect();
        registry.validate(&kinds)?;

        Ok(Self {
            registry,
            providers,
            credentials,
            stream_idle_timeout,
        })
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    async fn route(
        &self,
        request: &mut CompletionRequest,
        user_id: &str,
    ) -> Result<(Arc<dyn AiProvider>, String), AiError> {
        let spec = self.registry.resolve(&request.model)?;
        let provider = self
            .providers
            .get(&spec.provider)
            .cloned()
            .ok_or_else(|| AiError::UnknownModel(request.model.clone()))?;

        let api_key = self
            .credentials
            .get_key(user_id, spec.provider)
            .await?
            .filter(|key| !key.trim().is_empty())
            .ok_or(AiError::MissingCredential { provider: spec.provider })?;

        if !spec.supports_images {
            let dropped: usize = request.messages.iter().map(|m| m.images.len()).sum();
            if dropped > 0 {
                tracing::warn!("Model {} does not accept images; dropping {} image(s)", spec.id, dropped);
                for turn in &mut request.messages {
                    turn.images.clear();
                }
            }
        }

        Ok((provider, api_key))
    }

    pub async fn generate(&self, mut request: CompletionRequest, user_id: &str) -> Result<Completion, AiError> {
        let (provider, api_key) = self.route(&mut request, user_id).await?;
        tracing::info!("Generating with {} via {}", request.model, provider.kind());
        provider.complete(&api_key, &request).await
    }

    /// Yields deltas until the provider finishes, fails, stalls past the idle timeout, or `cancel` fires.
    /// Cancellation is checked before every read, so no further provider output is pulled once it is set.
    pub async fn generate_streaming(
        &self,
        mut request: CompletionRequest,
        user_id: &str,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, AiError> {
        let (provider, api_key) = self.route(&mut request, user_id).await?;
        tracing::info!("Streaming {} via {}", request.model, provider.kind());

        let mut inner = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(stream::empty().boxed()),
            opened = provider.stream(&api_key, &request) => opened?,
        };

        let idle = self.stream_idle_timeout;
        Ok(async_stream::stream! {
            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = tokio::time::timeout(idle, inner.next()) => Some(next),
                };

                match step {
                    None => {
                        tracing::debug!("Generation cancelled; no further output requested");
                        break;
                    }
                    Some(Ok(Some(Ok(delta)))) => yield Ok(delta),
                    Some(Ok(Some(Err(e)))) => {
                        yield Err(e);
                        break;
                    }
                    Some(Ok(None)) => break,
                    Some(Err(_)) => {
                        tracing::warn!("Provider stream idle for {:?}", idle);
                        yield Err(AiError::Timeout(idle));
                        break;
                    }
                }
            }
        }
        .boxed())
    }
}
