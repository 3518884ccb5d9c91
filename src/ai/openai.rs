// src/ai/openai.rs
// OpenAI Chat Completions backend
use super::sse::data_lines;
use super::{AiError, AiProvider, Completion, CompletionRequest, DeltaStream, ProviderKind};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_completion_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: OpenAiContent,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    total_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    error: Option<OpenAiErrorBody>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiErrorBody {
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn build_request(request: &CompletionRequest, stream: bool) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: OpenAiContent::Text(system.clone()),
            });
        }

        for turn in &request.messages {
            let content = if turn.images.is_empty() {
                OpenAiContent::Text(turn.content.clone())
            } else {
                let mut parts = vec![ContentPart::Text { text: turn.content.clone() }];
                parts.extend(turn.images.iter().map(|image| ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", image.media_type, image.data),
                    },
                }));
                OpenAiContent::Parts(parts)
            };
            messages.push(OpenAiMessage {
                role: turn.role.as_str().to_string(),
                content,
            });
        }

        OpenAiRequest {
            model: request.model.clone(),
            messages,
            max_completion_tokens: request.max_tokens,
            stream,
        }
    }

    fn post(&self, api_key: &str, body: &OpenAiRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .bearer_auth(api_key)
            .json(body)
    }
}

fn deltas(mut lines: BoxStream<'static, Result<String, AiError>>) -> DeltaStream {
    async_stream::stream! {
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if line.trim() == "[DONE]" {
                return;
            }

            match serde_json::from_str::<OpenAiStreamResponse>(&line) {
                Ok(parsed) => {
                    if let Some(error) = parsed.error {
                        let message = match error.error_type {
                            Some(kind) => format!("{}: {}", kind, error.message),
                            None => error.message,
                        };
                        yield Err(AiError::Stream(message));
                        return;
                    }
                    if let Some(text) = parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|t| !t.is_empty())
                    {
                        yield Ok(text);
                    }
                }
                Err(e) => tracing::debug!("Skipping unparseable OpenAI stream event: {} ({})", line, e),
            }
        }
    }
    .boxed()
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn complete(&self, api_key: &str, request: &CompletionRequest) -> Result<Completion, AiError> {
        let body = Self::build_request(request, false);

        let backoff_config = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let operation = || async {
            let response = self
                .post(api_key, &body)
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_connect() || e.is_timeout() {
                        tracing::warn!("OpenAI connection error (retrying): {}", e);
                        backoff::Error::transient(AiError::Http(e))
                    } else {
                        backoff::Error::permanent(AiError::Http(e))
                    }
                })?;

            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| backoff::Error::permanent(AiError::Http(e)))?;

            if matches!(status, 500 | 502 | 503) {
                tracing::warn!("OpenAI returned {} (retrying): {}", status, text);
                return Err(backoff::Error::transient(AiError::from_response(status, text)));
            }
            if !(200..300).contains(&status) {
                tracing::error!("OpenAI error ({}): {}", status, text);
                return Err(backoff::Error::permanent(AiError::from_response(status, text)));
            }

            serde_json::from_str::<OpenAiResponse>(&text)
                .map_err(|e| backoff::Error::permanent(AiError::Parse(e.to_string())))
        };

        let response = retry(backoff_config, operation).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(Completion {
            content,
            model: response.model,
            tokens_used: response.usage.map(|u| u.total_tokens),
        })
    }

    async fn stream(&self, api_key: &str, request: &CompletionRequest) -> Result<DeltaStream, AiError> {
        let body = Self::build_request(request, true);

        let response = tokio::time::timeout(self.request_timeout, self.post(api_key, &body).send())
            .await
            .map_err(|_| AiError::Timeout(self.request_timeout))??;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!("OpenAI stream rejected ({}): {}", status, text);
            return Err(AiError::from_response(status, text));
        }

        Ok(deltas(data_lines(response.bytes_stream())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ChatTurn, ErrorCategory, ImageRef};
    use crate::models::chat::MessageRole;
    use futures::stream;

    fn lines(items: &[&str]) -> BoxStream<'static, Result<String, AiError>> {
        let owned: Vec<Result<String, AiError>> = items.iter().map(|s| Ok(s.to_string())).collect();
        stream::iter(owned).boxed()
    }

    #[test]
    fn system_prompt_leads_and_images_become_data_urls() {
        let request = CompletionRequest {
            model: "gpt-4o".to_string(),
            system: Some("sys".to_string()),
            messages: vec![ChatTurn {
                role: MessageRole::User,
                content: "look".to_string(),
                images: vec![ImageRef {
                    media_type: "image/jpeg".to_string(),
                    data: "AAAA".to_string(),
                }],
            }],
            max_tokens: 100,
        };

        let body = serde_json::to_value(OpenAiProvider::build_request(&request, true)).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"][0]["type"], "text");
        assert_eq!(
            body["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
        assert_eq!(body["max_completion_tokens"], 100);
    }

    #[tokio::test]
    async fn content_deltas_until_done() {
        let events = lines(&[
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo!"},"finish_reason":null}]}"#,
            "[DONE]",
            r#"{"choices":[{"delta":{"content":"ignored"}}]}"#,
        ]);
        let out: Vec<String> = deltas(events).map(|d| d.unwrap()).collect().await;
        assert_eq!(out, vec!["Hel".to_string(), "lo!".to_string()]);
    }

    #[tokio::test]
    async fn inline_error_objects_end_the_stream() {
        let events = lines(&[r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#]);
        let out: Vec<_> = deltas(events).collect().await;
        let err = out.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::RateLimited);
    }
}
