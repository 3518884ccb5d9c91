// src/ai/claude.rs
// Anthropic Messages API backend
use super::sse::data_lines;
use super::{AiError, AiProvider, Completion, CompletionRequest, DeltaStream, ProviderKind};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct ClaudeProvider {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeContent,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ClaudeResponse {
    pub model: String,
    pub content: Vec<ResponseContent>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: BlockDelta },
    MessageStop,
    Error { error: ApiErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl ApiErrorBody {
    fn into_error(self) -> AiError {
        // Mid-stream errors carry no HTTP status; report them with the status the API would have used
        match self.error_type.as_str() {
            "rate_limit_error" => AiError::RateLimited { status: 429, message: self.message },
            "authentication_error" | "permission_error" => {
                AiError::Unauthorized { status: 401, message: self.message }
            }
            "not_found_error" => AiError::ModelNotFound { status: 404, message: self.message },
            _ => AiError::Stream(format!("{}: {}", self.error_type, self.message)),
        }
    }
}

impl ClaudeProvider {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    fn build_request(request: &CompletionRequest, stream: bool) -> ClaudeRequest {
        let messages = request
            .messages
            .iter()
            .map(|turn| {
                let content = if turn.images.is_empty() {
                    ClaudeContent::Text(turn.content.clone())
                } else {
                    let mut blocks: Vec<ContentBlock> = turn
                        .images
                        .iter()
                        .map(|image| ContentBlock::Image {
                            source: ImageSource {
                                source_type: "base64".to_string(),
                                media_type: image.media_type.clone(),
                                data: image.data.clone(),
                            },
                        })
                        .collect();
                    if !turn.content.is_empty() {
                        blocks.push(ContentBlock::Text { text: turn.content.clone() });
                    }
                    ClaudeContent::Blocks(blocks)
                };
                ClaudeMessage {
                    role: turn.role.as_str().to_string(),
                    content,
                }
            })
            .collect();

        ClaudeRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            messages,
            system: request.system.clone(),
            stream,
        }
    }

    fn post(&self, api_key: &str, body: &ClaudeRequest) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }
}

/// Translates Anthropic stream events into text deltas.
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

            match serde_json::from_str::<StreamEvent>(&line) {
                Ok(StreamEvent::ContentBlockDelta { delta }) => {
                    if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                        yield Ok(text);
                    }
                }
                Ok(StreamEvent::MessageStop) => return,
                Ok(StreamEvent::Error { error }) => {
                    yield Err(error.into_error());
                    return;
                }
                Ok(StreamEvent::Other) => {}
                Err(e) => tracing::debug!("Skipping unparseable Claude stream event: {} ({})", line, e),
            }
        }
    }
    .boxed()
}

#[async_trait]
impl AiProvider for ClaudeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete(&self, api_key: &str, request: &CompletionRequest) -> Result<Completion, AiError> {
        let body = Self::build_request(request, false);
        tracing::debug!("Claude request: model={} messages={}", body.model, body.messages.len());

        let backoff_config = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        // Connection failures and overload statuses are retried; everything else is final
        let operation = || async {
            let response = self
                .post(api_key, &body)
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_connect() || e.is_timeout() {
                        tracing::warn!("Claude API connection error (retrying): {}", e);
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

            if matches!(status, 500 | 502 | 503 | 529) {
                tracing::warn!("Claude API returned {} (retrying): {}", status, text);
                return Err(backoff::Error::transient(AiError::from_response(status, text)));
            }
            if !(200..300).contains(&status) {
                tracing::error!("Claude API error ({}): {}", status, text);
                return Err(backoff::Error::permanent(AiError::from_response(status, text)));
            }

            serde_json::from_str::<ClaudeResponse>(&text)
                .map_err(|e| backoff::Error::permanent(AiError::Parse(e.to_string())))
        };

        let response = retry(backoff_config, operation).await?;

        let content = response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseContent::Text { text } => Some(text),
                ResponseContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            content,
            model: response.model,
            tokens_used: response.usage.map(|u| u.input_tokens + u.output_tokens),
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
            tracing::error!("Claude stream rejected ({}): {}", status, text);
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
    fn images_become_content_blocks() {
        let request = CompletionRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: Some("be brief".to_string()),
            messages: vec![ChatTurn {
                role: MessageRole::User,
                content: "what is this".to_string(),
                images: vec![ImageRef {
                    media_type: "image/png".to_string(),
                    data: "aGVsbG8=".to_string(),
                }],
            }],
            max_tokens: 1024,
        };

        let body = serde_json::to_value(ClaudeProvider::build_request(&request, true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"], "be brief");
        let blocks = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "image");
        assert_eq!(blocks[0]["source"]["type"], "base64");
        assert_eq!(blocks[1]["text"], "what is this");
    }

    #[test]
    fn plain_turns_serialize_as_strings() {
        let request = CompletionRequest {
            model: "claude-sonnet-4-5".to_string(),
            system: None,
            messages: vec![ChatTurn::text(MessageRole::User, "hi")],
            max_tokens: 16,
        };
        let body = serde_json::to_value(ClaudeProvider::build_request(&request, false)).unwrap();
        assert_eq!(body["messages"][0]["content"], "hi");
        assert!(body.get("stream").is_none());
        assert!(body.get("system").is_none());
    }

    #[tokio::test]
    async fn text_deltas_are_yielded_until_message_stop() {
        let events = lines(&[
            r#"{"type":"message_start","message":{"id":"m1"}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"message_stop"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"late"}}"#,
        ]);
        let out: Vec<String> = deltas(events).map(|d| d.unwrap()).collect().await;
        assert_eq!(out, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn stream_error_events_are_classified() {
        let events = lines(&[
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
        ]);
        let out: Vec<_> = deltas(events).collect().await;
        assert_eq!(out.len(), 2);
        let err = out.into_iter().nth(1).unwrap().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::RateLimited);
    }
}
