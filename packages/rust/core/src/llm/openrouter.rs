//! OpenRouter chat-completions client.
//!
//! Structured calls use `response_format: json_schema` in strict mode. A
//! grounded call adds the `web` plugin; image calls ask an image-capable
//! model for `["image", "text"]` modalities and read the first returned image.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use articleforge_shared::{ArticleForgeError, OpenRouterConfig, Result};

use super::{CallFailure, CallRequest, GenerationClient, ImageRequest, RawCompletion, RawImage};

const USER_AGENT: &str = concat!("articleforge/", env!("CARGO_PKG_VERSION"));

/// Longest provider error body (in chars) kept in a failure message.
const MAX_ERROR_BODY: usize = 300;

pub struct OpenRouterClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterClient {
    pub fn new(config: &OpenRouterConfig, api_key: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| ArticleForgeError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, body: &Value) -> std::result::Result<ChatResponse, CallFailure> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallFailure::Timeout
                } else {
                    CallFailure::RemoteError {
                        status: None,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY)
                .collect();
            warn!(%status, error = %text, "provider returned an error");
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => CallFailure::RateLimited(text),
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => CallFailure::Timeout,
                _ => CallFailure::RemoteError {
                    status: Some(status.as_u16()),
                    message: text,
                },
            });
        }

        response.json::<ChatResponse>().await.map_err(|e| {
            if e.is_timeout() {
                CallFailure::Timeout
            } else {
                CallFailure::MalformedResponse(format!("unreadable provider envelope: {e}"))
            }
        })
    }
}

#[async_trait]
impl GenerationClient for OpenRouterClient {
    async fn complete(&self, request: &CallRequest) -> std::result::Result<RawCompletion, CallFailure> {
        let mut body = json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "temperature": 0.4,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "strict": true,
                    "schema": request.schema,
                },
            },
        });
        if let Some(grounding) = request.grounding {
            body["plugins"] = json!([{ "id": "web", "max_results": grounding.max_results }]);
        }

        let response = self.post(&body).await?;
        if let Some(error) = response.error {
            return Err(error.into_failure());
        }

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CallFailure::EmptyResult("no choices in response".into()))?;

        let usage = response.usage.unwrap_or_default();
        debug!(
            model = %request.model,
            tokens_in = usage.prompt_tokens,
            tokens_out = usage.completion_tokens,
            "completion received"
        );
        Ok(RawCompletion {
            content,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
        })
    }

    async fn generate_image(&self, request: &ImageRequest) -> std::result::Result<RawImage, CallFailure> {
        let body = json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "modalities": ["image", "text"],
        });

        let response = self.post(&body).await?;
        if let Some(error) = response.error {
            return Err(error.into_failure());
        }

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.images.into_iter().next())
            .map(|image| RawImage {
                url: image.image_url.url,
            })
            .ok_or_else(|| CallFailure::EmptyResult("no image in response".into()))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    images: Vec<ImagePart>,
}

#[derive(Debug, Deserialize)]
struct ImagePart {
    image_url: ImageUrl,
}

#[derive(Debug, Deserialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: String,
}

impl ProviderError {
    /// An error inside a 2xx envelope still reached the provider.
    fn into_failure(self) -> CallFailure {
        let status = self
            .code
            .and_then(|c| c.as_u64())
            .and_then(|c| u16::try_from(c).ok())
            .or(Some(200));
        match status {
            Some(429) => CallFailure::RateLimited(self.message),
            _ => CallFailure::RemoteError {
                status,
                message: self.message,
            },
        }
    }
}
