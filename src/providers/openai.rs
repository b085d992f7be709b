//! OpenAI-compatible chat completions (`POST {base}/chat/completions`).

use super::http::{build_client, log_request, post_json};
use super::{ChatRequest, ChatTransport, ProviderSettings};
use crate::error::{ProviderError, TaskError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiTransport {
    pub fn new(settings: &ProviderSettings) -> Result<Self, TaskError> {
        settings.validate()?;
        Ok(Self {
            client: build_client(settings.timeout)?,
            endpoint: chat_endpoint(&settings.base_url),
            api_key: settings.api_key.trim().to_string(),
            model: settings.model.trim().to_string(),
            timeout: settings.timeout,
        })
    }
}

/// Append `/chat/completions` unless the base already ends with it.
pub fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

pub(crate) fn request_body(model: &str, req: &ChatRequest<'_>) -> Value {
    let user = match req.image {
        Some(image) => json!([
            {"type": "text", "text": req.user},
            {"type": "image_url", "image_url": {"url": image.data_uri()}}
        ]),
        None => json!(req.user),
    };
    json!({
        "model": model,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "top_p": 0.95,
        "messages": [
            {"role": "system", "content": req.system},
            {"role": "user", "content": user}
        ]
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, req: ChatRequest<'_>) -> Result<String, ProviderError> {
        let body = request_body(&self.model, &req);
        log_request(self.name(), &self.endpoint, req.tag, &body);

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|e| {
            ProviderError::Transport {
                provider: self.name().to_string(),
                detail: format!("invalid API key header: {e}"),
            }
        })?;
        headers.insert(AUTHORIZATION, bearer);

        let parsed: ChatResponse =
            post_json(&self.client, self.name(), &self.endpoint, headers, &body, self.timeout)
                .await?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::EmptyResponse {
                provider: self.name().to_string(),
            })?;
        debug!(tag = ?req.tag, finish_reason = ?choice.finish_reason, "openai reply");

        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: self.name().to_string(),
            });
        }
        Ok(content.trim().to_string())
    }
}
