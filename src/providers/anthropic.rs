//! Anthropic-compatible Messages API (`POST {base}/v1/messages`).

use super::http::{build_client, log_request, post_json};
use super::{ChatRequest, ChatTransport, ProviderSettings};
use crate::error::{ProviderError, TaskError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

pub struct AnthropicTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl AnthropicTransport {
    pub fn new(settings: &ProviderSettings) -> Result<Self, TaskError> {
        settings.validate()?;
        Ok(Self {
            client: build_client(settings.timeout)?,
            endpoint: messages_endpoint(&settings.base_url),
            api_key: settings.api_key.trim().to_string(),
            model: settings.model.trim().to_string(),
            timeout: settings.timeout,
        })
    }
}

pub fn messages_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    if base.ends_with("/v1/messages") {
        base.to_string()
    } else {
        format!("{base}/v1/messages")
    }
}

pub(crate) fn request_body(model: &str, req: &ChatRequest<'_>) -> Value {
    let mut content = Vec::with_capacity(2);
    if let Some(image) = req.image {
        content.push(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": image.mime, "data": image.base64}
        }));
    }
    content.push(json!({"type": "text", "text": req.user}));
    json!({
        "model": model,
        "system": req.system,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "messages": [{"role": "user", "content": content}]
    })
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: String,
}

#[async_trait]
impl ChatTransport for AnthropicTransport {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: ChatRequest<'_>) -> Result<String, ProviderError> {
        let body = request_body(&self.model, &req);
        log_request(self.name(), &self.endpoint, req.tag, &body);

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key).map_err(|e| ProviderError::Transport {
            provider: self.name().to_string(),
            detail: format!("invalid API key header: {e}"),
        })?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let parsed: MessagesResponse =
            post_json(&self.client, self.name(), &self.endpoint, headers, &body, self.timeout)
                .await?;
        debug!(tag = ?req.tag, stop_reason = ?parsed.stop_reason, "anthropic reply");

        let text: String = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: self.name().to_string(),
            });
        }
        Ok(text.trim().to_string())
    }
}
