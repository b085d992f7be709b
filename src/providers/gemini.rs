//! Gemini-compatible `generateContent`.

use super::http::{build_client, log_request, post_json};
use super::{ChatRequest, ChatTransport, ProviderSettings};
use crate::error::{ProviderError, TaskError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl GeminiTransport {
    pub fn new(settings: &ProviderSettings) -> Result<Self, TaskError> {
        settings.validate()?;
        Ok(Self {
            client: build_client(settings.timeout)?,
            endpoint: generate_endpoint(&settings.base_url, settings.model.trim()),
            api_key: settings.api_key.trim().to_string(),
            timeout: settings.timeout,
        })
    }
}

/// Build the `…/models/{model}:generateContent` URL.
///
/// A base that already names a model is used as-is (adding the action when
/// missing); a bare host gets `/v1beta` appended.
pub fn generate_endpoint(base_url: &str, model: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    if base.contains("/models/") {
        if base.contains(":generateContent") {
            return base.to_string();
        }
        let tail = base.rsplit('/').next().unwrap_or_default();
        return if tail.contains(':') {
            base.to_string()
        } else {
            format!("{base}:generateContent")
        };
    }
    let base = if base.ends_with("/v1beta") {
        base.to_string()
    } else {
        format!("{base}/v1beta")
    };
    format!("{base}/models/{model}:generateContent")
}

pub(crate) fn request_body(req: &ChatRequest<'_>) -> Value {
    let mut parts = vec![json!({"text": req.user})];
    if let Some(image) = req.image {
        parts.push(json!({"inline_data": {"mime_type": image.mime, "data": image.base64}}));
    }
    let mut body = json!({
        "contents": [{"role": "user", "parts": parts}],
        "generationConfig": {
            "temperature": req.temperature,
            "maxOutputTokens": req.max_tokens
        }
    });
    if !req.system.trim().is_empty() {
        body["system_instruction"] = json!({"parts": [{"text": req.system}]});
    }
    body
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    /// First non-blank text part across all candidates.
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
            .map(|p| p.text.as_str())
            .find(|t| !t.trim().is_empty())
    }
}

#[async_trait]
impl ChatTransport for GeminiTransport {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, req: ChatRequest<'_>) -> Result<String, ProviderError> {
        let body = request_body(&req);
        log_request(self.name(), &self.endpoint, req.tag, &body);

        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&self.api_key).map_err(|e| ProviderError::Transport {
            provider: self.name().to_string(),
            detail: format!("invalid API key header: {e}"),
        })?;
        headers.insert("x-goog-api-key", key);

        let parsed: GenerateResponse =
            post_json(&self.client, self.name(), &self.endpoint, headers, &body, self.timeout)
                .await?;
        debug!(
            tag = ?req.tag,
            finish_reason = ?parsed.candidates.first().and_then(|c| c.finish_reason.clone()),
            "gemini reply"
        );

        parsed
            .first_text()
            .map(|t| t.trim().to_string())
            .ok_or_else(|| ProviderError::EmptyResponse {
                provider: self.name().to_string(),
            })
    }
}
