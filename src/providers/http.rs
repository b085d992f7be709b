//! Shared plumbing for the HTTP transports: client construction, image
//! loading, request execution and error mapping, log masking.

use crate::error::{ProviderError, TaskError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Error bodies are cut to this many characters before they are stored.
const ERROR_BODY_LIMIT: usize = 512;

/// A page image ready to embed in a request.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub mime: &'static str,
    pub base64: String,
}

impl EncodedImage {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            mime: detect_mime(bytes),
            base64: STANDARD.encode(bytes),
        }
    }

    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

/// Sniff the image type from its magic bytes; PNG when unknown.
pub fn detect_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::Gif) => "image/gif",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => "image/png",
    }
}

pub async fn load_image(path: &Path) -> Result<EncodedImage, ProviderError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ProviderError::Image {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    let encoded = EncodedImage::from_bytes(&bytes);
    debug!("Encoded {} → {} bytes base64", path.display(), encoded.base64.len());
    Ok(encoded)
}

pub fn build_client(timeout: Duration) -> Result<reqwest::Client, TaskError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| TaskError::InvalidConfig(format!("HTTP client: {e}")))
}

/// POST a JSON body and decode a JSON reply.
pub async fn post_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    headers: HeaderMap,
    body: &Value,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let response = client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| map_send_error(provider, e, timeout))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| map_send_error(provider, e, timeout))?;

    if !status.is_success() {
        debug!(provider, status = status.as_u16(), "error body: {}", text);
        return Err(ProviderError::Status {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_chars(text.trim(), ERROR_BODY_LIMIT),
        });
    }

    serde_json::from_str(&text).map_err(|e| ProviderError::InvalidResponse {
        provider: provider.to_string(),
        detail: e.to_string(),
    })
}

fn map_send_error(provider: &str, e: reqwest::Error, timeout: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            secs: timeout.as_secs(),
        }
    } else {
        ProviderError::Transport {
            provider: provider.to_string(),
            detail: e.to_string(),
        }
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

// ── Log masking ──────────────────────────────────────────────────────────

/// Keys whose string values are image payloads.
const IMAGE_KEYS: &[&str] = &["url", "data"];

/// Copy of a request body with embedded images replaced by a length marker,
/// safe for debug logs.
pub fn mask_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let masked = match v {
                        Value::String(s) if IMAGE_KEYS.contains(&k.as_str()) => {
                            Value::String(mask_image(s))
                        }
                        other => mask_payload(other),
                    };
                    (k.clone(), masked)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_payload).collect()),
        other => other.clone(),
    }
}

fn mask_image(raw: &str) -> String {
    match raw.strip_prefix("data:").and_then(|r| r.split_once(',')) {
        Some((meta, data)) => format!("data:{meta},<base64, length={}>", data.len()),
        None if raw.len() > 256 => format!("<image base64, length={}>", raw.len()),
        None => raw.to_string(),
    }
}

pub fn log_request(provider: &str, url: &str, tag: super::RequestTag, body: &Value) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        let masked = serde_json::to_string_pretty(&mask_payload(body)).unwrap_or_default();
        debug!(provider, url, ?tag, "request body:\n{}", masked);
    }
}
