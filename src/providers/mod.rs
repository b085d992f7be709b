//! Provider capability layer: page OCR + translation and chunk formatting.
//!
//! The rest of the crate only sees two object-safe capabilities,
//! [`Translator`] and [`ChunkFormatter`], built by a [`ProviderBackend`] from
//! a resolved [`ProviderSettings`]. Which wire protocol sits behind them is a
//! pure function of [`ProviderKind`].
//!
//! ## Data Flow
//!
//! ```text
//! ProviderSettings ──▶ ProviderBackend ──▶ ChatTransport ──▶ Translator / ChunkFormatter
//!  (merged, checked)    (Http | Llm)        (one chat call)    (prompts + parsing)
//! ```

pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod llm;
pub mod openai;

use crate::error::{ProviderError, TaskError};
use crate::postprocess::strip_code_fences;
use crate::prompts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub use http::EncodedImage;
pub use llm::LlmBackend;

/// Default generation budget when none (or a non-positive one) is given.
pub const DEFAULT_MAX_TOKENS: usize = 8192;

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Coerce a requested max-tokens value into a usable one.
pub fn sanitize_max_tokens(value: i64) -> usize {
    if value <= 0 {
        DEFAULT_MAX_TOKENS
    } else {
        value as usize
    }
}

// ── Provider kind ────────────────────────────────────────────────────────

/// Wire protocol family of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Gemini,
    Anthropic,
}

impl ProviderKind {
    /// Case-insensitive; anything unrecognised (including empty) is OpenAI.
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "gemini" => ProviderKind::Gemini,
            "anthropic" => ProviderKind::Anthropic,
            _ => ProviderKind::OpenAi,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Settings ─────────────────────────────────────────────────────────────

/// Fully resolved provider configuration for one operation.
#[derive(Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// Empty means "use the protocol's public endpoint".
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: usize,
    pub timeout: Duration,
    /// Ask the model to keep headings, lists and blank lines in its output.
    pub optimize_layout: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: DEFAULT_TIMEOUT,
            optimize_layout: true,
        }
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .field("optimize_layout", &self.optimize_layout)
            .finish()
    }
}

impl ProviderSettings {
    /// Fail fast when a key or model is missing.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.api_key.trim().is_empty() {
            return Err(TaskError::InvalidConfig(format!(
                "{} API key is not configured",
                self.kind
            )));
        }
        if self.model.trim().is_empty() {
            return Err(TaskError::InvalidConfig(format!(
                "{} model is not configured",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Per-request partial settings layered over the defaults and the task's
/// recorded provider. Blank strings and non-positive numbers mean "unset".
#[derive(Debug, Clone, Default)]
pub struct ProviderOverrides {
    pub kind: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<i64>,
    pub timeout: Option<Duration>,
    /// `Some(false)` drops the layout-preservation hint from the OCR prompt.
    pub optimize_layout: Option<bool>,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve the settings for one operation.
///
/// Precedence, lowest first: service defaults, the task's recorded provider
/// snapshot (never carries a key), the request overrides.
pub fn resolve_settings(
    defaults: &ProviderSettings,
    snapshot: Option<&crate::model::ProviderInfo>,
    overrides: &ProviderOverrides,
) -> Result<ProviderSettings, TaskError> {
    let mut cfg = defaults.clone();

    if let Some(info) = snapshot {
        cfg.kind = info.kind;
        if !info.base_url.trim().is_empty() {
            cfg.base_url = info.base_url.clone();
        }
        if !info.model.trim().is_empty() {
            cfg.model = info.model.clone();
        }
        if info.max_tokens > 0 {
            cfg.max_tokens = info.max_tokens;
        }
    }

    if let Some(kind) = non_blank(&overrides.kind) {
        cfg.kind = ProviderKind::normalize(&kind);
    }
    if let Some(base) = non_blank(&overrides.base_url) {
        cfg.base_url = base;
    }
    if let Some(model) = non_blank(&overrides.model) {
        cfg.model = model;
    }
    if let Some(key) = non_blank(&overrides.api_key) {
        cfg.api_key = key;
    }
    if let Some(n) = overrides.max_tokens.filter(|n| *n > 0) {
        cfg.max_tokens = n as usize;
    }
    if let Some(t) = overrides.timeout.filter(|t| !t.is_zero()) {
        cfg.timeout = t;
    }
    if cfg.timeout.is_zero() {
        cfg.timeout = DEFAULT_TIMEOUT;
    }
    cfg.max_tokens = sanitize_max_tokens(cfg.max_tokens as i64);
    if let Some(flag) = overrides.optimize_layout {
        cfg.optimize_layout = flag;
    }

    cfg.validate()?;
    Ok(cfg)
}

// ── Capability types ─────────────────────────────────────────────────────

/// Structured result of reading and translating one page image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrResult {
    #[serde(default)]
    pub has_text: bool,
    #[serde(default)]
    pub source_text: String,
    #[serde(default)]
    pub translated_text: String,
}

/// One contiguous slice of the combined translation sent to the formatter.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatterChunk {
    /// 0-based position in the original text.
    pub index: usize,
    /// Display name, e.g. `chunk-003.txt`.
    pub file_name: String,
    pub text: String,
}

/// OCR + translation of a single rendered page.
#[async_trait]
pub trait Translator: Send + Sync {
    /// `page_number` is carried for diagnostics only.
    async fn translate(&self, image: &Path, page_number: usize)
        -> Result<OcrResult, ProviderError>;
}

/// Layout clean-up of one chunk of translated text.
#[async_trait]
pub trait ChunkFormatter: Send + Sync {
    async fn format_chunk(&self, chunk: &FormatterChunk) -> Result<String, ProviderError>;
}

/// Builds capabilities from settings.
pub trait ProviderBackend: Send + Sync {
    fn translator(
        &self,
        settings: &ProviderSettings,
        target_language: &str,
    ) -> Result<Arc<dyn Translator>, TaskError>;

    fn formatter(&self, settings: &ProviderSettings) -> Result<Arc<dyn ChunkFormatter>, TaskError>;
}

/// Reject formatted output that lost more than half of its input.
pub fn check_not_truncated(chunk: &FormatterChunk, output: &str) -> Result<(), ProviderError> {
    let input_chars = chunk.text.chars().count();
    let output_chars = output.trim().chars().count();
    if output_chars < input_chars / 2 {
        return Err(ProviderError::TruncatedOutput {
            chunk: chunk.index + 1,
            input_chars,
            output_chars,
        });
    }
    Ok(())
}

/// Decode the strict JSON object the OCR prompt asks for.
pub fn parse_ocr_json(provider: &str, raw: &str) -> Result<OcrResult, ProviderError> {
    let clean = strip_code_fences(raw);
    serde_json::from_str(&clean).map_err(|e| ProviderError::InvalidResponse {
        provider: provider.to_string(),
        detail: format!("expected OCR JSON object: {e}"),
    })
}

// ── Transport seam ───────────────────────────────────────────────────────

/// Which unit of work a request belongs to, for log correlation.
#[derive(Debug, Clone, Copy)]
pub enum RequestTag {
    Page(usize),
    Chunk(usize),
}

/// A single-turn chat request: system prompt, user text, optional image.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub image: Option<&'a EncodedImage>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub tag: RequestTag,
}

/// One chat completion against some provider, returning the reply text.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, request: ChatRequest<'_>) -> Result<String, ProviderError>;
}

/// [`Translator`] over any [`ChatTransport`].
pub struct ChatTranslator {
    transport: Arc<dyn ChatTransport>,
    system_prompt: String,
    user_prompt: String,
    max_tokens: usize,
}

impl ChatTranslator {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        settings: &ProviderSettings,
        target_language: &str,
    ) -> Self {
        Self {
            transport,
            system_prompt: prompts::ocr_system_prompt(target_language),
            user_prompt: prompts::ocr_user_prompt(target_language, settings.optimize_layout),
            max_tokens: settings.max_tokens,
        }
    }
}

#[async_trait]
impl Translator for ChatTranslator {
    async fn translate(
        &self,
        image: &Path,
        page_number: usize,
    ) -> Result<OcrResult, ProviderError> {
        let encoded = http::load_image(image).await?;
        let reply = self
            .transport
            .complete(ChatRequest {
                system: &self.system_prompt,
                user: &self.user_prompt,
                image: Some(&encoded),
                max_tokens: self.max_tokens,
                temperature: 0.1,
                tag: RequestTag::Page(page_number),
            })
            .await?;
        let result = parse_ocr_json(self.transport.name(), &reply)?;
        debug!(
            page = page_number,
            has_text = result.has_text,
            chars = result.translated_text.chars().count(),
            "OCR result decoded"
        );
        Ok(result)
    }
}

/// [`ChunkFormatter`] over any [`ChatTransport`].
pub struct ChatFormatter {
    transport: Arc<dyn ChatTransport>,
    max_tokens: usize,
}

impl ChatFormatter {
    pub fn new(transport: Arc<dyn ChatTransport>, settings: &ProviderSettings) -> Self {
        Self {
            transport,
            max_tokens: settings.max_tokens,
        }
    }
}

#[async_trait]
impl ChunkFormatter for ChatFormatter {
    async fn format_chunk(&self, chunk: &FormatterChunk) -> Result<String, ProviderError> {
        let user = prompts::formatter_user_prompt(&chunk.file_name, &chunk.text);
        let reply = self
            .transport
            .complete(ChatRequest {
                system: prompts::FORMATTER_SYSTEM_PROMPT,
                user: &user,
                image: None,
                max_tokens: self.max_tokens,
                temperature: 0.2,
                tag: RequestTag::Chunk(chunk.index + 1),
            })
            .await?;
        let text = crate::postprocess::clean_formatted(&reply);
        if text.is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: self.transport.name().to_string(),
            });
        }
        Ok(text)
    }
}

// ── Default backend ──────────────────────────────────────────────────────

/// Talks to OpenAI-, Gemini- or Anthropic-compatible HTTP endpoints.
#[derive(Debug, Clone, Default)]
pub struct HttpBackend;

impl HttpBackend {
    fn transport(&self, settings: &ProviderSettings) -> Result<Arc<dyn ChatTransport>, TaskError> {
        settings.validate()?;
        Ok(match settings.kind {
            ProviderKind::OpenAi => Arc::new(openai::OpenAiTransport::new(settings)?),
            ProviderKind::Gemini => Arc::new(gemini::GeminiTransport::new(settings)?),
            ProviderKind::Anthropic => Arc::new(anthropic::AnthropicTransport::new(settings)?),
        })
    }
}

impl ProviderBackend for HttpBackend {
    fn translator(
        &self,
        settings: &ProviderSettings,
        target_language: &str,
    ) -> Result<Arc<dyn Translator>, TaskError> {
        let transport = self.transport(settings)?;
        Ok(Arc::new(ChatTranslator::new(
            transport,
            settings,
            target_language,
        )))
    }

    fn formatter(&self, settings: &ProviderSettings) -> Result<Arc<dyn ChunkFormatter>, TaskError> {
        let transport = self.transport(settings)?;
        Ok(Arc::new(ChatFormatter::new(transport, settings)))
    }
}
