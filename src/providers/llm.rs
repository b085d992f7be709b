//! Adapter over a pre-built [`edgequake_llm::LLMProvider`].
//!
//! Lets callers reuse any provider the `edgequake-llm` factory knows
//! (Ollama, Azure OpenAI, OpenRouter, …) in place of the built-in HTTP
//! transports. Kind, base URL and key in [`ProviderSettings`] are ignored;
//! only `max_tokens` and the layout flag are honoured.

use super::{
    ChatFormatter, ChatRequest, ChatTransport, ChatTranslator, ChunkFormatter, ProviderBackend,
    ProviderSettings, Translator,
};
use crate::error::{ProviderError, TaskError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::debug;

/// [`ProviderBackend`] that routes every call through one `LLMProvider`.
#[derive(Clone)]
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl LlmBackend {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }

    /// Resolve a provider by name via `ProviderFactory` (reads the usual
    /// `*_API_KEY` environment variables).
    pub fn from_factory(name: &str, model: Option<&str>) -> Result<Self, TaskError> {
        let llm = ProviderFactory::create_llm_provider(name, model.unwrap_or("gpt-4.1-nano"))
            .map_err(|e| {
                TaskError::InvalidConfig(format!("LLM provider '{name}' unavailable: {e}"))
            })?;
        Ok(Self::new(llm, name))
    }

    fn transport(&self) -> Arc<dyn ChatTransport> {
        Arc::new(LlmTransport {
            provider: Arc::clone(&self.provider),
            label: self.label.clone(),
        })
    }
}

impl ProviderBackend for LlmBackend {
    fn translator(
        &self,
        settings: &ProviderSettings,
        target_language: &str,
    ) -> Result<Arc<dyn Translator>, TaskError> {
        Ok(Arc::new(ChatTranslator::new(
            self.transport(),
            settings,
            target_language,
        )))
    }

    fn formatter(&self, settings: &ProviderSettings) -> Result<Arc<dyn ChunkFormatter>, TaskError> {
        Ok(Arc::new(ChatFormatter::new(self.transport(), settings)))
    }
}

struct LlmTransport {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

fn build_messages(req: &ChatRequest<'_>) -> Vec<ChatMessage> {
    let images = req
        .image
        .map(|img| vec![ImageData::new(img.base64.clone(), img.mime).with_detail("high")])
        .unwrap_or_default();
    vec![
        ChatMessage::system(req.system),
        ChatMessage::user_with_images(req.user, images),
    ]
}

#[async_trait]
impl ChatTransport for LlmTransport {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, req: ChatRequest<'_>) -> Result<String, ProviderError> {
        let messages = build_messages(&req);
        let options = CompletionOptions {
            temperature: Some(req.temperature),
            max_tokens: Some(req.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ProviderError::Transport {
                provider: self.label.clone(),
                detail: e.to_string(),
            })?;

        debug!(
            tag = ?req.tag,
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            "{} reply", self.label
        );

        if response.content.trim().is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: self.label.clone(),
            });
        }
        Ok(response.content.trim().to_string())
    }
}
