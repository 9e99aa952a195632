use crate::config::ChatConfig;
use crate::error::ProviderError;
use crate::models::PageImage;
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::traits::{ChatService, CompletionOptions, OcrService, PromptMessage, PromptRole};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const ILLEGIBLE_MARKER: &str = "[illegible]";

const OCR_SYSTEM_PROMPT: &str = "You are a precise OCR engine. Transcribe every piece of visible text \
from the page image exactly as written. Preserve headings, paragraphs and list structure. \
Convert tables to Markdown tables. Replace characters you cannot read with [illegible]. \
Output only the transcription, with no commentary, preamble or explanation.";

/// Paced front for a [`ChatService`] with explicit per-call timeouts.
pub struct ChatClient {
    service: Option<Arc<dyn ChatService>>,
    limiter: Arc<RateLimiter>,
    chat_model: String,
    vision_model: String,
    chat_timeout: Duration,
    vision_timeout: Duration,
    options: CompletionOptions,
}

impl ChatClient {
    pub fn new(config: &ChatConfig) -> Self {
        let limiter = RateLimiter::new(
            "chat",
            RateLimitPolicy {
                max_requests: config.max_requests_per_window,
                window: config.window,
                min_delay: config.min_delay,
            },
        );

        Self {
            service: None,
            limiter: Arc::new(limiter),
            chat_model: config.chat_model.clone(),
            vision_model: config.vision_model.clone(),
            chat_timeout: config.chat_timeout,
            vision_timeout: config.vision_timeout,
            options: CompletionOptions {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                top_p: config.top_p,
            },
        }
    }

    pub fn initialize(&mut self, service: Arc<dyn ChatService>) {
        self.service = Some(service);
    }

    pub fn with_service(mut self, service: Arc<dyn ChatService>) -> Self {
        self.initialize(service);
        self
    }

    pub fn reset(&mut self) {
        self.service = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.service.is_some()
    }

    pub async fn complete(
        &self,
        messages: &[PromptMessage],
        options: Option<CompletionOptions>,
    ) -> Result<String, ProviderError> {
        self.call(
            &self.chat_model,
            messages,
            options.unwrap_or(self.options),
            self.chat_timeout,
        )
        .await
    }

    pub async fn complete_with_images(
        &self,
        messages: &[PromptMessage],
        options: Option<CompletionOptions>,
    ) -> Result<String, ProviderError> {
        self.call(
            &self.vision_model,
            messages,
            options.unwrap_or(self.options),
            self.vision_timeout,
        )
        .await
    }

    async fn call(
        &self,
        model: &str,
        messages: &[PromptMessage],
        options: CompletionOptions,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        let service = self
            .service
            .as_ref()
            .ok_or(ProviderError::NotInitialized("chat"))?;

        self.limiter.acquire().await;
        tracing::debug!(provider = service.provider(), model, messages = messages.len(), "completion request");

        match tokio::time::timeout(timeout, service.complete(model, messages, &options)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                provider: service.provider().to_string(),
                after: timeout,
            }),
        }
    }
}

/// OCR through the vision model with a transcription-only prompt.
pub struct VisionOcr<'a> {
    chat: &'a ChatClient,
}

impl<'a> VisionOcr<'a> {
    pub fn new(chat: &'a ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl<'a> OcrService for VisionOcr<'a> {
    async fn recognize(&self, image: &PageImage, page_hint: u32) -> Result<String, ProviderError> {
        let messages = [
            PromptMessage::system(OCR_SYSTEM_PROMPT),
            PromptMessage::with_images(
                PromptRole::User,
                format!("Transcribe page {page_hint}."),
                std::slice::from_ref(image),
            ),
        ];
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: 4_096,
            top_p: 1.0,
        };

        let text = self.chat.complete_with_images(&messages, Some(options)).await?;
        Ok(text.trim().to_string())
    }
}
