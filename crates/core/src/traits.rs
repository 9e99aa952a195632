use crate::error::{IngestError, ProviderError};
use crate::models::{ChatMessage, PageImage, Role};
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    pub fn area(&self) -> f64 {
        f64::from(self.width.max(0.0)) * f64::from(self.height.max(0.0))
    }
}

/// Read access to a paginated document. Pages are numbered from 1.
pub trait PageSource {
    fn page_count(&self) -> usize;

    fn page_text(&self, page: u32) -> Result<String, IngestError>;

    fn page_size(&self, page: u32) -> Result<PageSize, IngestError>;
}

pub trait PageRenderer {
    /// Rasterizes a page at `scale` times its nominal size.
    fn render_page(&self, page: u32, scale: f32) -> Result<DynamicImage, IngestError>;
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn provider(&self) -> &str;

    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// A `data:` URL carrying the base64 image.
    ImageUrl(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub parts: Vec<ContentPart>,
}

impl PromptMessage {
    pub fn text(role: PromptRole, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text(PromptRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(PromptRole::User, text)
    }

    pub fn with_images(role: PromptRole, text: impl Into<String>, images: &[PageImage]) -> Self {
        let mut parts = vec![ContentPart::Text(text.into())];
        parts.extend(images.iter().map(|image| ContentPart::ImageUrl(image.data_url())));
        Self { role, parts }
    }

    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, ContentPart::ImageUrl(_)))
    }

    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::ImageUrl(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<&ChatMessage> for PromptMessage {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            Role::User => PromptRole::User,
            Role::Assistant => PromptRole::Assistant,
        };
        Self::text(role, message.content.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2_048,
            top_p: 0.9,
        }
    }
}

/// Chat and vision completions. A response without content yields `""`.
#[async_trait]
pub trait ChatService: Send + Sync {
    fn provider(&self) -> &str;

    async fn complete(
        &self,
        model: &str,
        messages: &[PromptMessage],
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait OcrService: Send + Sync {
    async fn recognize(&self, image: &PageImage, page_hint: u32) -> Result<String, ProviderError>;
}
