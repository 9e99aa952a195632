use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use zeroize::{Zeroize, Zeroizing};

const MEGABYTE: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub extraction: ExtractionConfig,
    pub embedding: EmbeddingConfig,
    pub chat: ChatConfig,
    pub retrieval: RetrievalConfig,
    pub vision: VisionConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.max_chars <= self.chunking.min_chars {
            return Err(ConfigError::Invalid(format!(
                "chunking.max_chars ({}) must exceed chunking.min_chars ({})",
                self.chunking.max_chars, self.chunking.min_chars
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimension must be positive".to_string(),
            ));
        }
        if self.embedding.max_requests_per_window == 0 || self.chat.max_requests_per_window == 0 {
            return Err(ConfigError::Invalid(
                "max_requests_per_window must be positive".to_string(),
            ));
        }
        if self.vision.max_images_per_batch == 0 {
            return Err(ConfigError::Invalid(
                "vision.max_images_per_batch must be positive".to_string(),
            ));
        }
        let quality = &self.extraction;
        if !(0.0..=1.0).contains(&quality.min_jpeg_quality)
            || !(0.0..=1.0).contains(&quality.jpeg_quality)
            || quality.min_jpeg_quality > quality.jpeg_quality
        {
            return Err(ConfigError::Invalid(
                "jpeg qualities must lie in 0..=1 with min_jpeg_quality <= jpeg_quality".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_sentences: usize,
    /// Chunks whose trimmed length is at or below this are dropped.
    pub min_chars: usize,
    /// Character overlap between pieces of a force-split sentence.
    pub split_overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 800,
            overlap_sentences: 2,
            min_chars: 50,
            split_overlap_chars: 50,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub sample_pages: usize,
    pub min_text_density: f64,
    pub min_sample_chars: usize,
    /// Pages with fewer extracted characters are sent to OCR.
    pub ocr_threshold: usize,
    pub render_scale: f32,
    pub jpeg_quality: f32,
    pub min_jpeg_quality: f32,
    pub jpeg_quality_step: f32,
    pub max_image_mb: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ocr_delay: Duration,
    pub max_ocr_pages: Option<usize>,
}

impl ExtractionConfig {
    pub fn max_image_bytes(&self) -> usize {
        (self.max_image_mb * MEGABYTE) as usize
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            sample_pages: 3,
            min_text_density: 0.001,
            min_sample_chars: 100,
            ocr_threshold: 100,
            render_scale: 2.0,
            jpeg_quality: 0.9,
            min_jpeg_quality: 0.3,
            jpeg_quality_step: 0.1,
            max_image_mb: 3.5,
            ocr_delay: Duration::from_millis(2_000),
            max_ocr_pages: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub model: String,
    pub dimension: usize,
    pub max_requests_per_window: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub window: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_delay: Duration,
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub backoff_base: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta/".to_string(),
            model: "gemini-embedding-001".to_string(),
            dimension: 3072,
            max_requests_per_window: 15,
            window: Duration::from_secs(60),
            min_delay: Duration::from_millis(4_500),
            max_retries: 3,
            backoff_base: Duration::from_secs(15),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub endpoint: String,
    pub chat_model: String,
    pub vision_model: String,
    pub max_requests_per_window: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub window: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub chat_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub vision_timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.groq.com/openai/v1/".to_string(),
            chat_model: "llama-3.3-70b-versatile".to_string(),
            vision_model: "meta-llama/llama-4-scout-17b-16e-instruct".to_string(),
            max_requests_per_window: 30,
            window: Duration::from_secs(60),
            min_delay: Duration::from_millis(1_000),
            chat_timeout: Duration::from_secs(60),
            vision_timeout: Duration::from_secs(90),
            temperature: 0.3,
            max_tokens: 2_048,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub intent_history: usize,
    pub answer_history: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.25,
            top_k: 5,
            intent_history: 4,
            answer_history: 6,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub max_batch_mb: f64,
    pub max_images_per_batch: usize,
    pub max_direct_pages: usize,
    pub max_direct_mb: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub batch_delay: Duration,
}

impl VisionConfig {
    pub fn max_batch_bytes(&self) -> usize {
        (self.max_batch_mb * MEGABYTE) as usize
    }

    pub fn max_direct_bytes(&self) -> usize {
        (self.max_direct_mb * MEGABYTE) as usize
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            max_batch_mb: 3.0,
            max_images_per_batch: 5,
            max_direct_pages: 5,
            max_direct_mb: 3.5,
            batch_delay: Duration::from_millis(2_000),
        }
    }
}

/// API keys entered for one session. Held in memory only and wiped on drop.
#[derive(Default, Zeroize)]
pub struct SessionCredentials {
    embedding_key: Option<String>,
    chat_key: Option<String>,
}

impl SessionCredentials {
    pub fn new(embedding_key: Option<String>, chat_key: Option<String>) -> Self {
        Self {
            embedding_key: embedding_key.filter(|key| !key.trim().is_empty()),
            chat_key: chat_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn embedding_key(&self) -> Option<Zeroizing<String>> {
        self.embedding_key.clone().map(Zeroizing::new)
    }

    pub fn chat_key(&self) -> Option<Zeroizing<String>> {
        self.chat_key.clone().map(Zeroizing::new)
    }

    pub fn has_chat_key(&self) -> bool {
        self.chat_key.is_some()
    }

    pub fn end_session(&mut self) {
        self.zeroize();
        self.embedding_key = None;
        self.chat_key = None;
    }
}

impl Drop for SessionCredentials {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("embedding_key", &self.embedding_key.as_ref().map(|_| "<redacted>"))
            .field("chat_key", &self.chat_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_limits() {
        let config = PipelineConfig::default();
        assert_eq!(config.chunking.max_chars, 800);
        assert_eq!(config.embedding.max_requests_per_window, 15);
        assert_eq!(config.embedding.min_delay, Duration::from_millis(4_500));
        assert_eq!(config.vision.max_images_per_batch, 5);
        assert!((config.retrieval.similarity_threshold - 0.25).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults_and_reads_millis() -> Result<(), Box<dyn std::error::Error>> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "[embedding]\nmin_delay = 1000\n\n[retrieval]\nsimilarity_threshold = 0.4"
        )?;

        let config = PipelineConfig::load(file.path())?;
        assert_eq!(config.embedding.min_delay, Duration::from_millis(1_000));
        assert_eq!(config.embedding.dimension, 3072);
        assert!((config.retrieval.similarity_threshold - 0.4).abs() < f32::EPSILON);
        Ok(())
    }

    #[test]
    fn invalid_chunk_limits_are_rejected() {
        let mut config = PipelineConfig::default();
        config.chunking.max_chars = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn credentials_are_redacted_and_cleared() {
        let mut credentials =
            SessionCredentials::new(Some("secret-a".to_string()), Some("  ".to_string()));
        assert!(!credentials.has_chat_key());
        assert!(!format!("{credentials:?}").contains("secret-a"));

        credentials.end_session();
        assert!(credentials.embedding_key().is_none());
    }
}
