use crate::config::EmbeddingConfig;
use crate::error::ProviderError;
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::traits::EmbeddingService;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbeddingProgress {
    pub current: usize,
    pub total: usize,
    pub estimated_remaining: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Paced, retrying front for an [`EmbeddingService`].
///
/// Starts uninitialized; every call fails with
/// [`ProviderError::NotInitialized`] until a service is installed.
pub struct EmbeddingClient {
    service: Option<Arc<dyn EmbeddingService>>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    dimension: usize,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let limiter = RateLimiter::new(
            "embedding",
            RateLimitPolicy {
                max_requests: config.max_requests_per_window,
                window: config.window,
                min_delay: config.min_delay,
            },
        );
        Self::with_limiter(config, Arc::new(limiter))
    }

    pub fn with_limiter(config: &EmbeddingConfig, limiter: Arc<RateLimiter>) -> Self {
        Self {
            service: None,
            limiter,
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.backoff_base,
            },
            dimension: config.dimension,
        }
    }

    pub fn initialize(&mut self, service: Arc<dyn EmbeddingService>) {
        self.service = Some(service);
    }

    pub fn with_service(mut self, service: Arc<dyn EmbeddingService>) -> Self {
        self.initialize(service);
        self
    }

    /// Drops the provider (and the key it holds) at session end.
    pub fn reset(&mut self) {
        self.service = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.service.is_some()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let service = self
            .service
            .as_ref()
            .ok_or(ProviderError::NotInitialized("embedding"))?;

        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            match service.embed(text, self.dimension).await {
                Ok(vector) => return Ok(vector),
                Err(error) if error.is_rate_limited() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        provider = service.provider(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "embedding rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Embeds every text in order, reporting after each item.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        on_progress: &mut dyn FnMut(EmbeddingProgress),
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if !self.is_initialized() {
            return Err(ProviderError::NotInitialized("embedding"));
        }

        let total = texts.len();
        let min_delay = self.limiter.policy().min_delay;
        let mut vectors = Vec::with_capacity(total);

        for (index, text) in texts.iter().enumerate() {
            vectors.push(self.embed(text).await?);

            let current = index + 1;
            on_progress(EmbeddingProgress {
                current,
                total,
                estimated_remaining: min_delay.saturating_mul((total - current) as u32),
            });
        }

        Ok(vectors)
    }
}

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Offline embedder hashing character trigrams into buckets. Deterministic,
/// so it backs tests and `--offline` runs.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str, dimension: usize) -> Vec<f32> {
        let mut vector = vec![0f32; dimension.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingService for CharacterNgramEmbedder {
    fn provider(&self) -> &str {
        "ngram"
    }

    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, ProviderError> {
        let dimension = if dimension == 0 { self.dimensions } else { dimension };
        Ok(self.embed_text(text, dimension))
    }
}
