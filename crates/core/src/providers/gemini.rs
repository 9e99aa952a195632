use super::{classify_failure, transport_error};
use crate::config::EmbeddingConfig;
use crate::error::ProviderError;
use crate::traits::EmbeddingService;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;
use zeroize::Zeroizing;

const PROVIDER: &str = "gemini";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedContentRequest<'a> {
    model: String,
    content: RequestContent<'a>,
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedContentResponse {
    embedding: Option<ContentEmbedding>,
}

#[derive(Debug, Deserialize)]
struct ContentEmbedding {
    #[serde(default)]
    values: Vec<f32>,
}

/// Gemini `embedContent` client. The key travels in a header, never the URL.
pub struct GeminiEmbeddingService {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Zeroizing<String>,
    timeout: Duration,
}

impl GeminiEmbeddingService {
    pub fn new(config: &EmbeddingConfig, api_key: Zeroizing<String>) -> Result<Self, ProviderError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(&config.endpoint)?,
            model: config.model.clone(),
            api_key,
            timeout: config.request_timeout,
        })
    }
}

#[async_trait]
impl EmbeddingService for GeminiEmbeddingService {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, ProviderError> {
        let url = self
            .endpoint
            .join(&format!("models/{}:embedContent", self.model))?;
        let payload = EmbedContentRequest {
            model: format!("models/{}", self.model),
            content: RequestContent {
                parts: [TextPart { text }],
            },
            output_dimensionality: dimension,
        };

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", self.api_key.as_str())
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|error| transport_error(PROVIDER, error, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(PROVIDER, status, body));
        }

        let body: EmbedContentResponse = response
            .json()
            .await
            .map_err(|error| transport_error(PROVIDER, error, self.timeout))?;
        parse_embedding(body, dimension)
    }
}

fn parse_embedding(body: EmbedContentResponse, dimension: usize) -> Result<Vec<f32>, ProviderError> {
    let values = body
        .embedding
        .map(|embedding| embedding.values)
        .unwrap_or_default();

    if values.is_empty() {
        return Err(ProviderError::MalformedResponse {
            provider: PROVIDER.to_string(),
            details: "response carried no embedding values".to_string(),
        });
    }

    if dimension > 0 && values.len() != dimension {
        return Err(ProviderError::MalformedResponse {
            provider: PROVIDER.to_string(),
            details: format!("expected {dimension} dimensions, got {}", values.len()),
        });
    }

    Ok(values)
}
