use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("document has no pages")]
    EmptyDocument,

    #[error("page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: u32, total: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("image processing failed: {0}")]
    Image(String),

    #[error("page {0} could not be rasterized: no full-page renderer and no embedded image")]
    NothingToRender(u32),

    #[error("full-page renderer unavailable: {0}")]
    RendererUnavailable(String),

    #[error("rendering page {page} failed: {reason}")]
    RenderFailed { page: u32, reason: String },

    #[error("OCR failed on page {page}: {source}")]
    OcrFailed {
        page: u32,
        #[source]
        source: ProviderError,
    },

    #[error("{pages} pages need OCR but the configured ceiling is {limit}; split the document or raise extraction.max_ocr_pages")]
    TooManyOcrPages { pages: usize, limit: usize },

    #[error("no usable text could be extracted from {0}")]
    EmptyExtraction(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures talking to a remote model provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0} client is not initialized: supply an API key first")]
    NotInitialized(&'static str),

    #[error("rate limited by {provider}: {details}")]
    RateLimited { provider: String, details: String },

    #[error("request to {provider} timed out after {}s; try again", .after.as_secs())]
    Timeout { provider: String, after: Duration },

    #[error("{provider} returned {status}: {details}")]
    Api {
        provider: String,
        status: u16,
        details: String,
    },

    #[error("invalid response from {provider}: {details}")]
    MalformedResponse { provider: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("document {document} expects {expected}-dimensional embeddings, chunk has {actual}")]
    DimensionMismatch {
        document: String,
        expected: usize,
        actual: usize,
    },

    #[error("document {0} has no chunks")]
    NoChunks(String),

    #[error("invalid import: {0}")]
    InvalidImport(String),

    #[error("unsupported schema version {0}")]
    UnsupportedSchema(u32),
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("select at least one page to analyze")]
    NoPages,

    #[error("{count} pages selected but direct analysis accepts at most {limit}; deselect pages or use batch analysis")]
    TooManyPages { count: usize, limit: usize },

    #[error("selected pages total {actual_mb:.2} MB but direct analysis accepts at most {limit_mb:.2} MB; select fewer pages or use batch analysis")]
    PayloadTooLarge { actual_mb: f64, limit_mb: f64 },

    #[error("vision request failed: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("query is empty")]
    EmptyQuery,

    #[error("a previous message is still being processed")]
    Busy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
