pub mod backup;
pub mod chunking;
pub mod classifier;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod pdfium;
pub mod providers;
pub mod rate_limit;
pub mod render;
pub mod search;
pub mod store;
pub mod traits;
pub mod vision;

pub use backup::{export, import, read_backup, write_backup, ImportReport, KnowledgeBackup};
pub use chunking::{chunk_text, normalize_whitespace, split_sentences};
pub use classifier::{classify_document, Classification, Confidence, DocumentKind};
pub use config::{
    ChatConfig, ChunkingConfig, EmbeddingConfig, ExtractionConfig, PipelineConfig,
    RetrievalConfig, SessionCredentials, VisionConfig,
};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingClient, EmbeddingProgress, RetryPolicy,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    ChatError, ConfigError, IngestError, ProviderError, StoreError, VisionError,
};
pub use extractor::{
    extract_direct, extract_smart, ExtractionEvent, ExtractionMode, ExtractionOutput,
    ExtractionStats, OcrStage, PageRecord,
};
pub use ingest::{
    digest_file, discover_pdf_files, IngestEvent, IngestOptions, IngestionReport, Ingestor,
    SkippedPdf,
};
pub use llm::{ChatClient, VisionOcr};
pub use models::{
    ChatMessage, Chunk, ChunkMetadata, Document, PageImage, Role, ScoredChunk, Setting,
    StoreStats, DEFAULT_CATEGORY,
};
pub use orchestrator::{
    Intent, IntentKind, RetrievalOrchestrator, TurnOutcome, TurnResult, EMPTY_KNOWLEDGE_BASE,
    NO_RELEVANT_INFORMATION,
};
pub use pdfium::PdfiumRenderer;
pub use providers::gemini::GeminiEmbeddingService;
pub use providers::groq::GroqChatService;
pub use rate_limit::{RateLimitPolicy, RateLimitWindow, RateLimiter};
pub use render::{encode_page_image, PdfDocument};
pub use search::cosine_similarity;
pub use store::{KnowledgeStore, NewDocument, SCHEMA_VERSION};
pub use traits::{
    ChatService, CompletionOptions, EmbeddingService, OcrService, PageRenderer, PageSource,
    PromptMessage, PromptRole,
};
pub use vision::{partition_batches, BatchResult, VisionAnalysis, VisionBatcher, VisionEvent};
