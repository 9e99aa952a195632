use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_rag_core::{
    encode_page_image, export, import, read_backup, write_backup, CharacterNgramEmbedder,
    ChatClient, ChatMessage, EmbeddingClient, ExtractionEvent, ExtractionMode,
    GeminiEmbeddingService, GroqChatService, IngestEvent, IngestOptions, Ingestor,
    KnowledgeStore, OcrService, PageImage, PageRenderer, PageSource, PdfDocument, PipelineConfig,
    RetrievalOrchestrator, SessionCredentials, TurnOutcome, VisionBatcher, VisionEvent,
    VisionOcr, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Knowledge base snapshot file
    #[arg(long, default_value = "pdf-rag.json")]
    store: PathBuf,

    /// Optional TOML pipeline configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gemini API key used for embeddings
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    /// Groq API key used for chat, OCR and vision
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    groq_api_key: Option<String>,

    /// Use the local n-gram embedder instead of the remote embedding service
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest PDF files or folders into the knowledge base.
    Ingest {
        /// Files or folders (searched recursively).
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Category label for the new documents.
        #[arg(long)]
        category: Option<String>,
        /// Read the text layer only, never OCR.
        #[arg(long, default_value_t = false)]
        direct: bool,
    },
    /// Ask a question about the ingested documents.
    Ask {
        question: String,
        /// Restrict retrieval to these categories.
        #[arg(long = "category")]
        categories: Vec<String>,
        /// Print the retrieved chunks with their similarity.
        #[arg(long, default_value_t = false)]
        sources: bool,
    },
    /// Show or clear the chat history.
    History {
        #[arg(long, default_value_t = false)]
        clear: bool,
    },
    /// List documents, or delete one with its chunks.
    Documents {
        #[arg(long)]
        delete: Option<String>,
    },
    /// Manage document categories.
    Categories {
        #[command(subcommand)]
        action: Option<CategoryAction>,
    },
    /// Write a JSON backup of the knowledge base.
    Export { path: PathBuf },
    /// Load a JSON backup.
    Import {
        path: PathBuf,
        /// Remove all existing data first.
        #[arg(long, default_value_t = false)]
        clear: bool,
    },
    /// Analyze PDF pages as images with the vision model.
    Vision {
        pdf: PathBuf,
        #[arg(long)]
        prompt: String,
        /// 1-based page numbers; all pages when omitted.
        #[arg(long, value_delimiter = ',')]
        pages: Vec<u32>,
        /// Always use batched analysis.
        #[arg(long, default_value_t = false)]
        batch: bool,
    },
    /// Show or change settings.
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Remove every document, message and setting.
    Reset,
}

#[derive(Subcommand)]
enum CategoryAction {
    Rename { from: String, to: String },
    Delete { name: String },
}

#[derive(Subcommand)]
enum SettingsAction {
    Get { key: String },
    /// Value is parsed as JSON, falling back to a plain string.
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let mut cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if cli.offline {
        config.embedding.dimension = DEFAULT_EMBEDDING_DIMENSIONS;
    }

    let mut credentials =
        SessionCredentials::new(cli.gemini_api_key.take(), cli.groq_api_key.take());

    let store = KnowledgeStore::open(&cli.store)
        .with_context(|| format!("opening knowledge base {}", cli.store.display()))?;

    let mut embeddings = EmbeddingClient::new(&config.embedding);
    if cli.offline {
        embeddings.initialize(Arc::new(CharacterNgramEmbedder::default()));
    } else if let Some(key) = credentials.embedding_key() {
        embeddings.initialize(Arc::new(GeminiEmbeddingService::new(&config.embedding, key)?));
    }

    let mut chat = ChatClient::new(&config.chat);
    if let Some(key) = credentials.chat_key() {
        chat.initialize(Arc::new(GroqChatService::new(&config.chat, key)?));
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        store = %cli.store.display(),
        offline = cli.offline,
        "pdf-rag boot"
    );

    let outcome = run(cli.command, &config, &store, &embeddings, &chat).await;

    embeddings.reset();
    chat.reset();
    credentials.end_session();
    outcome
}

async fn run(
    command: Command,
    config: &PipelineConfig,
    store: &KnowledgeStore,
    embeddings: &EmbeddingClient,
    chat: &ChatClient,
) -> anyhow::Result<()> {
    match command {
        Command::Ingest {
            paths,
            category,
            direct,
        } => {
            let vision_ocr = VisionOcr::new(chat);
            let ocr = chat
                .is_initialized()
                .then_some(&vision_ocr as &dyn OcrService);
            let ingestor = Ingestor::new(store, embeddings, ocr, config);
            let options = IngestOptions {
                category,
                mode: if direct {
                    ExtractionMode::Direct
                } else {
                    ExtractionMode::Smart
                },
            };

            for path in paths {
                if path.is_dir() {
                    let report = ingestor
                        .ingest_folder(&path, &options, &mut |file, event| {
                            report_ingest(file, &event)
                        })
                        .await?;
                    for document in &report.documents {
                        println!("{} chunks ingested from {}", document.chunk_count, document.name);
                    }
                    for skipped in report.skipped_files {
                        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
                    }
                } else {
                    let document = ingestor
                        .ingest_pdf(&path, &options, &mut |event| report_ingest(&path, &event))
                        .await
                        .with_context(|| format!("ingesting {}", path.display()))?;
                    println!(
                        "{} chunks ingested from {} [{}] at {}",
                        document.chunk_count,
                        document.name,
                        document.category,
                        Utc::now().to_rfc3339()
                    );
                }
            }
        }
        Command::Ask {
            question,
            categories,
            sources,
        } => {
            let orchestrator =
                RetrievalOrchestrator::new(store, embeddings, chat, config.retrieval.clone());
            let result = orchestrator.handle_turn(&question, &categories).await?;

            println!("{}", result.answer);
            if let TurnOutcome::NoRelevantInformation {
                best_similarity: Some(similarity),
            } = result.outcome
            {
                info!(similarity, "best match below threshold");
            }
            if sources {
                for hit in &result.sources {
                    println!(
                        "  [{:.4}] {} #{}",
                        hit.similarity, hit.chunk.metadata.file_name, hit.chunk.metadata.chunk_index
                    );
                }
            }
        }
        Command::History { clear } => {
            if clear {
                println!("{} messages removed", store.clear_history()?);
            } else {
                for message in store.history() {
                    println!(
                        "[{}] {}: {}",
                        message.timestamp.to_rfc3339(),
                        message.role.as_str(),
                        message.content
                    );
                }
            }
        }
        Command::Documents { delete } => match delete {
            Some(id) => {
                let document = store
                    .document(&id)
                    .with_context(|| format!("no document with id {id}"))?;
                let chunks = store.delete_document(&id)?;
                println!("deleted {} and {chunks} chunks", document.name);
            }
            None => {
                for document in store.documents() {
                    println!(
                        "{} {} [{}] chunks={} dim={} created={}",
                        document.id,
                        document.name,
                        document.category,
                        document.chunk_count,
                        document.embedding_dimension,
                        document.created_at.to_rfc3339()
                    );
                }
                let stats = store.stats();
                println!(
                    "documents={} chunks={} messages={}",
                    stats.documents, stats.chunks, stats.messages
                );
            }
        },
        Command::Categories { action } => match action {
            None => {
                for (category, count) in store.categories() {
                    println!("{category}: {count}");
                }
            }
            Some(CategoryAction::Rename { from, to }) => {
                println!("{} documents moved", store.rename_category(&from, &to)?);
            }
            Some(CategoryAction::Delete { name }) => {
                let (documents, chunks) = store.delete_category(&name)?;
                println!("deleted {documents} documents and {chunks} chunks");
            }
        },
        Command::Export { path } => {
            write_backup(&export(store), &path)?;
            println!("exported to {}", path.display());
        }
        Command::Import { path, clear } => {
            let report = import(store, read_backup(&path)?, clear)?;
            println!(
                "imported documents={} chunks={} messages={} settings={}",
                report.documents, report.chunks, report.messages, report.settings
            );
        }
        Command::Vision {
            pdf,
            prompt,
            pages,
            batch,
        } => {
            let images = render_pages(&pdf, &pages, config)?;
            let history = store.recent_history(config.retrieval.answer_history);
            let batcher = VisionBatcher::new(chat, config.vision.clone());
            let mut report = |event: VisionEvent| match event {
                VisionEvent::Start { total_batches } => info!(total_batches, "vision analysis started"),
                VisionEvent::Batch {
                    current,
                    total_batches,
                    pages,
                } => info!(current, total_batches, ?pages, "analyzing batch"),
                VisionEvent::Synthesize => info!("synthesizing batches"),
                VisionEvent::Complete => info!("vision analysis complete"),
            };

            store.append_message(ChatMessage::user(prompt.clone()))?;
            let analysis = if batch {
                batcher.batch_analyze(images, &prompt, &history, &mut report).await
            } else {
                batcher.analyze(images, &prompt, &history, &mut report).await
            };

            match analysis {
                Ok(analysis) => {
                    store.append_message(ChatMessage::assistant(analysis.response.clone()))?;
                    println!("{}", analysis.response);
                }
                Err(error) => {
                    store.append_message(ChatMessage::assistant(format!(
                        "Sorry, something went wrong: {error}"
                    )))?;
                    return Err(error.into());
                }
            }
        }
        Command::Settings { action } => match action {
            None => {
                for setting in store.settings() {
                    println!("{} = {}", setting.key, setting.value);
                }
            }
            Some(SettingsAction::Get { key }) => match store.setting(&key) {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("no setting named {key}"),
            },
            Some(SettingsAction::Set { key, value }) => {
                store.set_setting(&key, setting_value(&value))?;
                println!("{key} updated");
            }
        },
        Command::Reset => {
            store.clear_all()?;
            println!("knowledge base cleared");
        }
    }

    Ok(())
}

fn report_ingest(path: &Path, event: &IngestEvent) {
    match event {
        IngestEvent::Extraction(ExtractionEvent::Complete { message, .. }) => {
            info!(path = %path.display(), "{message}")
        }
        IngestEvent::Extraction(event) => {
            tracing::debug!(path = %path.display(), "{}", event.message())
        }
        IngestEvent::Chunked { chunks } => info!(path = %path.display(), chunks, "chunked"),
        IngestEvent::Embedding(progress) => info!(
            path = %path.display(),
            current = progress.current,
            total = progress.total,
            remaining_s = progress.estimated_remaining.as_secs(),
            "embedding"
        ),
        IngestEvent::Stored { document_id } => info!(path = %path.display(), %document_id, "stored"),
    }
}

fn render_pages(
    path: &Path,
    pages: &[u32],
    config: &PipelineConfig,
) -> anyhow::Result<Vec<PageImage>> {
    let pdf = PdfDocument::open(path).with_context(|| format!("opening {}", path.display()))?;
    let selected = if pages.is_empty() {
        (1..=pdf.page_count() as u32).collect::<Vec<_>>()
    } else {
        pages.to_vec()
    };

    let scale = config.extraction.render_scale;
    selected
        .into_iter()
        .map(|page| -> anyhow::Result<PageImage> {
            let image = pdf.render_page(page, scale)?;
            Ok(encode_page_image(&image, page, scale, &config.extraction)?)
        })
        .collect()
}

fn setting_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
