use crate::chunking::chunk_text;
use crate::config::PipelineConfig;
use crate::embeddings::{EmbeddingClient, EmbeddingProgress};
use crate::error::IngestError;
use crate::extractor::{extract_direct, extract_smart, ExtractionEvent, ExtractionMode};
use crate::models::{ChunkDraft, ChunkMetadata, Document};
use crate::render::PdfDocument;
use crate::store::{KnowledgeStore, NewDocument};
use crate::traits::{OcrService, PageRenderer, PageSource};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    Ok(digest_bytes(&fs::read(path)?))
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub category: Option<String>,
    pub mode: ExtractionMode,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            category: None,
            mode: ExtractionMode::Smart,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Extraction(ExtractionEvent),
    Chunked { chunks: usize },
    Embedding(EmbeddingProgress),
    Stored { document_id: String },
}

pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

pub struct IngestionReport {
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedPdf>,
}

/// PDF → text → chunks → vectors → store.
pub struct Ingestor<'a> {
    store: &'a KnowledgeStore,
    embeddings: &'a EmbeddingClient,
    ocr: Option<&'a dyn OcrService>,
    config: &'a PipelineConfig,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        store: &'a KnowledgeStore,
        embeddings: &'a EmbeddingClient,
        ocr: Option<&'a dyn OcrService>,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            ocr,
            config,
        }
    }

    pub async fn ingest_pdf(
        &self,
        path: &Path,
        options: &IngestOptions,
        on_progress: &mut dyn FnMut(IngestEvent),
    ) -> Result<Document, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        let name = file_name(path)?;
        let pdf = PdfDocument::from_bytes(&bytes)?;

        self.ingest_source(&name, &pdf, &pdf, Some(digest_bytes(&bytes)), options, on_progress)
            .await
    }

    /// Runs the pipeline over any page source. Nothing is stored unless
    /// every step succeeds.
    pub async fn ingest_source(
        &self,
        name: &str,
        source: &dyn PageSource,
        renderer: &dyn PageRenderer,
        checksum: Option<String>,
        options: &IngestOptions,
        on_progress: &mut dyn FnMut(IngestEvent),
    ) -> Result<Document, IngestError> {
        let extraction = match options.mode {
            ExtractionMode::Direct => {
                extract_direct(source, &mut |event| on_progress(IngestEvent::Extraction(event)))?
            }
            ExtractionMode::Smart => {
                extract_smart(
                    source,
                    renderer,
                    self.ocr,
                    &self.config.extraction,
                    &mut |event| on_progress(IngestEvent::Extraction(event)),
                )
                .await?
            }
        };

        let chunks = chunk_text(&extraction.full_text, &self.config.chunking);
        if chunks.is_empty() {
            return Err(IngestError::EmptyExtraction(name.to_string()));
        }
        on_progress(IngestEvent::Chunked {
            chunks: chunks.len(),
        });
        tracing::info!(name, chunks = chunks.len(), ocr = extraction.ocr_applied(), "chunked document");

        let vectors = self
            .embeddings
            .embed_batch(&chunks, &mut |progress| on_progress(IngestEvent::Embedding(progress)))
            .await?;

        let ocr_applied = extraction.ocr_applied();
        let drafts = chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(chunk_index, (content, embedding))| ChunkDraft {
                content,
                embedding,
                metadata: ChunkMetadata {
                    file_name: name.to_string(),
                    ocr_applied,
                    chunk_index,
                },
            })
            .collect::<Vec<_>>();

        let document = self.store.add_document(
            NewDocument {
                name: name.to_string(),
                category: options.category.clone(),
                checksum,
            },
            drafts,
        )?;

        on_progress(IngestEvent::Stored {
            document_id: document.id.clone(),
        });
        Ok(document)
    }

    /// Ingests every PDF under `folder`. Files that fail, or whose checksum is
    /// already in the store, are reported and skipped.
    pub async fn ingest_folder(
        &self,
        folder: &Path,
        options: &IngestOptions,
        on_progress: &mut dyn FnMut(&Path, IngestEvent),
    ) -> Result<IngestionReport, IngestError> {
        let files = discover_pdf_files(folder);

        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }

        let mut documents = Vec::new();
        let mut skipped_files = Vec::new();

        for path in files {
            if let Some(existing) = digest_file(&path)
                .ok()
                .and_then(|checksum| self.store.find_by_checksum(&checksum))
            {
                skipped_files.push(SkippedPdf {
                    path,
                    reason: format!("already ingested as {}", existing.name),
                });
                continue;
            }

            let result = self
                .ingest_pdf(&path, options, &mut |event| on_progress(path.as_path(), event))
                .await;

            match result {
                Ok(document) => documents.push(document),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping pdf");
                    skipped_files.push(SkippedPdf {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(IngestionReport {
            documents,
            skipped_files,
        })
    }
}

fn file_name(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            IngestError::InvalidArgument(format!("path missing filename: {}", path.display()))
        })
}
