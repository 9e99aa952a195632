use crate::error::StoreError;
use crate::models::{
    ChatMessage, Chunk, ChunkDraft, Document, ScoredChunk, Setting, StoreStats, DEFAULT_CATEGORY,
};
use crate::search::rank_chunks;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Snapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl Snapshot {
    fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION,
            ..Self::default()
        }
    }
}

/// On-disk layout of the knowledge file: documents and their vectors.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KnowledgeFile<'a> {
    version: u32,
    documents: &'a [Document],
    chunks: &'a [Chunk],
}

/// On-disk layout of the session file next to it.
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFile {
    #[serde(default)]
    chat_history: Vec<ChatMessage>,
    #[serde(default)]
    settings: BTreeMap<String, serde_json::Value>,
}

/// Which of the two files a transaction rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Knowledge,
    Session,
    All,
}

impl Scope {
    fn knowledge(self) -> bool {
        matches!(self, Scope::Knowledge | Scope::All)
    }

    fn session(self) -> bool {
        matches!(self, Scope::Session | Scope::All)
    }
}

/// `kb.json` keeps its session in `kb.session.json`.
fn session_path(path: &Path) -> PathBuf {
    path.with_extension("session.json")
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let staging = path.with_extension("tmp");
    fs::write(&staging, bytes)?;
    fs::rename(&staging, path)?;
    Ok(())
}

/// New document metadata; the store assigns ids and timestamps.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub category: Option<String>,
    pub checksum: Option<String>,
}

/// Documents and chunks persist to one JSON file, chat history and settings
/// to a sibling session file, so a chat turn never rewrites the vectors.
/// Every mutation is applied to a copy that is written before it replaces
/// the live state.
pub struct KnowledgeStore {
    path: Option<PathBuf>,
    state: RwLock<Snapshot>,
}

impl KnowledgeStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(Snapshot::empty()),
        }
    }

    /// Opens (or creates) the knowledge base at `path`, upgrading older
    /// schemas. Files that still carry history or settings inline have them
    /// moved to the session file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut snapshot = if path.exists() {
            let bytes = fs::read(&path)?;
            serde_json::from_slice::<Snapshot>(&bytes)?
        } else {
            Snapshot::empty()
        };

        if snapshot.version > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema(snapshot.version));
        }

        let inline_session = !snapshot.chat_history.is_empty() || !snapshot.settings.is_empty();
        let session = session_path(&path);
        if session.exists() {
            let SessionFile {
                chat_history,
                settings,
            } = serde_json::from_slice(&fs::read(&session)?)?;
            snapshot.chat_history.extend(chat_history);
            snapshot.settings.extend(settings);
        }

        let needs_migration = snapshot.version < SCHEMA_VERSION;
        let store = Self {
            path: Some(path),
            state: RwLock::new(snapshot),
        };

        if needs_migration || inline_session {
            let backfilled = store.transaction(Scope::All, |state| Ok(migrate(state)))?;
            tracing::info!(
                backfilled,
                inline_session,
                version = SCHEMA_VERSION,
                "migrated knowledge base layout"
            );
        }

        Ok(store)
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` to a copy of the state, writes the files `scope`
    /// names, then swaps the copy in.
    pub(crate) fn transaction<T>(
        &self,
        scope: Scope,
        change: impl FnOnce(&mut Snapshot) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut live = self.write();
        let mut draft = live.clone();
        let outcome = change(&mut draft)?;
        self.persist(&draft, scope)?;
        *live = draft;
        Ok(outcome)
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        self.read().clone()
    }

    fn persist(&self, snapshot: &Snapshot, scope: Scope) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if scope.knowledge() {
            let file = KnowledgeFile {
                version: snapshot.version,
                documents: &snapshot.documents,
                chunks: &snapshot.chunks,
            };
            write_atomic(path, &serde_json::to_vec(&file)?)?;
        }
        if scope.session() {
            let file = SessionFile {
                chat_history: snapshot.chat_history.clone(),
                settings: snapshot.settings.clone(),
            };
            write_atomic(&session_path(path), &serde_json::to_vec(&file)?)?;
        }
        Ok(())
    }

    /// Stores a document and all of its chunks in one transaction.
    pub fn add_document(
        &self,
        document: NewDocument,
        drafts: Vec<ChunkDraft>,
    ) -> Result<Document, StoreError> {
        if drafts.is_empty() {
            return Err(StoreError::NoChunks(document.name));
        }

        let embedding_dimension = drafts[0].embedding.len();
        for draft in &drafts {
            if draft.embedding.len() != embedding_dimension || embedding_dimension == 0 {
                return Err(StoreError::DimensionMismatch {
                    document: document.name.clone(),
                    expected: embedding_dimension,
                    actual: draft.embedding.len(),
                });
            }
        }

        let record = Document {
            id: Uuid::new_v4().to_string(),
            name: document.name,
            category: normalize_category(document.category.as_deref()),
            created_at: Utc::now(),
            chunk_count: drafts.len(),
            embedding_dimension,
            checksum: document.checksum,
        };

        let chunks = drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                let mut metadata = draft.metadata;
                metadata.chunk_index = index;
                Chunk {
                    id: Uuid::new_v4().to_string(),
                    document_id: record.id.clone(),
                    content: draft.content,
                    embedding: draft.embedding,
                    metadata,
                }
            })
            .collect::<Vec<_>>();

        self.transaction(Scope::Knowledge, |state| {
            state.documents.push(record.clone());
            state.chunks.extend(chunks);
            Ok(())
        })?;

        tracing::info!(
            document_id = %record.id,
            name = %record.name,
            chunks = record.chunk_count,
            "stored document"
        );
        Ok(record)
    }

    pub fn documents(&self) -> Vec<Document> {
        let mut documents = self.read().documents.clone();
        documents.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        documents
    }

    pub fn document(&self, id: &str) -> Option<Document> {
        self.read()
            .documents
            .iter()
            .find(|document| document.id == id)
            .cloned()
    }

    pub fn find_by_checksum(&self, checksum: &str) -> Option<Document> {
        self.read()
            .documents
            .iter()
            .find(|document| document.checksum.as_deref() == Some(checksum))
            .cloned()
    }

    /// Deletes a document and every chunk that references it.
    pub fn delete_document(&self, id: &str) -> Result<usize, StoreError> {
        self.transaction(Scope::Knowledge, |state| {
            let before = state.documents.len();
            state.documents.retain(|document| document.id != id);
            if state.documents.len() == before {
                return Err(StoreError::UnknownDocument(id.to_string()));
            }

            let chunks_before = state.chunks.len();
            state.chunks.retain(|chunk| chunk.document_id != id);
            Ok(chunks_before - state.chunks.len())
        })
    }

    /// Category names with their document counts.
    pub fn categories(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for document in &self.read().documents {
            *counts.entry(document.category.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn rename_category(&self, from: &str, to: &str) -> Result<usize, StoreError> {
        let to = normalize_category(Some(to));
        self.transaction(Scope::Knowledge, |state| {
            let mut renamed = 0;
            for document in state.documents.iter_mut().filter(|document| document.category == from) {
                document.category = to.clone();
                renamed += 1;
            }
            Ok(renamed)
        })
    }

    /// Deletes every document in `category` and their chunks. Returns
    /// `(documents, chunks)` removed.
    pub fn delete_category(&self, category: &str) -> Result<(usize, usize), StoreError> {
        self.transaction(Scope::Knowledge, |state| {
            let doomed = state
                .documents
                .iter()
                .filter(|document| document.category == category)
                .map(|document| document.id.clone())
                .collect::<HashSet<_>>();

            state.documents.retain(|document| !doomed.contains(&document.id));
            let chunks_before = state.chunks.len();
            state.chunks.retain(|chunk| !doomed.contains(&chunk.document_id));
            Ok((doomed.len(), chunks_before - state.chunks.len()))
        })
    }

    pub fn document_ids_for_categories(&self, categories: &[String]) -> Vec<String> {
        self.read()
            .documents
            .iter()
            .filter(|document| categories.contains(&document.category))
            .map(|document| document.id.clone())
            .collect()
    }

    /// All chunks, or only those owned by `document_ids` when given.
    pub fn chunks(&self, document_ids: Option<&[String]>) -> Vec<Chunk> {
        let state = self.read();
        match document_ids {
            Some(ids) => {
                let wanted = ids.iter().collect::<HashSet<_>>();
                state
                    .chunks
                    .iter()
                    .filter(|chunk| wanted.contains(&chunk.document_id))
                    .cloned()
                    .collect()
            }
            None => state.chunks.clone(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.read().chunks.len()
    }

    /// Ranked cosine-similarity retrieval, optionally limited to documents.
    pub fn search(
        &self,
        query: &[f32],
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Vec<ScoredChunk> {
        rank_chunks(self.chunks(document_ids), query, limit)
    }

    pub fn append_message(&self, message: ChatMessage) -> Result<(), StoreError> {
        self.transaction(Scope::Session, |state| {
            state.chat_history.push(message);
            Ok(())
        })
    }

    /// Chat history in timestamp order.
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut history = self.read().chat_history.clone();
        history.sort_by_key(|message| message.timestamp);
        history
    }

    pub fn recent_history(&self, limit: usize) -> Vec<ChatMessage> {
        let history = self.history();
        let skip = history.len().saturating_sub(limit);
        history.into_iter().skip(skip).collect()
    }

    pub fn clear_history(&self) -> Result<usize, StoreError> {
        self.transaction(Scope::Session, |state| {
            let removed = state.chat_history.len();
            state.chat_history.clear();
            Ok(removed)
        })
    }

    pub fn setting(&self, key: &str) -> Option<serde_json::Value> {
        self.read().settings.get(key).cloned()
    }

    pub fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.transaction(Scope::Session, |state| {
            state.settings.insert(key.to_string(), value);
            Ok(())
        })
    }

    pub fn settings(&self) -> Vec<Setting> {
        self.read()
            .settings
            .iter()
            .map(|(key, value)| Setting {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.read();
        StoreStats {
            documents: state.documents.len(),
            chunks: state.chunks.len(),
            messages: state.chat_history.len(),
            settings: state.settings.len(),
        }
    }

    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.transaction(Scope::All, |state| {
            *state = Snapshot::empty();
            Ok(())
        })
    }
}

pub(crate) fn normalize_category(category: Option<&str>) -> String {
    match category.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => DEFAULT_CATEGORY.to_string(),
    }
}

/// Upgrades a snapshot in place; returns how many documents were backfilled.
fn migrate(state: &mut Snapshot) -> usize {
    let mut backfilled = 0;
    for document in state.documents.iter_mut() {
        if document.category.trim().is_empty() {
            document.category = DEFAULT_CATEGORY.to_string();
            backfilled += 1;
        }
    }
    state.version = SCHEMA_VERSION;
    backfilled
}
