use crate::error::StoreError;
use crate::models::{ChatMessage, Chunk, Document, Setting};
use crate::store::{normalize_category, KnowledgeStore, Scope, Snapshot, SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeBackup {
    pub version: u32,
    pub export_date: DateTime<Utc>,
    pub data: BackupData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupData {
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub settings: Vec<Setting>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub documents: usize,
    pub chunks: usize,
    pub messages: usize,
    pub settings: usize,
}

pub fn export(store: &KnowledgeStore) -> KnowledgeBackup {
    let snapshot = store.snapshot();
    KnowledgeBackup {
        version: SCHEMA_VERSION,
        export_date: Utc::now(),
        data: BackupData {
            documents: snapshot.documents,
            chunks: snapshot.chunks,
            chat_history: snapshot.chat_history,
            settings: snapshot
                .settings
                .into_iter()
                .map(|(key, value)| Setting { key, value })
                .collect(),
        },
    }
}

pub fn write_backup(backup: &KnowledgeBackup, path: &Path) -> Result<(), StoreError> {
    fs::write(path, serde_json::to_vec_pretty(backup)?)?;
    Ok(())
}

/// Reads a backup file. Structural problems are reported as
/// [`StoreError::InvalidImport`].
pub fn read_backup(path: &Path) -> Result<KnowledgeBackup, StoreError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|error| StoreError::InvalidImport(format!("not a knowledge base backup: {error}")))
}

/// Checks the backup as a whole before anything is written.
pub fn validate(backup: &KnowledgeBackup) -> Result<(), StoreError> {
    if backup.version == 0 || backup.version > SCHEMA_VERSION {
        return Err(StoreError::InvalidImport(format!(
            "unsupported backup version {}",
            backup.version
        )));
    }

    let mut dimensions = HashMap::new();
    for document in &backup.data.documents {
        if document.id.is_empty() {
            return Err(StoreError::InvalidImport("document without id".to_string()));
        }
        if dimensions
            .insert(document.id.as_str(), document.embedding_dimension)
            .is_some()
        {
            return Err(StoreError::InvalidImport(format!(
                "duplicate document id {}",
                document.id
            )));
        }
    }

    let mut seen_chunks = HashSet::new();
    for chunk in &backup.data.chunks {
        let Some(&expected) = dimensions.get(chunk.document_id.as_str()) else {
            return Err(StoreError::InvalidImport(format!(
                "chunk {} references unknown document {}",
                chunk.id, chunk.document_id
            )));
        };
        if chunk.embedding.len() != expected {
            return Err(StoreError::DimensionMismatch {
                document: chunk.document_id.clone(),
                expected,
                actual: chunk.embedding.len(),
            });
        }
        if !seen_chunks.insert(chunk.id.as_str()) {
            return Err(StoreError::InvalidImport(format!("duplicate chunk id {}", chunk.id)));
        }
    }

    Ok(())
}

/// Loads `backup` into `store`, optionally replacing everything first.
pub fn import(
    store: &KnowledgeStore,
    backup: KnowledgeBackup,
    clear_existing: bool,
) -> Result<ImportReport, StoreError> {
    validate(&backup)?;
    let data = backup.data;

    let id_map = data
        .documents
        .iter()
        .map(|document| (document.id.clone(), Uuid::new_v4().to_string()))
        .collect::<HashMap<_, _>>();

    let chunks = data
        .chunks
        .into_iter()
        .filter_map(|chunk| {
            let document_id = id_map.get(&chunk.document_id)?.clone();
            Some(Chunk {
                id: Uuid::new_v4().to_string(),
                document_id,
                ..chunk
            })
        })
        .collect::<Vec<_>>();

    let mut chunk_counts = HashMap::new();
    for chunk in &chunks {
        *chunk_counts.entry(chunk.document_id.as_str()).or_insert(0usize) += 1;
    }

    // A document without chunks is never stored.
    let documents = data
        .documents
        .into_iter()
        .filter_map(|document| {
            let id = id_map.get(&document.id)?.clone();
            let chunk_count = chunk_counts.get(id.as_str()).copied().unwrap_or(0);
            (chunk_count > 0).then(|| Document {
                category: normalize_category(Some(&document.category)),
                chunk_count,
                id,
                ..document
            })
        })
        .collect::<Vec<_>>();

    let report = ImportReport {
        documents: documents.len(),
        chunks: chunks.len(),
        messages: data.chat_history.len(),
        settings: data.settings.len(),
    };

    store.transaction(Scope::All, |state| {
        if clear_existing {
            *state = Snapshot {
                version: SCHEMA_VERSION,
                ..Snapshot::default()
            };
        }
        state.documents.extend(documents);
        state.chunks.extend(chunks);
        state.chat_history.extend(data.chat_history);
        for setting in data.settings {
            state.settings.insert(setting.key, setting.value);
        }
        Ok(())
    })?;

    tracing::info!(
        documents = report.documents,
        chunks = report.chunks,
        messages = report.messages,
        clear_existing,
        "imported backup"
    );
    Ok(report)
}
