use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// An ingested PDF. Owns its chunks; deleting it deletes them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    /// Empty only in snapshots written before categories existed; the store
    /// migration backfills it.
    #[serde(default)]
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub embedding_dimension: usize,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub file_name: String,
    #[serde(default)]
    pub ocr_applied: bool,
    #[serde(default)]
    pub chunk_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    #[serde(rename = "docId")]
    pub document_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

/// Chunk text plus its vector, before the store assigns identities.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Setting {
    pub key: String,
    pub value: serde_json::Value,
}

/// A rasterized page held only for the duration of one vision session.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub page_number: u32,
    /// Base64-encoded raster bytes.
    pub data: String,
    pub mime_type: String,
    pub quality: f32,
    pub scale: f32,
}

impl PageImage {
    /// Size of the base64 payload, which is what providers meter.
    pub fn payload_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

pub fn megabytes(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub messages: usize,
    pub settings: usize,
}
