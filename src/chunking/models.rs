//! Chunk and parent records written by ingestion

use serde::{Deserialize, Serialize};

/// Kind of source document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Note,
    Article,
    Transcript,
    Code,
    Conversation,
    #[default]
    Other,
}

/// Graph fields carried by every chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFields {
    pub parent_id: String,
    /// 0-based position inside the parent
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Hierarchy depth; the parent sits at level 0
    pub level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_chunk_id: Option<String>,
    pub overlap_tokens: usize,
    /// SHA-256 of the overlap text, used to spot stale overlaps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlap_hash: Option<String>,
}

/// Graph fields carried by a chunked parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentFields {
    /// Children in chunk order
    pub child_ids: Vec<String>,
    pub total_tokens: usize,
    pub document_type: DocumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub fields: ChunkFields,
    /// Tail of the previous chunk repeated for continuity
    pub overlap_text: String,
    /// Embedded and searchable portion
    pub body: String,
    /// Tokens of `body`
    pub tokens: usize,
}

impl ChunkRecord {
    /// Text to show the model: overlap followed by the body
    pub fn content(&self) -> String {
        if self.overlap_text.is_empty() {
            self.body.clone()
        } else {
            format!("{} {}", self.overlap_text, self.body)
        }
    }

    /// Text to embed and index; the overlap is left out
    pub fn searchable_text(&self) -> &str {
        &self.body
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub id: String,
    pub fields: ParentFields,
}

impl ParentRecord {
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.fields.summary = Some(summary.into());
        self
    }
}

/// A parent and its chunks in order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedDocument {
    pub parent: ParentRecord,
    pub chunks: Vec<ChunkRecord>,
}
