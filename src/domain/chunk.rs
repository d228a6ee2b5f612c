//! Source-text chunks.
//!
//! Chunks are produced by an upstream segmentation component and are
//! read-only for this crate, except that the CLI can seed pre-chunked
//! records for local use.

use serde::{Deserialize, Serialize};

/// A unit of source text, already segmented upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Unique chunk id.
    pub id: String,
    /// Corpus scope key; may be filled in after parsing when records arrive
    /// from a per-series file.
    #[serde(default)]
    pub series: String,
    /// Originating document, when known.
    #[serde(default)]
    pub doc_id: Option<String>,
    /// Page within the document, when known.
    #[serde(default)]
    pub page: Option<u32>,
    /// Position of the chunk within the document.
    #[serde(default)]
    pub order: Option<u32>,
    /// Chunk text.
    pub text: String,
    /// Embedding of `text`, written by the upstream embedder when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A retrieved chunk with its similarity score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHit {
    pub chunk: ChunkRecord,
    pub score: f32,
}
