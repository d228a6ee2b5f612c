//! Graph persistence.
//!
//! `GraphStore` is the only component that writes to storage; every other
//! component hands rows to it. Upserts use merge semantics and are
//! idempotent: replaying the same rows leaves the store observably
//! unchanged. Two providers implement the trait: Postgres (+pgvector) for
//! deployments, and an in-process store for tests and local runs.

pub mod providers;

use futures::stream::BoxStream;

use crate::domain::chunk::{ChunkHit, ChunkRecord};
use crate::domain::graph::{
    CommunityRow, EntityRow, MembershipRow, ParentEdgeRow, RelationRow, SummaryRow,
};
use crate::error::Result;

/// Maximum rows per upsert batch.
pub const UPSERT_BATCH: usize = 2000;

// =============================================================================
// Auxiliary types
// =============================================================================

/// Which logical vector index a call refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Chunk,
    Entity,
    Community,
}

/// Outcome of a relation upsert; missing endpoints skip rows, never fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationUpsertStats {
    pub written: u64,
    pub skipped_missing_endpoint: u64,
}

/// Outcome of replacing the memberships of one `(series, level)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelStats {
    pub level: u32,
    pub communities: u64,
    pub memberships: u64,
}

/// Stable index name for `(kind, series)`.
///
/// The series is sanitized to `[A-Za-z0-9_]` and prefixed when it does not
/// start with a letter.
#[must_use]
pub fn index_name(kind: IndexKind, series: &str) -> String {
    let mut sanitized: String = series
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !sanitized.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        sanitized = format!("s_{sanitized}");
    }
    match kind {
        IndexKind::Chunk => format!("chunkIndex_{sanitized}"),
        IndexKind::Entity => format!("nodeIndex_{sanitized}"),
        IndexKind::Community => format!("commIndex_{sanitized}"),
    }
}

// =============================================================================
// GraphStore
// =============================================================================

/// Persistence contract of the core.
///
/// Every query is scoped by `series`; implementations must never join across
/// series. All write operations use merge semantics (see the domain row
/// types for the exact rules) and batches are capped at [`UPSERT_BATCH`].
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync + std::fmt::Debug {
    /// Install unique-id constraints. Safe to call repeatedly; install
    /// errors on older engines are logged and ignored.
    async fn ensure_constraints(&self) -> Result<()>;

    // =========================================================================
    // Chunks
    // =========================================================================

    /// Seed pre-chunked records (id-keyed upsert).
    async fn upsert_chunks(&self, rows: &[ChunkRecord]) -> Result<u64>;

    /// Lazy, restartable pass over the series' chunks, ordered by id.
    fn stream_chunks(&self, series: &str) -> BoxStream<'_, Result<ChunkRecord>>;

    /// Number of chunks in the series.
    async fn count_chunks(&self, series: &str) -> Result<u64>;

    // =========================================================================
    // Entities and relations
    // =========================================================================

    /// Upsert entity rows. Returns the number of rows processed.
    async fn upsert_entities(&self, series: &str, rows: &[EntityRow]) -> Result<u64>;

    /// Upsert relation rows. Rows whose endpoints are missing in the series
    /// are skipped per-row and counted, never fatal.
    async fn upsert_relations(&self, series: &str, rows: &[RelationRow])
    -> Result<RelationUpsertStats>;

    /// Derive `MENTIONED_IN` links from each entity's `cids`.
    async fn link_mentions(&self, series: &str, rows: &[EntityRow]) -> Result<u64>;

    /// Load the full per-series subgraph, both lists ordered by id.
    async fn load_graph(&self, series: &str) -> Result<(Vec<EntityRow>, Vec<RelationRow>)>;

    // =========================================================================
    // Communities
    // =========================================================================

    /// Replace all memberships (and community rows) of `(series, level)`.
    async fn replace_memberships(
        &self,
        series: &str,
        level: u32,
        rows: &[MembershipRow],
    ) -> Result<LevelStats>;

    /// Memberships of one level, ordered by entity id.
    async fn memberships(&self, series: &str, level: u32) -> Result<Vec<MembershipRow>>;

    /// Communities of the series, optionally filtered by level.
    async fn communities(&self, series: &str, levels: Option<&[u32]>) -> Result<Vec<CommunityRow>>;

    /// Replace the parent edges between levels `from` and `to = from + 1`.
    async fn replace_parent_edges(
        &self,
        series: &str,
        from: u32,
        to: u32,
        rows: &[ParentEdgeRow],
    ) -> Result<u64>;

    /// All parent edges of the series.
    async fn parent_edges(&self, series: &str) -> Result<Vec<ParentEdgeRow>>;

    /// Persist a summary text on a community node.
    async fn set_community_summary(
        &self,
        series: &str,
        level: u32,
        cid: &str,
        summary: &str,
    ) -> Result<()>;

    // =========================================================================
    // Summary artifacts
    // =========================================================================

    /// Replace the summary artifacts of `(series, level)`.
    async fn replace_summaries(&self, series: &str, level: u32, rows: &[SummaryRow])
    -> Result<u64>;

    /// Summary artifacts, optionally filtered by level, ordered by id.
    async fn summaries(&self, series: &str, levels: Option<&[u32]>) -> Result<Vec<SummaryRow>>;

    // =========================================================================
    // Vector indexes
    // =========================================================================

    /// Register the index for `(kind, series)`, fixing its dimension at
    /// first call. Returns the effective dimension (an already-registered
    /// index keeps its original dimension).
    async fn register_index(&self, kind: IndexKind, series: &str, dim: usize) -> Result<usize>;

    /// Write entity embeddings (`evec`), overwrite-by-id.
    async fn write_entity_vectors(&self, series: &str, rows: &[(String, Vec<f32>)])
    -> Result<u64>;

    /// Write summary embeddings (`vec`), overwrite-by-id.
    async fn write_summary_vectors(
        &self,
        series: &str,
        rows: &[(String, Vec<f32>)],
    ) -> Result<u64>;

    // =========================================================================
    // Retrieval
    // =========================================================================

    /// Entities whose name or aliases contain any keyword, case-insensitive.
    async fn entities_by_keywords(
        &self,
        series: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<EntityRow>>;

    /// Top-k chunks by cosine similarity to `query_vec`.
    async fn chunks_by_vector(
        &self,
        series: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkHit>>;

    /// Top-k chunks by keyword overlap; the fallback when embeddings are
    /// unavailable.
    async fn chunks_by_fulltext(&self, series: &str, query: &str, k: usize)
    -> Result<Vec<ChunkHit>>;
}

/// Keyword-overlap score shared by the fulltext fallbacks:
/// `|tokens(q) ∩ tokens(text)| / |tokens(q)|` over tokens longer than 2,
/// split on non-alphanumeric boundaries so punctuation does not block a
/// match.
#[must_use]
pub fn keyword_overlap(text: &str, query: &str) -> f32 {
    fn tokens(s: &str) -> std::collections::HashSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() > 2)
            .map(ToString::to_string)
            .collect()
    }

    let q_tokens = tokens(query);
    if q_tokens.is_empty() {
        return 0.0;
    }
    let t_tokens = tokens(text);
    let inter = q_tokens.intersection(&t_tokens).count();
    inter as f32 / q_tokens.len() as f32
}

/// Cosine similarity; mismatched lengths are compared over the shorter
/// prefix, zero vectors score 0.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let dot: f32 = a[..n].iter().zip(&b[..n]).map(|(x, y)| x * y).sum();
    let na: f32 = a[..n].iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b[..n].iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_sanitizes() {
        assert_eq!(index_name(IndexKind::Entity, "cat-2025.Q1"), "nodeIndex_cat_2025_Q1");
        assert_eq!(index_name(IndexKind::Chunk, "2025"), "chunkIndex_s_2025");
        assert_eq!(index_name(IndexKind::Community, "abc"), "commIndex_abc");
    }

    #[test]
    fn test_keyword_overlap() {
        let score = keyword_overlap("Acme acquired Beta in 2021", "who acquired beta");
        // "who" is kept (3 chars), "acquired" and "beta" match: 2/3.
        assert!((score - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(keyword_overlap("anything", "a b"), 0.0);
    }

    #[test]
    fn test_cosine() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[], &[1.0]), 0.0);
        // Mismatched lengths compare the shared prefix.
        assert!((cosine(&[1.0, 0.0, 5.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }
}
