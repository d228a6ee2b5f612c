//! Canonicalization: chunks to entity/relation drafts.
//!
//! One LLM call per chunk extracts `(entity, relation)` tuples; identities
//! are normalized into deterministic ids and evidence is aggregated across
//! chunks with union/max merge rules. This component never writes to the
//! store; it returns accumulators ready for upsert.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::concurrency;
use crate::domain::chunk::ChunkRecord;
use crate::domain::graph::{EntityRow, RelationRow};
use crate::error::Result;
use crate::ids::{node_id, relation_id};
use crate::prompts;
use crate::provider::{ChatProvider, json};
use crate::store::GraphStore;
use crate::tokens::TokenBudgeter;

/// Type used for relation endpoints whose entity type is unknown.
const FALLBACK_TYPE: &str = "concept";

/// Canonicalizer settings.
#[derive(Debug, Clone)]
pub struct CanonicalizerConfig {
    /// Minimum extraction confidence.
    pub min_conf: f32,
    /// Token budget for the chunk text in the prompt.
    pub max_ctx_tokens: usize,
    /// Bounded fan-out width over chunks.
    pub parallelism: usize,
}

impl Default for CanonicalizerConfig {
    fn default() -> Self {
        Self {
            min_conf: 0.35,
            max_ctx_tokens: 1200,
            parallelism: 8,
        }
    }
}

/// Result of a canonicalization pass.
#[derive(Debug, Default)]
pub struct CanonicalizeOutcome {
    /// Entity drafts, ordered by id.
    pub nodes: Vec<EntityRow>,
    /// Relation drafts, ordered by id.
    pub edges: Vec<RelationRow>,
    /// Per-chunk problems (provider failures, unparseable output).
    pub warnings: Vec<String>,
}

/// LLM-driven extraction of canonical entities and relations.
pub struct Canonicalizer {
    chat: Arc<dyn ChatProvider>,
    budgeter: TokenBudgeter,
    config: CanonicalizerConfig,
}

impl std::fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("config", &self.config)
            .finish()
    }
}

/// Extraction from one chunk, before cross-chunk aggregation.
#[derive(Debug)]
struct ChunkExtraction {
    chunk_id: String,
    nodes: Vec<EntityRow>,
    edges: Vec<RelationRow>,
}

impl Canonicalizer {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        budgeter: TokenBudgeter,
        config: CanonicalizerConfig,
    ) -> Self {
        Self {
            chat,
            budgeter,
            config,
        }
    }

    /// Canonicalize every chunk of the series.
    pub async fn run(&self, store: &dyn GraphStore, series: &str) -> Result<CanonicalizeOutcome> {
        let mut warnings = Vec::new();

        // Drain the lazy chunk stream first into ids+texts the tasks own;
        // per-chunk extraction then fans out bounded.
        let mut chunks = Vec::new();
        {
            let mut stream = store.stream_chunks(series);
            while let Some(next) = stream.next().await {
                match next {
                    Ok(chunk) => {
                        if chunk.text.trim().is_empty() {
                            debug!(chunk_id = %chunk.id, "skipping empty chunk");
                            continue;
                        }
                        chunks.push(chunk);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let mut extractions: Vec<ChunkExtraction> = Vec::new();
        let results = concurrency::map_bounded(chunks, self.config.parallelism, |chunk| {
            self.extract_chunk(series, chunk)
        })
        .await;
        for result in results {
            match result {
                Ok(extraction) => extractions.push(extraction),
                Err((chunk_id, err)) => {
                    warn!(chunk_id = %chunk_id, error = %err, "chunk extraction skipped");
                    warnings.push(format!("canonicalize: chunk '{chunk_id}' skipped: {err}"));
                }
            }
        }
        // Completion order is arbitrary; merge in chunk-id order so "latest
        // wins" fields are reproducible.
        extractions.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));

        let mut nodes: HashMap<String, EntityRow> = HashMap::new();
        let mut edges: HashMap<String, RelationRow> = HashMap::new();
        for extraction in extractions {
            for node in extraction.nodes {
                match nodes.get_mut(&node.id) {
                    Some(existing) => existing.merge(&node),
                    None => {
                        nodes.insert(node.id.clone(), node);
                    }
                }
            }
            for edge in extraction.edges {
                match edges.get_mut(&edge.id) {
                    Some(existing) => existing.merge(&edge),
                    None => {
                        edges.insert(edge.id.clone(), edge);
                    }
                }
            }
        }

        let mut nodes: Vec<EntityRow> = nodes.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<RelationRow> = edges.into_values().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(
            series,
            nodes = nodes.len(),
            edges = edges.len(),
            "canonicalization complete"
        );
        Ok(CanonicalizeOutcome {
            nodes,
            edges,
            warnings,
        })
    }

    /// Extract from one chunk; failures carry the chunk id for the warning.
    async fn extract_chunk(
        &self,
        series: &str,
        chunk: ChunkRecord,
    ) -> std::result::Result<ChunkExtraction, (String, crate::error::GraphRagError)> {
        let fitted = self.budgeter.fit(&chunk.text, self.config.max_ctx_tokens);
        let prompt = prompts::render(
            prompts::KG_CANONICALIZE,
            &[
                ("series", series),
                ("cid", &chunk.id),
                ("chunk_text", &fitted),
            ],
        );

        let raw = self
            .chat
            .ask(&prompt)
            .await
            .map_err(|e| (chunk.id.clone(), e))?;

        Ok(self.parse_extraction(series, &chunk.id, &raw))
    }

    /// Parse one chunk's LLM output into drafts. Non-JSON output yields an
    /// empty extraction; within-call duplicates collapse before emission.
    fn parse_extraction(&self, series: &str, chunk_id: &str, raw: &str) -> ChunkExtraction {
        let data = json::parse_lenient(raw).unwrap_or_else(|| {
            serde_json::json!({ "entities": [], "relations": [] })
        });

        let mut nodes: Vec<EntityRow> = Vec::new();
        let mut type_by_name: HashMap<String, String> = HashMap::new();

        for entity in data.get("entities").and_then(|v| v.as_array()).unwrap_or(&Vec::new()) {
            let conf = json::conf_field(entity, "conf", 0.0) as f32;
            let name = json::str_field(entity, &["name"]).unwrap_or_default().trim();
            let entity_type = json::str_field(entity, &["type"]).unwrap_or_default().trim();
            if conf < self.config.min_conf || name.is_empty() || entity_type.is_empty() {
                continue;
            }

            let id = node_id(series, name, entity_type);
            type_by_name.insert(name.to_lowercase(), entity_type.to_string());

            let draft = EntityRow {
                id: id.clone(),
                series: series.to_string(),
                name: name.to_string(),
                entity_type: entity_type.to_string(),
                aliases: json::str_array(entity, "aliases"),
                desc: json::str_field(entity, &["desc"]).unwrap_or_default().to_string(),
                cids: vec![chunk_id.to_string()],
                conf,
                evec: None,
            };
            match nodes.iter_mut().find(|n| n.id == id) {
                Some(existing) => existing.merge(&draft),
                None => nodes.push(draft),
            }
        }

        let mut edges: Vec<RelationRow> = Vec::new();
        for relation in data.get("relations").and_then(|v| v.as_array()).unwrap_or(&Vec::new()) {
            let conf = json::conf_field(relation, "conf", 0.0) as f32;
            let src = json::str_field(relation, &["src", "source"]).unwrap_or_default().trim();
            let dst = json::str_field(relation, &["dst", "target"]).unwrap_or_default().trim();
            let pred = json::str_field(relation, &["pred", "type"]).unwrap_or_default().trim();
            if conf < self.config.min_conf || src.is_empty() || dst.is_empty() || pred.is_empty() {
                continue;
            }

            let src_type = type_by_name
                .get(&src.to_lowercase())
                .map_or(FALLBACK_TYPE, String::as_str);
            let dst_type = type_by_name
                .get(&dst.to_lowercase())
                .map_or(FALLBACK_TYPE, String::as_str);
            let src_id = node_id(series, src, src_type);
            let dst_id = node_id(series, dst, dst_type);
            let id = relation_id(series, &src_id, pred, &dst_id);

            let draft = RelationRow {
                id: id.clone(),
                series: series.to_string(),
                src_id,
                dst_id,
                pred: pred.to_string(),
                cids: vec![chunk_id.to_string()],
                conf,
            };
            match edges.iter_mut().find(|e| e.id == id) {
                Some(existing) => existing.merge(&draft),
                None => edges.push(draft),
            }
        }

        ChunkExtraction {
            chunk_id: chunk_id.to_string(),
            nodes,
            edges,
        }
    }
}
