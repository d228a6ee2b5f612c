//! Query responses and build reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Retrieval mode
// =============================================================================

/// Retrieval strategy, either requested explicitly or chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Let the router decide.
    Auto,
    /// Community-summary QFS map-reduce.
    Graph,
    /// Path-based reasoning over the graph.
    Path,
    /// Dense retrieval over chunks.
    Vector,
}

impl QueryMode {
    /// Parse a mode string; unknown values are rejected rather than guessed.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "graph" => Some(Self::Graph),
            "path" => Some(Self::Path),
            "vector" => Some(Self::Vector),
            _ => None,
        }
    }
}

// =============================================================================
// Citations
// =============================================================================

/// A citation; the shape depends on the mode that produced the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Citation {
    /// GraphRAG: a used community summary and its leading sentence.
    Graph { id: String, snippet: String },
    /// PathRAG: a scored path with the graph elements it traverses.
    Path {
        path_score: f32,
        node_ids: Vec<String>,
        edge_ids: Vec<String>,
    },
    /// Vector: a retrieved chunk.
    Vector {
        cid: String,
        doc: Option<String>,
        page: Option<u32>,
        score: f32,
    },
}

// =============================================================================
// Token usage
// =============================================================================

/// Approximate token accounting for one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: usize,
    pub completion: usize,
    pub total: usize,
}

impl TokenUsage {
    /// Build a usage record; `total` is always `prompt + completion`.
    #[must_use]
    pub fn new(prompt: usize, completion: usize) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

// =============================================================================
// AnswerBundle
// =============================================================================

/// The structured response of `query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerBundle {
    pub series: String,
    pub mode_used: QueryMode,
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub latency_ms: u64,
    pub token_usage: TokenUsage,
    /// Router rule, seed candidates, paths or chunks, depending on the mode.
    pub debug: serde_json::Value,
    /// Per-item problems encountered while answering (skipped candidates,
    /// fallbacks taken). An empty answer with warnings is preferred over an
    /// error when at least one component succeeded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl AnswerBundle {
    /// An empty, well-formed bundle for a series with nothing to answer from.
    #[must_use]
    pub fn empty(series: &str, mode: QueryMode, question: &str, warnings: Vec<String>) -> Self {
        Self {
            series: series.to_string(),
            mode_used: mode,
            question: question.to_string(),
            answer: String::new(),
            citations: Vec::new(),
            latency_ms: 0,
            token_usage: TokenUsage::default(),
            debug: serde_json::Value::Null,
            warnings,
        }
    }
}

// =============================================================================
// BuildReport
// =============================================================================

/// The structured result of an end-to-end build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    /// Opaque id of this build run; a rebuild gets a fresh one.
    pub build_id: String,
    /// RFC 3339 timestamp of the run.
    pub generated_at: String,
    pub series: String,
    /// Entities written.
    pub nodes: u64,
    /// Relations written.
    pub edges: u64,
    /// Community count per level, keyed `L{level}`.
    pub communities_per_level: BTreeMap<String, u64>,
    /// Summary count per level, keyed `L{level}`.
    pub summaries_per_level: BTreeMap<String, u64>,
    /// Logical index names maintained for the series.
    pub indexes: Vec<String>,
    pub elapsed_s: f64,
    pub warnings: Vec<String>,
}

impl BuildReport {
    #[must_use]
    pub fn empty(series: &str) -> Self {
        Self {
            build_id: uuid::Uuid::new_v4().to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            series: series.to_string(),
            nodes: 0,
            edges: 0,
            communities_per_level: BTreeMap::new(),
            summaries_per_level: BTreeMap::new(),
            indexes: Vec::new(),
            elapsed_s: 0.0,
            warnings: Vec::new(),
        }
    }

    /// Equality modulo `elapsed_s`, `build_id` and `generated_at`, for
    /// idempotence checks.
    #[must_use]
    pub fn same_outcome(&self, other: &Self) -> bool {
        self.series == other.series
            && self.nodes == other.nodes
            && self.edges == other.edges
            && self.communities_per_level == other.communities_per_level
            && self.summaries_per_level == other.summaries_per_level
            && self.indexes == other.indexes
            && self.warnings == other.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(120, 34);
        assert_eq!(usage.total, usage.prompt + usage.completion);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(QueryMode::parse("Graph"), Some(QueryMode::Graph));
        assert_eq!(QueryMode::parse("auto"), Some(QueryMode::Auto));
        assert_eq!(QueryMode::parse("hybrid"), None);
    }

    #[test]
    fn test_citation_shapes_serialize() {
        let graph = Citation::Graph {
            id: "c0_comm17@L0".into(),
            snippet: "Acme acquired Beta.".into(),
        };
        let v = serde_json::to_value(&graph).unwrap();
        assert_eq!(v["id"], "c0_comm17@L0");

        let path = Citation::Path {
            path_score: 0.64,
            node_ids: vec!["n1".into(), "n2".into()],
            edge_ids: vec!["e1".into()],
        };
        let v = serde_json::to_value(&path).unwrap();
        assert!(v["node_ids"].is_array());
    }

    #[test]
    fn test_empty_bundle_is_well_formed() {
        let b = AnswerBundle::empty("s1", QueryMode::Vector, "q", vec!["no chunks".into()]);
        assert!(b.answer.is_empty());
        assert_eq!(b.token_usage.total, 0);
        assert_eq!(b.warnings, vec!["no chunks".to_string()]);
    }
}
