//! PathRAG: flow-pruned path reasoning over the graph.
//!
//! Seeds come from a lexical match on entity names/aliases; paths between
//! seed pairs are filtered by a minimum confidence θ and scored
//! `α^(L-1) · mean(conf)`, so longer or shakier chains rank lower. The
//! prompt lists paths from least to most reliable, which keeps the strongest
//! evidence out of the middle of the context.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use crate::config::QueryBudgets;
use crate::domain::answer::{AnswerBundle, Citation, QueryMode, TokenUsage};
use crate::domain::graph::EntityRow;
use crate::error::Result;
use crate::graph::projection::{GraphProjection, PathRecord};
use crate::prompts;
use crate::provider::ChatProvider;
use crate::store::GraphStore;
use crate::tokens::TokenBudgeter;

/// Keyword tokens: letters (accented included), digits, hyphens.
static KEYWORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-zÀ-ÿ0-9-]+").expect("static regex"));

/// Keywords considered per query.
const MAX_KEYWORDS: usize = 8;
/// Seed ids paired up for path search.
const MAX_PAIR_IDS: usize = 30;
/// Paths collected per pair.
const PATHS_PER_PAIR: usize = 6;
/// Total paths collected before scoring.
const MAX_TOTAL_PATHS: usize = 500;
/// Candidate entities fetched before scoring.
const CANDIDATE_FETCH: usize = 400;

/// Per-call path parameters.
#[derive(Debug, Clone, Copy)]
pub struct PathParams {
    /// Paths kept after scoring.
    pub k: usize,
    /// Seed nodes kept.
    pub n: usize,
    /// Length decay, in `(0, 1]`.
    pub alpha: f64,
    /// Minimum node/edge confidence.
    pub theta: f32,
    /// Maximum edges per path.
    pub max_hops: usize,
}

/// A scored path ready for prompting/citation.
#[derive(Debug, Clone)]
struct ScoredPath {
    record: PathRecord,
    score: f64,
}

/// Path-based retrieval engine.
pub struct PathRagEngine {
    chat: Arc<dyn ChatProvider>,
    budgeter: TokenBudgeter,
    budgets: QueryBudgets,
}

impl std::fmt::Debug for PathRagEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathRagEngine").finish()
    }
}

/// Extract keyword tokens from a query: length >= 3, capped, lowercased.
#[must_use]
pub fn keywords(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut out: Vec<String> = KEYWORD_RE
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .filter(|t| t.chars().count() >= 3)
        .take(MAX_KEYWORDS)
        .collect();
    if out.is_empty() {
        out.push(lowered.trim().to_string());
    }
    out
}

/// `α^(L-1) · mean(conf over nodes and edges)`.
#[must_use]
pub fn path_score(record: &PathRecord, alpha: f64) -> f64 {
    let length = record.len().max(1);
    let values: Vec<f32> = record
        .node_confs
        .iter()
        .chain(record.edge_confs.iter())
        .copied()
        .collect();
    let mean = if values.is_empty() {
        0.5
    } else {
        f64::from(values.iter().sum::<f32>()) / values.len() as f64
    };
    alpha.powi(length as i32 - 1) * mean
}

impl PathRagEngine {
    #[must_use]
    pub fn new(chat: Arc<dyn ChatProvider>, budgeter: TokenBudgeter, budgets: QueryBudgets) -> Self {
        Self {
            chat,
            budgeter,
            budgets,
        }
    }

    /// Answer through path reasoning; `None` when no path survives pruning
    /// (the caller decides whether to fall back to vector retrieval).
    pub async fn run(
        &self,
        store: &dyn GraphStore,
        series: &str,
        question: &str,
        params: PathParams,
    ) -> Result<Option<AnswerBundle>> {
        let kws = keywords(question);
        let candidates = store
            .entities_by_keywords(series, &kws, CANDIDATE_FETCH)
            .await?;
        let seeds = top_nodes(candidates, &kws, params.n);
        if seeds.len() < 2 {
            debug!(series, seeds = seeds.len(), "not enough seed nodes for paths");
            return Ok(None);
        }

        let (entities, relations) = store.load_graph(series).await?;
        let projection = GraphProjection::build(&entities, &relations);

        // Unordered pairs over the capped seed list.
        let ids: Vec<&str> = seeds
            .iter()
            .map(|e| e.id.as_str())
            .take(MAX_PAIR_IDS)
            .collect();
        let mut collected: Vec<ScoredPath> = Vec::new();
        'pairs: for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                for record in
                    projection.paths_between(ids[i], ids[j], params.max_hops, params.theta, PATHS_PER_PAIR)
                {
                    let score = path_score(&record, params.alpha);
                    collected.push(ScoredPath { record, score });
                    if collected.len() >= MAX_TOTAL_PATHS {
                        break 'pairs;
                    }
                }
            }
        }
        if collected.is_empty() {
            debug!(series, "flow pruning kept no paths");
            return Ok(None);
        }

        collected.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.record.node_ids.cmp(&b.record.node_ids))
        });
        collected.truncate(params.k);

        // Prompt lists paths ascending by score: least reliable first.
        let mut ascending: Vec<&ScoredPath> = collected.iter().collect();
        ascending.reverse();
        let paths_block = self.render_paths_block(&ascending);
        let prompt = prompts::render(
            prompts::PATH_ANSWER,
            &[("query", question), ("paths_block", &paths_block)],
        );

        let prompt_tokens = self.budgeter.count_tokens(&prompt);
        let raw = self.chat.ask(&prompt).await?;
        let answer = raw.trim().to_string();
        let completion_tokens = self.budgeter.count_tokens(&answer);

        let citations: Vec<Citation> = collected
            .iter()
            .map(|p| Citation::Path {
                path_score: p.score as f32,
                node_ids: p.record.node_ids.clone(),
                edge_ids: p.record.edge_ids.clone(),
            })
            .collect();

        let debug_paths: Vec<serde_json::Value> = collected
            .iter()
            .map(|p| {
                json!({
                    "score": p.score,
                    "nodes": p.record.node_names,
                    "preds": p.record.preds,
                })
            })
            .collect();

        debug!(series, paths = collected.len(), "pathrag answered");
        Ok(Some(AnswerBundle {
            series: series.to_string(),
            mode_used: QueryMode::Path,
            question: question.to_string(),
            answer,
            citations,
            latency_ms: 0,
            token_usage: TokenUsage::new(prompt_tokens, completion_tokens),
            debug: json!({ "paths": debug_paths }),
            warnings: Vec::new(),
        }))
    }

    /// `(i) <u> --[pred]--> <v> ; ...` lines, one per path, names trimmed to
    /// a per-path share of the budget.
    fn render_paths_block(&self, ascending: &[&ScoredPath]) -> String {
        let share = self.budgets.paths_tokens / ascending.len().max(1);
        let name_budget = (share / 8).max(1);

        ascending
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let record = &path.record;
                let steps = (0..record.len())
                    .map(|e| {
                        let u = self.budgeter.fit(&record.node_names[e], name_budget);
                        let v = self.budgeter.fit(&record.node_names[e + 1], name_budget);
                        format!("<{u}> --[{}]--> <{v}>", record.preds[e])
                    })
                    .collect::<Vec<_>>()
                    .join(" ; ");
                format!("({}) {steps}", i + 1)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Score candidates by keyword occurrences (name or description) plus conf,
/// keep the best `n`.
fn top_nodes(candidates: Vec<EntityRow>, kws: &[String], n: usize) -> Vec<EntityRow> {
    let mut scored: Vec<(f64, EntityRow)> = candidates
        .into_iter()
        .map(|e| {
            let name = e.name.to_lowercase();
            let desc = e.desc.to_lowercase();
            let occurrences = kws
                .iter()
                .filter(|kw| name.contains(kw.as_str()) || desc.contains(kw.as_str()))
                .count();
            (occurrences as f64 + f64::from(e.conf), e)
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
    scored.into_iter().take(n).map(|(_, e)| e).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::RelationRow;
    use crate::provider::mock::MockChat;
    use crate::store::providers::MemoryGraphStore;
    use crate::tokens::ModelFamily;

    fn entity(id: &str, name: &str, conf: f32) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            series: "s1".to_string(),
            name: name.to_string(),
            entity_type: "Org".to_string(),
            aliases: Vec::new(),
            desc: String::new(),
            cids: Vec::new(),
            conf,
            evec: None,
        }
    }

    fn relation(id: &str, src: &str, dst: &str, pred: &str, conf: f32) -> RelationRow {
        RelationRow {
            id: id.to_string(),
            series: "s1".to_string(),
            src_id: src.to_string(),
            dst_id: dst.to_string(),
            pred: pred.to_string(),
            cids: Vec::new(),
            conf,
        }
    }

    fn params() -> PathParams {
        PathParams {
            k: 12,
            n: 30,
            alpha: 0.8,
            theta: 0.05,
            max_hops: 3,
        }
    }

    async fn acme_store() -> MemoryGraphStore {
        let store = MemoryGraphStore::new();
        store
            .upsert_entities(
                "s1",
                &[
                    entity("e-acme", "Acme", 0.8),
                    entity("e-beta", "Beta", 0.8),
                    entity("e-fr", "France", 0.8),
                ],
            )
            .await
            .unwrap();
        store
            .upsert_relations(
                "s1",
                &[
                    relation("r1", "e-acme", "e-beta", "ACQUIRED", 0.8),
                    relation("r2", "e-beta", "e-fr", "LOCATED_IN", 0.8),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_keywords_extraction() {
        let kws = keywords("Qui a acquis Beta en 2021 ?");
        assert!(kws.contains(&"qui".to_string()));
        assert!(kws.contains(&"acquis".to_string()));
        assert!(kws.contains(&"beta".to_string()));
        assert!(kws.contains(&"2021".to_string()));
        // "a" and "en" are too short.
        assert!(!kws.contains(&"en".to_string()));
        assert!(kws.len() <= MAX_KEYWORDS);
    }

    #[test]
    fn test_keywords_empty_query_degrades() {
        assert_eq!(keywords("a b"), vec!["a b".to_string()]);
    }

    #[test]
    fn test_path_score_two_hop() {
        // 2-hop path, all confs 0.8, alpha 0.8: 0.8^1 * 0.8 = 0.64.
        let record = PathRecord {
            node_ids: vec!["a".into(), "b".into(), "c".into()],
            node_names: vec!["A".into(), "B".into(), "C".into()],
            node_confs: vec![0.8, 0.8, 0.8],
            edge_ids: vec!["e1".into(), "e2".into()],
            preds: vec!["ACQUIRED".into(), "LOCATED_IN".into()],
            edge_confs: vec![0.8, 0.8],
        };
        let score = path_score(&record, 0.8);
        assert!((score - 0.64).abs() < 1e-9);
    }

    #[test]
    fn test_shorter_path_outranks_same_conf() {
        let two_hop = PathRecord {
            node_ids: vec!["a".into(), "b".into(), "c".into()],
            node_names: vec![String::new(); 3],
            node_confs: vec![0.8; 3],
            edge_ids: vec!["e1".into(), "e2".into()],
            preds: vec![String::new(); 2],
            edge_confs: vec![0.8; 2],
        };
        let three_hop = PathRecord {
            node_ids: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            node_names: vec![String::new(); 4],
            node_confs: vec![0.8; 4],
            edge_ids: vec!["e1".into(), "e2".into(), "e3".into()],
            preds: vec![String::new(); 3],
            edge_confs: vec![0.8; 3],
        };
        assert!(path_score(&two_hop, 0.8) > path_score(&three_hop, 0.8));
    }

    #[tokio::test]
    async fn test_run_builds_path_citations() {
        let store = acme_store().await;
        let engine = PathRagEngine::new(
            Arc::new(MockChat::new().fallback("Acme acquired Beta.")),
            TokenBudgeter::new(ModelFamily::GptLike),
            QueryBudgets::default(),
        );

        let bundle = engine
            .run(&store, "s1", "qui a acquis beta france", params())
            .await
            .unwrap()
            .expect("paths found");
        assert_eq!(bundle.mode_used, QueryMode::Path);
        assert!(!bundle.citations.is_empty());
        match &bundle.citations[0] {
            Citation::Path { path_score, node_ids, edge_ids } => {
                assert!(*path_score > 0.0);
                assert!(!node_ids.is_empty());
                assert!(!edge_ids.is_empty());
            }
            other => panic!("expected path citation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_theta_one_returns_no_paths() {
        let store = acme_store().await;
        let engine = PathRagEngine::new(
            Arc::new(MockChat::new().fallback("unused")),
            TokenBudgeter::new(ModelFamily::GptLike),
            QueryBudgets::default(),
        );
        let out = engine
            .run(
                &store,
                "s1",
                "qui a acquis beta france",
                PathParams { theta: 1.0, ..params() },
            )
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_prompt_orders_paths_ascending() {
        let store = acme_store().await;
        let chat = MockChat::new().fallback("answer");
        let engine = PathRagEngine::new(
            Arc::new(chat),
            TokenBudgeter::new(ModelFamily::GptLike),
            QueryBudgets::default(),
        );
        let bundle = engine
            .run(&store, "s1", "acme beta france", params())
            .await
            .unwrap()
            .expect("paths found");

        // Citations are ranked best-first; the direct ACQUIRED edge must
        // outrank the 2-hop chain.
        match &bundle.citations[0] {
            Citation::Path { node_ids, .. } => assert_eq!(node_ids.len(), 2),
            other => panic!("unexpected citation {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_seed_returns_none() {
        let store = MemoryGraphStore::new();
        store
            .upsert_entities("s1", &[entity("e-acme", "Acme", 0.9)])
            .await
            .unwrap();
        let engine = PathRagEngine::new(
            Arc::new(MockChat::new().fallback("unused")),
            TokenBudgeter::new(ModelFamily::GptLike),
            QueryBudgets::default(),
        );
        let out = engine.run(&store, "s1", "acme", params()).await.unwrap();
        assert!(out.is_none());
    }
}
