//! GraphRAG: query-focused summarization over community summaries.
//!
//! Seed candidates come from the summary index (cosine when both vectors
//! exist, keyword overlap otherwise). Each candidate is Mapped independently
//! into a partial answer; a single Reduce call merges the partials and names
//! the ones it used, which become the citations.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::concurrency;
use crate::config::QueryBudgets;
use crate::domain::answer::{AnswerBundle, Citation, QueryMode, TokenUsage};
use crate::error::{GraphRagError, Result};
use crate::prompts;
use crate::provider::{ChatProvider, EmbeddingProvider, json as lenient};
use crate::store::{GraphStore, cosine, keyword_overlap};
use crate::tokens::TokenBudgeter;

/// Cap on the snippet kept per citation.
const SNIPPET_CHARS: usize = 280;
/// Fallback confidence for unparseable Map output.
const FALLBACK_MAP_CONFIDENCE: f64 = 0.4;

/// A community summary considered for QFS.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SeedCandidate {
    pub id: String,
    pub level: u32,
    pub text: String,
    pub score: f32,
}

/// One Map result.
#[derive(Debug, Clone)]
struct Partial {
    id: String,
    level: u32,
    text: String,
    #[allow(dead_code)]
    confidence: f64,
}

/// Community-summary map-reduce engine.
pub struct GraphRagEngine {
    chat: Arc<dyn ChatProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    budgeter: TokenBudgeter,
    budgets: QueryBudgets,
    parallelism: usize,
}

impl std::fmt::Debug for GraphRagEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRagEngine")
            .field("budgets", &self.budgets)
            .finish()
    }
}

impl GraphRagEngine {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        budgeter: TokenBudgeter,
        budgets: QueryBudgets,
        parallelism: usize,
    ) -> Self {
        Self {
            chat,
            embedder,
            budgeter,
            budgets,
            parallelism,
        }
    }

    /// Seed search over the series' summaries.
    ///
    /// Scores cosine(query, summary) when both vectors exist, keyword
    /// overlap otherwise; returns up to `seed_limit` candidates, best first.
    pub async fn seed_search(
        &self,
        store: &dyn GraphStore,
        series: &str,
        query: &str,
        levels: Option<&[u32]>,
    ) -> Result<Vec<SeedCandidate>> {
        let query_vec = match &self.embedder {
            Some(embedder) => match embedder.embed(query).await {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!(error = %err, "query embedding failed, scoring by keywords");
                    None
                }
            },
            None => None,
        };

        let summaries = store.summaries(series, levels).await?;
        let mut candidates: Vec<SeedCandidate> = summaries
            .into_iter()
            .map(|s| {
                let text = self.budgeter.fit(&s.text, self.budgets.seed_summary_tokens);
                let score = match (&query_vec, &s.vec) {
                    (Some(q), Some(v)) => cosine(q, v),
                    _ => keyword_overlap(&text, query),
                };
                SeedCandidate {
                    id: s.id,
                    level: s.level,
                    text,
                    score,
                }
            })
            .collect();

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        candidates.truncate(self.budgets.seed_limit);
        Ok(candidates)
    }

    /// Run QFS map-reduce and assemble the bundle (latency set by caller).
    pub async fn run(
        &self,
        store: &dyn GraphStore,
        series: &str,
        question: &str,
    ) -> Result<AnswerBundle> {
        let seeds = self.seed_search(store, series, question, None).await?;
        if seeds.is_empty() {
            return Ok(AnswerBundle::empty(
                series,
                QueryMode::Graph,
                question,
                vec!["no community summaries for series".to_string()],
            ));
        }

        let mut prompt_tokens = 0usize;
        let mut completion_tokens = 0usize;
        let mut warnings = Vec::new();

        // Map: one call per candidate, unordered, failures skipped.
        let map_results = concurrency::map_bounded(seeds.clone(), self.parallelism, |seed| {
            self.map_one(question, seed)
        })
        .await;

        let mut partials: Vec<Partial> = Vec::new();
        for result in map_results {
            match result {
                Ok((partial, p_tok, c_tok)) => {
                    prompt_tokens += p_tok;
                    completion_tokens += c_tok;
                    partials.push(partial);
                }
                Err((id, err)) => {
                    warn!(candidate = %id, error = %err, "map candidate skipped");
                    warnings.push(format!("qfs_map: candidate '{id}' skipped: {err}"));
                }
            }
        }
        if partials.is_empty() {
            let mut all = vec!["qfs_map: no partial answers produced".to_string()];
            all.extend(warnings);
            return Ok(AnswerBundle::empty(series, QueryMode::Graph, question, all));
        }
        partials.sort_by(|a, b| a.id.cmp(&b.id));

        // Reduce: single call, one retry allowed.
        let reduce_prompt = self.reduce_prompt(question, &partials);
        prompt_tokens += self.budgeter.count_tokens(&reduce_prompt);
        let raw = match self.chat.ask(&reduce_prompt).await {
            Ok(raw) => raw,
            Err(first_err) => {
                warn!(error = %first_err, "reduce failed, retrying once");
                self.chat.ask(&reduce_prompt).await.map_err(|retry_err| {
                    GraphRagError::ProviderUnavailable(format!(
                        "qfs_reduce failed twice: {retry_err}"
                    ))
                })?
            }
        };
        completion_tokens += self.budgeter.count_tokens(&raw);

        let parsed = lenient::parse_lenient(&raw);
        let (answer, used, confidence) = match &parsed {
            Some(v) => (
                lenient::str_field(v, &["answer", "final_answer"])
                    .unwrap_or_default()
                    .to_string(),
                lenient::str_array(v, "used"),
                lenient::conf_field(v, "confidence", 0.6),
            ),
            None => (raw.trim().chars().take(2000).collect(), Vec::new(), 0.5),
        };

        // Citations: leading sentence of each used partial.
        let mut citations = Vec::new();
        for uid in &used {
            if let Some(partial) = partials.iter().find(|p| &p.id == uid) {
                citations.push(Citation::Graph {
                    id: uid.clone(),
                    snippet: first_sentence(&partial.text, SNIPPET_CHARS),
                });
            }
        }

        debug!(
            series,
            seeds = seeds.len(),
            partials = partials.len(),
            used = used.len(),
            "graphrag answered"
        );

        Ok(AnswerBundle {
            series: series.to_string(),
            mode_used: QueryMode::Graph,
            question: question.to_string(),
            answer,
            citations,
            latency_ms: 0,
            token_usage: TokenUsage::new(prompt_tokens, completion_tokens),
            debug: json!({
                "seeds": seeds,
                "confidence": confidence,
            }),
            warnings,
        })
    }

    /// One Map call; returns the partial plus its token cost.
    async fn map_one(
        &self,
        question: &str,
        seed: SeedCandidate,
    ) -> std::result::Result<(Partial, usize, usize), (String, GraphRagError)> {
        let summary = self.budgeter.fit(&seed.text, self.budgets.qfs_map_tokens);
        let prompt = prompts::render(
            prompts::QFS_MAP,
            &[("query", question), ("summary", &summary)],
        );
        let p_tok = self.budgeter.count_tokens(&prompt);

        let raw = self.chat.ask(&prompt).await.map_err(|e| (seed.id.clone(), e))?;
        let c_tok = self.budgeter.count_tokens(&raw);

        let partial = match lenient::parse_lenient(&raw) {
            Some(v) => Partial {
                id: seed.id,
                level: seed.level,
                text: lenient::str_field(&v, &["partial_answer", "answer", "output"])
                    .unwrap_or_default()
                    .to_string(),
                confidence: lenient::conf_field(&v, "confidence", 0.5),
            },
            // Unparseable output degrades to the raw text.
            None => Partial {
                id: seed.id,
                level: seed.level,
                text: raw.trim().chars().take(2000).collect(),
                confidence: FALLBACK_MAP_CONFIDENCE,
            },
        };
        Ok((partial, p_tok, c_tok))
    }

    /// Labeled partials block with a per-item token share.
    fn reduce_prompt(&self, question: &str, partials: &[Partial]) -> String {
        let share = self.budgets.qfs_reduce_tokens / partials.len().max(1);
        let block = partials
            .iter()
            .map(|p| {
                let text = self.budgeter.fit(&p.text, share.max(1));
                format!("[{} @L{}] {}", p.id, p.level, text)
            })
            .collect::<Vec<_>>()
            .join("\n");
        prompts::render(
            prompts::QFS_REDUCE,
            &[("query", question), ("partials_block", &block)],
        )
    }
}

/// First sentence of a text, capped at `max` characters.
fn first_sentence(text: &str, max: usize) -> String {
    let sentence = text.split(". ").next().unwrap_or(text);
    sentence.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::SummaryRow;
    use crate::provider::mock::{MockChat, MockEmbedder};
    use crate::store::providers::MemoryGraphStore;
    use crate::tokens::ModelFamily;

    async fn store_with_summaries() -> MemoryGraphStore {
        let store = MemoryGraphStore::new();
        store
            .replace_summaries(
                "s1",
                0,
                &[SummaryRow {
                    id: "c0_comm17@L0".into(),
                    series: "s1".into(),
                    level: 0,
                    cid: "c0_comm17".into(),
                    text: "Acme acquired Beta. The deal closed in 2021.".into(),
                    tokens: 9,
                    vec: None,
                }],
            )
            .await
            .unwrap();
        store
            .replace_summaries(
                "s1",
                1,
                &[SummaryRow {
                    id: "c1_comm3@L1".into(),
                    series: "s1".into(),
                    level: 1,
                    cid: "c1_comm3".into(),
                    text: "Beta operates in France.".into(),
                    tokens: 4,
                    vec: None,
                }],
            )
            .await
            .unwrap();
        store
    }

    fn engine(chat: MockChat) -> GraphRagEngine {
        GraphRagEngine::new(
            Arc::new(chat),
            Some(Arc::new(MockEmbedder::new(8))),
            TokenBudgeter::new(ModelFamily::GptLike),
            QueryBudgets::default(),
            4,
        )
    }

    #[tokio::test]
    async fn test_seed_search_keyword_scores_without_vectors() {
        let store = store_with_summaries().await;
        let e = engine(MockChat::new().fallback("{}"));
        let seeds = e
            .seed_search(&store, "s1", "who acquired beta", None)
            .await
            .unwrap();
        assert_eq!(seeds.len(), 2);
        // The acquisition summary overlaps more keywords.
        assert_eq!(seeds[0].id, "c0_comm17@L0");
        assert!(seeds[0].score > seeds[1].score);
    }

    #[tokio::test]
    async fn test_reduce_citations_from_used_partials() {
        let store = store_with_summaries().await;
        let chat = MockChat::new()
            .on(
                "Community summary",
                r#"{"partial_answer": "Acme acquired Beta. More detail follows.", "confidence": 0.9, "evidence": []}"#,
            )
            .on(
                "partial answers",
                r#"{"answer": "Acme acquired Beta in 2021.", "used": ["c0_comm17@L0"], "confidence": 0.8}"#,
            );
        let e = engine(chat);

        let bundle = e.run(&store, "s1", "who acquired beta").await.unwrap();
        assert_eq!(bundle.answer, "Acme acquired Beta in 2021.");
        assert_eq!(bundle.citations.len(), 1);
        match &bundle.citations[0] {
            Citation::Graph { id, snippet } => {
                assert_eq!(id, "c0_comm17@L0");
                assert_eq!(snippet, "Acme acquired Beta");
                assert!(snippet.len() <= SNIPPET_CHARS);
            }
            other => panic!("expected graph citation, got {other:?}"),
        }
        assert_eq!(
            bundle.token_usage.total,
            bundle.token_usage.prompt + bundle.token_usage.completion
        );
    }

    #[tokio::test]
    async fn test_map_parse_failure_falls_back_to_raw() {
        let store = store_with_summaries().await;
        let chat = MockChat::new()
            .on("Community summary", "plain text, no json at all")
            .on(
                "partial answers",
                r#"{"answer": "ok", "used": [], "confidence": 0.6}"#,
            );
        let e = engine(chat);

        let bundle = e.run(&store, "s1", "who acquired beta").await.unwrap();
        assert_eq!(bundle.answer, "ok");
        assert!(bundle.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_map_failures_skip_but_reduce_proceeds() {
        let store = store_with_summaries().await;
        // Map fails only for the prompt carrying the France summary.
        let chat = MockChat::new()
            .fail_on("France")
            .on(
                "Community summary",
                r#"{"partial_answer": "Acme acquired Beta.", "confidence": 0.9}"#,
            )
            .on(
                "partial answers",
                r#"{"answer": "done", "used": [], "confidence": 0.5}"#,
            );
        let e = engine(chat);

        let bundle = e.run(&store, "s1", "who acquired beta").await.unwrap();
        assert_eq!(bundle.answer, "done");
        assert_eq!(bundle.warnings.len(), 1);
        assert!(bundle.warnings[0].contains("c1_comm3@L1"));
    }

    #[tokio::test]
    async fn test_no_summaries_yields_empty_bundle() {
        let store = MemoryGraphStore::new();
        let e = engine(MockChat::new().fallback("{}"));
        let bundle = e.run(&store, "s1", "anything").await.unwrap();
        assert!(bundle.answer.is_empty());
        assert!(!bundle.warnings.is_empty());
    }
}
