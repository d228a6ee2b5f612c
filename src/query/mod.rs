//! Query dispatch.
//!
//! Resolves the retrieval mode (explicit or routed), runs the matching
//! engine, and finalizes the bundle (latency, router debug info). The
//! PathRAG zero-paths case optionally falls back to the vector engine.

pub mod graphrag;
pub mod pathrag;
pub mod router;
pub mod vector;

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::info;

use crate::config::{QueryBudgets, QueryConfig};
use crate::domain::answer::{AnswerBundle, QueryMode};
use crate::domain::chunk::ChunkHit;
use crate::error::{GraphRagError, Result};
use crate::provider::{ChatProvider, EmbeddingProvider};
use crate::store::GraphStore;
use crate::tokens::TokenBudgeter;

use graphrag::GraphRagEngine;
use pathrag::{PathParams, PathRagEngine};
use vector::VectorEngine;

/// Per-call overrides; unset fields fall back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub mode: Option<QueryMode>,
    pub k: Option<usize>,
    pub n: Option<usize>,
    pub alpha: Option<f64>,
    pub theta: Option<f32>,
    pub max_hops: Option<usize>,
    pub budgets: Option<QueryBudgets>,
}

/// Routes questions to the retrieval engines.
pub struct QueryService {
    store: Arc<dyn GraphStore>,
    chat: Arc<dyn ChatProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: QueryConfig,
    budgeter: TokenBudgeter,
    parallelism: usize,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("config", &self.config)
            .finish()
    }
}

impl QueryService {
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        chat: Arc<dyn ChatProvider>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: QueryConfig,
        budgeter: TokenBudgeter,
        parallelism: usize,
    ) -> Self {
        Self {
            store,
            chat,
            embedder,
            config,
            budgeter,
            parallelism,
        }
    }

    /// Answer a question for a series.
    pub async fn query(
        &self,
        series: &str,
        question: &str,
        opts: &QueryOptions,
    ) -> Result<AnswerBundle> {
        if series.trim().is_empty() {
            return Err(GraphRagError::ConfigInvalid("series must not be empty".into()));
        }
        if question.trim().is_empty() {
            return Err(GraphRagError::ConfigInvalid("question must not be empty".into()));
        }

        let start = Instant::now();
        let route = router::route(question, opts.mode.unwrap_or(QueryMode::Auto));

        // A series with neither chunks nor graph yields an empty bundle, not
        // an error.
        if self.store.count_chunks(series).await? == 0 {
            let (entities, _) = self.store.load_graph(series).await?;
            if entities.is_empty() {
                let mut bundle = AnswerBundle::empty(
                    series,
                    route.mode,
                    question,
                    vec![format!("series '{series}' has no chunks and no graph")],
                );
                bundle.latency_ms = start.elapsed().as_millis() as u64;
                return Ok(bundle);
            }
        }

        let budgets = opts.budgets.unwrap_or(self.config.budgets);
        let mut bundle = match route.mode {
            QueryMode::Graph => {
                let engine = GraphRagEngine::new(
                    Arc::clone(&self.chat),
                    self.embedder.clone(),
                    self.budgeter,
                    budgets,
                    self.parallelism,
                );
                engine.run(self.store.as_ref(), series, question).await?
            }
            QueryMode::Path => {
                let params = PathParams {
                    k: opts.k.unwrap_or(self.config.k),
                    n: opts.n.unwrap_or(self.config.n),
                    alpha: opts.alpha.unwrap_or(self.config.alpha),
                    theta: opts.theta.unwrap_or(self.config.theta),
                    max_hops: opts.max_hops.unwrap_or(self.config.max_hops),
                };
                let engine =
                    PathRagEngine::new(Arc::clone(&self.chat), self.budgeter, budgets);
                match engine.run(self.store.as_ref(), series, question, params).await? {
                    Some(bundle) => bundle,
                    None if self.config.path_fallback_to_vector => {
                        info!(series, "no paths survived pruning, falling back to vector");
                        let engine = VectorEngine::new(
                            Arc::clone(&self.chat),
                            self.embedder.clone(),
                            self.budgeter,
                            budgets,
                        );
                        let mut bundle = engine
                            .run(
                                self.store.as_ref(),
                                series,
                                question,
                                opts.k.unwrap_or(self.config.k),
                            )
                            .await?;
                        bundle
                            .warnings
                            .push("pathrag found no paths, vector fallback used".to_string());
                        bundle
                    }
                    None => AnswerBundle::empty(
                        series,
                        QueryMode::Path,
                        question,
                        vec!["pathrag found no paths".to_string()],
                    ),
                }
            }
            QueryMode::Vector | QueryMode::Auto => {
                let engine = VectorEngine::new(
                    Arc::clone(&self.chat),
                    self.embedder.clone(),
                    self.budgeter,
                    budgets,
                );
                engine
                    .run(
                        self.store.as_ref(),
                        series,
                        question,
                        opts.k.unwrap_or(self.config.k),
                    )
                    .await?
            }
        };

        bundle.latency_ms = start.elapsed().as_millis() as u64;
        attach_router_debug(&mut bundle, route.rule);
        Ok(bundle)
    }

    /// Debug view: raw vector/fulltext top-k over chunks.
    pub async fn search(&self, series: &str, question: &str, k: usize) -> Result<Vec<ChunkHit>> {
        if series.trim().is_empty() {
            return Err(GraphRagError::ConfigInvalid("series must not be empty".into()));
        }
        let engine = VectorEngine::new(
            Arc::clone(&self.chat),
            self.embedder.clone(),
            self.budgeter,
            self.config.budgets,
        );
        let (hits, _) = engine.retrieve(self.store.as_ref(), series, question, k).await?;
        Ok(hits)
    }
}

/// Record which router rule fired in the bundle's debug payload.
fn attach_router_debug(bundle: &mut AnswerBundle, rule: &str) {
    let router = json!({ "mode": bundle.mode_used, "rule": rule });
    match bundle.debug.as_object_mut() {
        Some(map) => {
            map.insert("router".to_string(), router);
        }
        None => {
            bundle.debug = json!({ "router": router });
        }
    }
}
