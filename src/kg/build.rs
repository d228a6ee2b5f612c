//! Build orchestration.
//!
//! Sequences the pipeline for one series: constraints, canonicalize, link,
//! upsert, community detection, hierarchy wiring, summarization, index sync.
//! Every step is idempotent under re-run. Failures before anything is
//! persisted surface as a step-named error; once the graph is written, a
//! failing step ends the build with a partial report instead, the step name
//! recorded in `warnings`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::BuildConfig;
use crate::domain::answer::BuildReport;
use crate::error::{GraphRagError, Result};
use crate::kg::canonicalize::{Canonicalizer, CanonicalizerConfig};
use crate::kg::community::{CommunityDetector, CommunityDetectorConfig};
use crate::kg::hierarchy::HierarchyWirer;
use crate::kg::indexer::{IndexerConfig, SearchIndexer};
use crate::kg::linker::EntityLinker;
use crate::kg::summarize::{CommunitySummarizer, SummarizerConfig};
use crate::provider::{ChatProvider, EmbeddingProvider};
use crate::store::GraphStore;
use crate::tokens::TokenBudgeter;

/// Per-call overrides for a build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub min_conf: Option<f32>,
    pub levels: Option<u32>,
    pub resolution: Option<f64>,
    pub summary_levels: Option<Vec<u32>>,
}

/// Runs the end-to-end build for a series.
pub struct BuildOrchestrator {
    store: Arc<dyn GraphStore>,
    chat: Arc<dyn ChatProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: BuildConfig,
    budgeter: TokenBudgeter,
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("config", &self.config)
            .finish()
    }
}

impl BuildOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        chat: Arc<dyn ChatProvider>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: BuildConfig,
        budgeter: TokenBudgeter,
    ) -> Self {
        Self {
            store,
            chat,
            embedder,
            config,
            budgeter,
        }
    }

    /// Build the knowledge graph, communities, summaries and indexes.
    pub async fn build(&self, series: &str, options: &BuildOptions) -> Result<BuildReport> {
        if series.trim().is_empty() {
            return Err(GraphRagError::ConfigInvalid("series must not be empty".into()));
        }

        let start = Instant::now();
        let mut report = BuildReport::empty(series);

        self.store
            .ensure_constraints()
            .await
            .map_err(|e| e.in_step("ensure_constraints"))?;

        if self.store.count_chunks(series).await? == 0 {
            report.warnings.push("no chunks".to_string());
            report.elapsed_s = start.elapsed().as_secs_f64();
            info!(series, "build skipped: series has no chunks");
            return Ok(report);
        }

        // 1. Canonicalize: chunks -> entity/relation drafts.
        let min_conf = options.min_conf.unwrap_or(self.config.min_conf);
        let canonicalizer = Canonicalizer::new(
            Arc::clone(&self.chat),
            self.budgeter,
            CanonicalizerConfig {
                min_conf,
                max_ctx_tokens: self.config.max_ctx_tokens,
                parallelism: self.config.parallelism,
            },
        );
        let extracted = canonicalizer
            .run(self.store.as_ref(), series)
            .await
            .map_err(|e| e.in_step("canonicalize"))?;
        report.warnings.extend(extracted.warnings);

        // 2. Entity linking: dedup + alias provenance.
        let linker = EntityLinker::new(Arc::clone(&self.chat));
        let linked = linker
            .run(series, extracted.nodes, extracted.edges)
            .await
            .map_err(|e| e.in_step("entity_link"))?;
        report.warnings.extend(linked.warnings);

        // 3. Persist: upsert + mention links.
        let upsert_result: Result<()> = async {
            self.store.upsert_entities(series, &linked.nodes).await?;
            let stats = self.store.upsert_relations(series, &linked.edges).await?;
            if stats.skipped_missing_endpoint > 0 {
                report.warnings.push(format!(
                    "upsert: {} relations skipped (missing endpoints)",
                    stats.skipped_missing_endpoint
                ));
            }
            self.store.link_mentions(series, &linked.nodes).await?;
            Ok(())
        }
        .await;
        upsert_result.map_err(|e| e.in_step("upsert"))?;

        report.nodes = linked.nodes.len() as u64;
        report.edges = linked.edges.len() as u64;
        info!(series, nodes = report.nodes, edges = report.edges, "graph upserted");

        // The graph is persisted; from here on a failing step yields a
        // partial report rather than an error.
        let levels = options.levels.unwrap_or(self.config.levels);
        let resolution = options.resolution.unwrap_or(self.config.resolution);

        // 4. Community detection.
        let detector = CommunityDetector::new(CommunityDetectorConfig {
            levels,
            resolution,
            ..CommunityDetectorConfig::default()
        });
        let stats = match detector.detect(self.store.as_ref(), series).await {
            Ok(stats) => stats,
            Err(err) => return Ok(self.partial(report, start, "community_detect", &err)),
        };
        for level_stats in &stats {
            report
                .communities_per_level
                .insert(format!("L{}", level_stats.level), level_stats.communities);
        }

        // 5. Hierarchy wiring over all detected levels.
        let all_levels: Vec<u32> = (0..levels).collect();
        if let Err(err) = HierarchyWirer::new()
            .wire(self.store.as_ref(), series, &all_levels)
            .await
        {
            return Ok(self.partial(report, start, "hierarchy_wire", &err));
        }

        // 6. Community summaries at the selected levels.
        let summary_levels = options
            .summary_levels
            .clone()
            .unwrap_or_else(|| self.config.summary_levels.clone());
        let summary_levels: Vec<u32> =
            summary_levels.into_iter().filter(|l| *l < levels).collect();
        let summarizer = CommunitySummarizer::new(
            Arc::clone(&self.chat),
            self.budgeter,
            SummarizerConfig {
                max_members: self.config.max_members,
                max_tokens: self.config.summary_max_tokens,
                parallelism: self.config.parallelism,
            },
        );
        let summarized = match summarizer
            .make(self.store.as_ref(), series, &summary_levels)
            .await
        {
            Ok(out) => out,
            Err(err) => return Ok(self.partial(report, start, "summarize", &err)),
        };
        report.warnings.extend(summarized.warnings);
        for level in &summary_levels {
            let count = summarized.summaries.iter().filter(|s| s.level == *level).count() as u64;
            report.summaries_per_level.insert(format!("L{level}"), count);
        }

        // 7. Vector index sync.
        let indexer = SearchIndexer::new(
            self.embedder.clone(),
            IndexerConfig { batch: self.config.embed_batch },
        );
        match indexer.sync(self.store.as_ref(), series).await {
            Ok(out) => {
                report.indexes = out.indexes;
                report.warnings.extend(out.warnings);
            }
            Err(err) => return Ok(self.partial(report, start, "index_sync", &err)),
        }

        report.elapsed_s = start.elapsed().as_secs_f64();
        info!(series, elapsed_s = report.elapsed_s, "build complete");
        Ok(report)
    }

    /// Close out a partial build after a step failure.
    fn partial(
        &self,
        mut report: BuildReport,
        start: Instant,
        step: &str,
        err: &GraphRagError,
    ) -> BuildReport {
        warn!(step, error = %err, "build step failed, returning partial report");
        report.warnings.push(format!("step '{step}' failed: {err}"));
        report.elapsed_s = start.elapsed().as_secs_f64();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chunk::ChunkRecord;
    use crate::provider::mock::{MockChat, MockEmbedder};
    use crate::store::providers::MemoryGraphStore;
    use crate::tokens::ModelFamily;

    const ACME_JSON: &str = r#"{
        "entities": [
            {"name": "Acme", "type": "Org", "conf": 0.9},
            {"name": "Beta", "type": "Org", "conf": 0.9}
        ],
        "relations": [
            {"src": "Acme", "dst": "Beta", "pred": "ACQUIRED", "conf": 0.8}
        ]
    }"#;

    fn orchestrator(store: Arc<MemoryGraphStore>, chat: MockChat) -> BuildOrchestrator {
        BuildOrchestrator::new(
            store,
            Arc::new(chat),
            Some(Arc::new(MockEmbedder::new(8))),
            BuildConfig::default(),
            TokenBudgeter::new(ModelFamily::GptLike),
        )
    }

    fn scripted_chat() -> MockChat {
        MockChat::new()
            .on("information extractor", ACME_JSON)
            .on("disambiguation", r#"{"winner": "NONE"}"#)
            .on("summarizing one community", "Acme and Beta form an acquisition cluster.")
            .fallback("{}")
    }

    async fn seeded() -> Arc<MemoryGraphStore> {
        let store = Arc::new(MemoryGraphStore::new());
        store
            .upsert_chunks(&[ChunkRecord {
                id: "c1".into(),
                series: "s1".into(),
                doc_id: Some("doc".into()),
                page: Some(1),
                order: Some(0),
                text: "Acme acquired Beta in 2021.".into(),
                embedding: None,
            }])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_empty_series_reports_no_chunks() {
        let store = Arc::new(MemoryGraphStore::new());
        let orch = orchestrator(Arc::clone(&store), scripted_chat());

        let report = orch.build("empty", &BuildOptions::default()).await.unwrap();
        assert_eq!(report.nodes, 0);
        assert_eq!(report.edges, 0);
        assert!(report.communities_per_level.is_empty());
        assert_eq!(report.warnings, vec!["no chunks".to_string()]);
    }

    #[tokio::test]
    async fn test_blank_series_rejected() {
        let store = Arc::new(MemoryGraphStore::new());
        let orch = orchestrator(store, scripted_chat());
        let err = orch.build("  ", &BuildOptions::default()).await.unwrap_err();
        assert!(matches!(err, GraphRagError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_full_build_produces_report() {
        let store = seeded().await;
        let orch = orchestrator(Arc::clone(&store), scripted_chat());

        let report = orch.build("s1", &BuildOptions::default()).await.unwrap();
        assert_eq!(report.nodes, 2);
        assert_eq!(report.edges, 1);
        assert_eq!(report.communities_per_level.len(), 3);
        assert_eq!(report.summaries_per_level.len(), 2);
        assert_eq!(report.indexes.len(), 3);
        assert!(report.elapsed_s >= 0.0);

        // Mention links derived from cids.
        assert_eq!(store.mention_links("s1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_build_twice_same_outcome() {
        let store = seeded().await;
        let orch = orchestrator(Arc::clone(&store), scripted_chat());

        let first = orch.build("s1", &BuildOptions::default()).await.unwrap();
        let second = orch.build("s1", &BuildOptions::default()).await.unwrap();
        assert!(first.same_outcome(&second));

        // S1: replaying the build must not duplicate evidence.
        let (entities, relations) = store.load_graph("s1").await.unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(relations.len(), 1);
        assert!(entities.iter().all(|e| e.cids == vec!["c1"]));
    }

    #[tokio::test]
    async fn test_summarizer_failure_yields_partial_report() {
        let store = seeded().await;
        let chat = MockChat::new()
            .on("information extractor", ACME_JSON)
            .on("disambiguation", r#"{"winner": "NONE"}"#)
            .fail_on("summarizing one community")
            .fallback("{}");
        let orch = orchestrator(Arc::clone(&store), chat);

        let report = orch.build("s1", &BuildOptions::default()).await.unwrap();
        // Graph and communities persisted despite the summary failures.
        assert_eq!(report.nodes, 2);
        assert!(!report.communities_per_level.is_empty());
        assert!(report.warnings.iter().any(|w| w.contains("summarize")));
    }

    #[tokio::test]
    async fn test_options_override_levels() {
        let store = seeded().await;
        let orch = orchestrator(Arc::clone(&store), scripted_chat());
        let report = orch
            .build(
                "s1",
                &BuildOptions {
                    levels: Some(1),
                    summary_levels: Some(vec![0, 1]),
                    ..BuildOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.communities_per_level.len(), 1);
        // Summary level 1 filtered out: only level 0 exists.
        assert_eq!(report.summaries_per_level.len(), 1);
    }
}
