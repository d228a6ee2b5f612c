//! Community summarization.
//!
//! For each community at the selected levels, the most central members (by
//! degree, name as tie-break) are rendered into a blob and summarized by the
//! chat provider. The text lands both on the community node and as a Summary
//! artifact, which is what the GraphRAG seed search consumes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{info, warn};

use crate::concurrency;
use crate::domain::graph::{EntityRow, SummaryRow};
use crate::error::Result;
use crate::graph::projection::GraphProjection;
use crate::prompts;
use crate::provider::ChatProvider;
use crate::store::GraphStore;
use crate::tokens::TokenBudgeter;

/// Summarizer settings.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Member entities per summary prompt.
    pub max_members: usize,
    /// Token budget of the prompt.
    pub max_tokens: usize,
    /// Bounded fan-out width over communities.
    pub parallelism: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_members: 40,
            max_tokens: 1200,
            parallelism: 8,
        }
    }
}

/// Result of a summarization pass.
#[derive(Debug, Default)]
pub struct SummarizeOutcome {
    /// Artifacts written, ordered by id.
    pub summaries: Vec<SummaryRow>,
    pub warnings: Vec<String>,
}

/// Produces natural-language summaries per community.
pub struct CommunitySummarizer {
    chat: Arc<dyn ChatProvider>,
    budgeter: TokenBudgeter,
    config: SummarizerConfig,
}

impl std::fmt::Debug for CommunitySummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunitySummarizer")
            .field("config", &self.config)
            .finish()
    }
}

impl CommunitySummarizer {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        budgeter: TokenBudgeter,
        config: SummarizerConfig,
    ) -> Self {
        Self {
            chat,
            budgeter,
            config,
        }
    }

    /// Summarize every community at the given levels.
    pub async fn make(
        &self,
        store: &dyn GraphStore,
        series: &str,
        levels: &[u32],
    ) -> Result<SummarizeOutcome> {
        let (entities, relations) = store.load_graph(series).await?;
        let projection = GraphProjection::build(&entities, &relations);
        let by_id: HashMap<&str, &EntityRow> =
            entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut outcome = SummarizeOutcome::default();
        for &level in levels {
            let memberships = store.memberships(series, level).await?;
            let mut by_cid: BTreeMap<String, Vec<&EntityRow>> = BTreeMap::new();
            for m in &memberships {
                if let Some(&entity) = by_id.get(m.entity_id.as_str()) {
                    by_cid.entry(m.cid.clone()).or_default().push(entity);
                }
            }

            let jobs: Vec<(String, String)> = by_cid
                .into_iter()
                .map(|(cid, members)| (cid, self.members_blob(members, &projection)))
                .collect();

            let results = concurrency::map_bounded(jobs, self.config.parallelism, |(cid, blob)| {
                self.summarize_one(series, level, cid, blob)
            })
            .await;

            let mut rows: Vec<SummaryRow> = Vec::new();
            for result in results {
                match result {
                    Ok(row) => rows.push(row),
                    Err((cid, err)) => {
                        warn!(series, level, cid = %cid, error = %err, "summary skipped");
                        outcome
                            .warnings
                            .push(format!("summarize: community '{cid}' at L{level} skipped: {err}"));
                    }
                }
            }
            rows.sort_by(|a, b| a.id.cmp(&b.id));

            for row in &rows {
                store
                    .set_community_summary(series, level, &row.cid, &row.text)
                    .await?;
            }
            store.replace_summaries(series, level, &rows).await?;
            info!(series, level, summaries = rows.len(), "level summarized");
            outcome.summaries.extend(rows);
        }
        Ok(outcome)
    }

    /// Render the members blob, most central first: degree descending, name
    /// ascending as tie-break, truncated to the token budget.
    fn members_blob(&self, mut members: Vec<&EntityRow>, projection: &GraphProjection) -> String {
        members.sort_by(|a, b| {
            projection
                .degree(&b.id)
                .cmp(&projection.degree(&a.id))
                .then_with(|| a.name.cmp(&b.name))
        });
        members.truncate(self.config.max_members);

        let blob = members
            .iter()
            .map(|e| format!("- {} [{}]: {}", e.name, e.entity_type, e.desc))
            .collect::<Vec<_>>()
            .join("\n");
        self.budgeter.fit(&blob, self.config.max_tokens)
    }

    async fn summarize_one(
        &self,
        series: &str,
        level: u32,
        cid: String,
        blob: String,
    ) -> std::result::Result<SummaryRow, (String, crate::error::GraphRagError)> {
        let prompt = prompts::render(
            prompts::COMM_SUMMARIZE,
            &[("level", &level.to_string()), ("members", &blob)],
        );
        let prompt = self.budgeter.fit(&prompt, self.config.max_tokens);

        let text = match self.chat.ask(&prompt).await {
            Ok(raw) => raw.trim().to_string(),
            Err(err) => return Err((cid, err)),
        };
        let tokens = self.budgeter.count_tokens(&text);

        Ok(SummaryRow {
            id: SummaryRow::id_for(&cid, level),
            series: series.to_string(),
            level,
            cid,
            text,
            tokens,
            vec: None,
        })
    }
}
