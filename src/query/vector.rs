//! Dense chunk retrieval with a citation-first prompt.
//!
//! The query is embedded and matched against the chunk index; when
//! embeddings are unavailable the engine degrades to a keyword full-text
//! scan. The prompt demands explicit `[cid=...]` citations so the answer
//! stays traceable to the retrieved chunks.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::config::QueryBudgets;
use crate::domain::answer::{AnswerBundle, Citation, QueryMode, TokenUsage};
use crate::domain::chunk::ChunkHit;
use crate::error::Result;
use crate::prompts;
use crate::provider::{ChatProvider, EmbeddingProvider};
use crate::store::GraphStore;
use crate::tokens::TokenBudgeter;

/// Dense retrieval engine over the chunk index.
pub struct VectorEngine {
    chat: Arc<dyn ChatProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    budgeter: TokenBudgeter,
    budgets: QueryBudgets,
}

impl std::fmt::Debug for VectorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorEngine")
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

impl VectorEngine {
    #[must_use]
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        budgeter: TokenBudgeter,
        budgets: QueryBudgets,
    ) -> Self {
        Self {
            chat,
            embedder,
            budgeter,
            budgets,
        }
    }

    /// Retrieve top-k chunks; vector search first, full-text fallback.
    pub async fn retrieve(
        &self,
        store: &dyn GraphStore,
        series: &str,
        query: &str,
        k: usize,
    ) -> Result<(Vec<ChunkHit>, &'static str)> {
        if let Some(embedder) = &self.embedder {
            match embedder.embed(query).await {
                Ok(query_vec) => {
                    let hits = store.chunks_by_vector(series, &query_vec, k).await?;
                    if !hits.is_empty() {
                        return Ok((hits, "vector"));
                    }
                    // Chunks without embeddings are invisible to the index;
                    // try the full-text pass before giving up.
                }
                Err(err) => {
                    warn!(error = %err, "query embedding failed, using fulltext");
                }
            }
        }
        let hits = store.chunks_by_fulltext(series, query, k).await?;
        Ok((hits, "fulltext"))
    }

    /// Answer from retrieved chunks.
    pub async fn run(
        &self,
        store: &dyn GraphStore,
        series: &str,
        question: &str,
        k: usize,
    ) -> Result<AnswerBundle> {
        let (hits, retrieval) = self.retrieve(store, series, question, k).await?;
        if hits.is_empty() {
            return Ok(AnswerBundle::empty(
                series,
                QueryMode::Vector,
                question,
                vec!["no matching chunks".to_string()],
            ));
        }

        let share = self.budgets.vector_tokens / hits.len().max(1);
        let chunks_block = hits
            .iter()
            .map(|h| {
                let text = self.budgeter.fit(&h.chunk.text, share.max(1));
                format!("[cid={}] {}", h.chunk.id, text)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = prompts::render(
            prompts::VECTOR_ANSWER,
            &[("chunks_block", &chunks_block), ("query", question)],
        );
        let prompt_tokens = self.budgeter.count_tokens(&prompt);

        let raw = self.chat.ask(&prompt).await?;
        let answer = raw.trim().to_string();
        let completion_tokens = self.budgeter.count_tokens(&answer);

        let citations: Vec<Citation> = hits
            .iter()
            .map(|h| Citation::Vector {
                cid: h.chunk.id.clone(),
                doc: h.chunk.doc_id.clone(),
                page: h.chunk.page,
                score: h.score,
            })
            .collect();

        debug!(series, retrieval, chunks = hits.len(), "vector engine answered");
        Ok(AnswerBundle {
            series: series.to_string(),
            mode_used: QueryMode::Vector,
            question: question.to_string(),
            answer,
            citations,
            latency_ms: 0,
            token_usage: TokenUsage::new(prompt_tokens, completion_tokens),
            debug: json!({
                "retrieval": retrieval,
                "chunks": hits.iter().map(|h| h.chunk.id.clone()).collect::<Vec<_>>(),
            }),
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::chunk::ChunkRecord;
    use crate::provider::mock::{MockChat, MockEmbedder};
    use crate::store::providers::MemoryGraphStore;
    use crate::tokens::ModelFamily;

    fn chunk(id: &str, text: &str, embedding: Option<Vec<f32>>) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            series: "s1".to_string(),
            doc_id: Some("brochure.pdf".to_string()),
            page: Some(3),
            order: Some(0),
            text: text.to_string(),
            embedding,
        }
    }

    fn engine(chat: MockChat, embedder: Option<MockEmbedder>) -> VectorEngine {
        VectorEngine::new(
            Arc::new(chat),
            embedder.map(|e| Arc::new(e) as Arc<dyn EmbeddingProvider>),
            TokenBudgeter::new(ModelFamily::GptLike),
            QueryBudgets::default(),
        )
    }

    #[tokio::test]
    async fn test_fulltext_fallback_without_embedder() {
        let store = MemoryGraphStore::new();
        store
            .upsert_chunks(&[
                chunk("c1", "numéro d'identification fiscale: 123", None),
                chunk("c2", "couleur du logo", None),
            ])
            .await
            .unwrap();

        let e = engine(MockChat::new().fallback("Le numéro est 123 [cid=c1]."), None);
        let bundle = e.run(&store, "s1", "numéro d'identification", 5).await.unwrap();

        assert_eq!(bundle.mode_used, QueryMode::Vector);
        assert_eq!(bundle.citations.len(), 1);
        match &bundle.citations[0] {
            Citation::Vector { cid, doc, page, score } => {
                assert_eq!(cid, "c1");
                assert_eq!(doc.as_deref(), Some("brochure.pdf"));
                assert_eq!(*page, Some(3));
                assert!(*score > 0.0);
            }
            other => panic!("expected vector citation, got {other:?}"),
        }
        assert_eq!(bundle.debug["retrieval"], "fulltext");
    }

    #[tokio::test]
    async fn test_prompt_demands_cid_citations() {
        let store = MemoryGraphStore::new();
        store
            .upsert_chunks(&[chunk("c1", "interesting fact about acme", None)])
            .await
            .unwrap();

        let chat = Arc::new(MockChat::new().fallback("ok"));
        let e = VectorEngine::new(
            Arc::clone(&chat) as Arc<dyn ChatProvider>,
            None,
            TokenBudgeter::new(ModelFamily::GptLike),
            QueryBudgets::default(),
        );
        e.run(&store, "s1", "acme fact", 5).await.unwrap();

        let calls = chat.calls();
        assert_eq!(calls.len(), 1);
        // Citation-first header, then the cid-tagged excerpt, then question.
        assert!(calls[0].contains("[cid=...]"));
        assert!(calls[0].contains("[cid=c1] interesting fact about acme"));
        assert!(calls[0].contains("Question: acme fact"));
    }

    #[tokio::test]
    async fn test_vector_retrieval_with_embeddings() {
        let store = MemoryGraphStore::new();
        let embedder = MockEmbedder::new(8);
        let acme_vec = embedder.embed("acme acquisition details").await.unwrap();
        store
            .upsert_chunks(&[
                chunk("c1", "acme acquisition details", Some(acme_vec)),
                chunk("c2", "unrelated topic", Some(vec![0.0; 8])),
            ])
            .await
            .unwrap();

        let e = engine(MockChat::new().fallback("answer"), Some(embedder));
        let bundle = e.run(&store, "s1", "acme acquisition details", 2).await.unwrap();
        assert_eq!(bundle.debug["retrieval"], "vector");
        match &bundle.citations[0] {
            Citation::Vector { cid, .. } => assert_eq!(cid, "c1"),
            other => panic!("unexpected citation {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_hits_yields_empty_bundle() {
        let store = MemoryGraphStore::new();
        let e = engine(MockChat::new().fallback("unused"), None);
        let bundle = e.run(&store, "s1", "anything", 5).await.unwrap();
        assert!(bundle.answer.is_empty());
        assert_eq!(bundle.warnings, vec!["no matching chunks".to_string()]);
    }
}
