//! Graph-augmented Retrieval-Augmented Generation core.
//!
//! Ingested chunks are turned into a canonicalized knowledge graph with
//! hierarchical community summaries; questions are answered by routing
//! between community-summary map-reduce (GraphRAG), flow-pruned path
//! reasoning (PathRAG), and dense chunk retrieval.
//!
//! # Architecture
//!
//! - **Store**: trait-based graph persistence (Postgres+pgvector or
//!   in-process), the only component that writes
//! - **Pipeline**: canonicalize → link → upsert → communities → hierarchy →
//!   summaries → indexes, orchestrated per series
//! - **Query**: deterministic router over three engines, each returning a
//!   citation-bearing [`domain::answer::AnswerBundle`]
//!
//! # Modules
//!
//! - [`kg`]: graph construction pipeline
//! - [`query`]: router and retrieval engines
//! - [`store`]: persistence trait and providers
//! - [`provider`]: chat/embedding capability traits and clients

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]

pub mod concurrency;
pub mod config;
pub mod domain;
pub mod error;
pub mod graph;
pub mod ids;
pub mod kg;
pub mod prompts;
pub mod provider;
pub mod query;
pub mod store;
pub mod telemetry;
pub mod tokens;

use std::sync::Arc;

use crate::config::{EmbeddingBackend, GraphRagConfig, StoreBackend};
use crate::domain::answer::{AnswerBundle, BuildReport};
use crate::domain::chunk::{ChunkHit, ChunkRecord};
use crate::error::{GraphRagError, Result};
use crate::kg::build::{BuildOptions, BuildOrchestrator};
use crate::provider::openai::{OpenAiChatProvider, OpenAiEmbeddingProvider, OpenAiSettings};
use crate::provider::{ChatProvider, EmbeddingProvider};
use crate::query::{QueryOptions, QueryService};
use crate::store::GraphStore;
use crate::store::providers::{MemoryGraphStore, PostgresGraphStore};
use crate::tokens::TokenBudgeter;

/// Service facade: holds the injected handles and exposes the public API
/// (`build`, `query`, `search`). There are no global factories; everything
/// the components need arrives through this constructor.
#[derive(Clone)]
pub struct GraphRag {
    store: Arc<dyn GraphStore>,
    chat: Arc<dyn ChatProvider>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: Arc<GraphRagConfig>,
    budgeter: TokenBudgeter,
}

impl std::fmt::Debug for GraphRag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphRag")
            .field("store", &self.store)
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

impl GraphRag {
    /// Assemble the service from explicit handles.
    #[must_use]
    pub fn new(
        store: Arc<dyn GraphStore>,
        chat: Arc<dyn ChatProvider>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: GraphRagConfig,
    ) -> Self {
        let budgeter = TokenBudgeter::new(config.provider.family);
        Self {
            store,
            chat,
            embedder,
            config: Arc::new(config),
            budgeter,
        }
    }

    /// Assemble the service from configuration: connect the store and build
    /// the provider clients.
    pub async fn from_config(config: GraphRagConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn GraphStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryGraphStore::new()),
            StoreBackend::Postgres => {
                let url = config.store.database_url.as_deref().ok_or_else(|| {
                    GraphRagError::ConfigInvalid("store.database_url missing".into())
                })?;
                Arc::new(PostgresGraphStore::connect(url).await?)
            }
        };

        let settings = OpenAiSettings {
            base_url: config.provider.base_url.clone(),
            api_key: config.provider.api_key.clone(),
            model: config.provider.model.clone(),
            embed_model: config.provider.embed_model.clone(),
            deadline: std::time::Duration::from_secs(config.provider.timeout_s),
            family: config.provider.family,
        };
        let chat: Arc<dyn ChatProvider> = Arc::new(OpenAiChatProvider::new(settings.clone()));
        let embedder: Option<Arc<dyn EmbeddingProvider>> = match config.provider.embeddings {
            EmbeddingBackend::Openai => Some(Arc::new(OpenAiEmbeddingProvider::new(settings))),
            EmbeddingBackend::Local => {
                Some(Arc::new(provider::local::LocalEmbeddingProvider::init().await?))
            }
            EmbeddingBackend::Disabled => None,
        };

        Ok(Self::new(store, chat, embedder, config))
    }

    /// Access the underlying store (e.g. to seed chunks).
    #[must_use]
    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Seed pre-chunked records.
    pub async fn ingest_chunks(&self, rows: &[ChunkRecord]) -> Result<u64> {
        self.store.upsert_chunks(rows).await
    }

    /// Run the end-to-end build for a series.
    pub async fn build(&self, series: &str, options: &BuildOptions) -> Result<BuildReport> {
        let orchestrator = BuildOrchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chat),
            self.embedder.clone(),
            self.config.build.clone(),
            self.budgeter,
        );
        orchestrator.build(series, options).await
    }

    /// Answer a question for a series.
    pub async fn query(
        &self,
        series: &str,
        question: &str,
        options: &QueryOptions,
    ) -> Result<AnswerBundle> {
        let service = QueryService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chat),
            self.embedder.clone(),
            self.config.query.clone(),
            self.budgeter,
            self.config.build.parallelism,
        );
        service.query(series, question, options).await
    }

    /// Vector top-k debug view over chunks.
    pub async fn search(&self, series: &str, question: &str, k: usize) -> Result<Vec<ChunkHit>> {
        let service = QueryService::new(
            Arc::clone(&self.store),
            Arc::clone(&self.chat),
            self.embedder.clone(),
            self.config.query.clone(),
            self.budgeter,
            self.config.build.parallelism,
        );
        service.search(series, question, k).await
    }
}
