//! Configuration loading.
//!
//! Layering: built-in defaults, then an optional config file, then
//! environment variables (`GRAPHRAG_*`, `__` as section separator). The CLI
//! adds flag overrides on top in `main`.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{GraphRagError, Result};
use crate::tokens::ModelFamily;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphRagConfig {
    pub provider: ProviderConfig,
    pub store: StoreConfig,
    pub build: BuildConfig,
    pub query: QueryConfig,
}

/// Chat/embedding provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible endpoint.
    pub base_url: String,
    /// Bearer token; read from the environment, never from files.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Chat model identifier.
    pub model: String,
    /// Embedding model identifier.
    pub embed_model: String,
    /// Embedding backend: `openai`, `local` (fastembed), or `disabled`.
    pub embeddings: EmbeddingBackend,
    /// Token-ratio family of the chat model.
    pub family: ModelFamily,
    /// Per-call deadline in seconds.
    pub timeout_s: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    Openai,
    Local,
    Disabled,
}

/// Storage backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

/// Build pipeline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Minimum extraction confidence kept by the canonicalizer.
    pub min_conf: f32,
    /// Chunk text budget for the canonicalization prompt.
    pub max_ctx_tokens: usize,
    /// Number of community resolution levels.
    pub levels: u32,
    /// Base resolution; level ℓ runs at `resolution * (1 + 0.5ℓ)`.
    pub resolution: f64,
    /// Levels that get community summaries.
    pub summary_levels: Vec<u32>,
    /// Member entities per community summary prompt.
    pub max_members: usize,
    /// Token budget of the summary prompt.
    pub summary_max_tokens: usize,
    /// Bounded fan-out width; 0 = auto-detect.
    pub parallelism: usize,
    /// Texts per embedding batch.
    pub embed_batch: usize,
}

/// Query engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Top-K paths / chunks.
    pub k: usize,
    /// Top-N seed nodes for PathRAG.
    pub n: usize,
    /// PathRAG length decay, in `(0, 1]`.
    pub alpha: f64,
    /// PathRAG minimum confidence, in `[0, 1]`.
    pub theta: f32,
    /// Maximum edges per path.
    pub max_hops: usize,
    /// Fall back to the vector engine when PathRAG finds no paths.
    pub path_fallback_to_vector: bool,
    pub budgets: QueryBudgets,
}

/// Per-stage prompt token budgets.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueryBudgets {
    pub qfs_map_tokens: usize,
    pub qfs_reduce_tokens: usize,
    pub paths_tokens: usize,
    pub vector_tokens: usize,
    /// Seed summaries considered by GraphRAG.
    pub seed_limit: usize,
    /// Budget per seed summary text.
    pub seed_summary_tokens: usize,
}

impl Default for QueryBudgets {
    fn default() -> Self {
        Self {
            qfs_map_tokens: 512,
            qfs_reduce_tokens: 512,
            paths_tokens: 800,
            vector_tokens: 1200,
            seed_limit: 12,
            seed_summary_tokens: 256,
        }
    }
}

impl Default for GraphRagConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                base_url: "https://api.openai.com".to_string(),
                api_key: None,
                model: "gpt-4o-mini".to_string(),
                embed_model: "text-embedding-3-small".to_string(),
                embeddings: EmbeddingBackend::Openai,
                family: ModelFamily::GptLike,
                timeout_s: 30,
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                database_url: None,
            },
            build: BuildConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            min_conf: 0.35,
            max_ctx_tokens: 1200,
            levels: 3,
            resolution: 1.2,
            summary_levels: vec![0, 1],
            max_members: 40,
            summary_max_tokens: 1200,
            parallelism: 8,
            embed_batch: 256,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            k: 12,
            n: 30,
            alpha: 0.8,
            theta: 0.05,
            max_hops: 3,
            path_fallback_to_vector: true,
            budgets: QueryBudgets::default(),
        }
    }
}

impl GraphRagConfig {
    /// Load defaults → optional file → environment.
    pub fn load(file: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder()
            .set_default("provider.base_url", "https://api.openai.com")
            .and_then(|b| b.set_default("provider.model", "gpt-4o-mini"))
            .and_then(|b| b.set_default("provider.embed_model", "text-embedding-3-small"))
            .and_then(|b| b.set_default("provider.embeddings", "openai"))
            .and_then(|b| b.set_default("provider.family", "gpt_like"))
            .and_then(|b| b.set_default("provider.timeout_s", 30))
            .and_then(|b| b.set_default("store.backend", "memory"))
            .and_then(|b| b.set_default("build.min_conf", 0.35))
            .and_then(|b| b.set_default("build.max_ctx_tokens", 1200))
            .and_then(|b| b.set_default("build.levels", 3))
            .and_then(|b| b.set_default("build.resolution", 1.2))
            .and_then(|b| b.set_default("build.summary_levels", vec![0, 1]))
            .and_then(|b| b.set_default("build.max_members", 40))
            .and_then(|b| b.set_default("build.summary_max_tokens", 1200))
            .and_then(|b| b.set_default("build.parallelism", 8))
            .and_then(|b| b.set_default("build.embed_batch", 256))
            .and_then(|b| b.set_default("query.k", 12))
            .and_then(|b| b.set_default("query.n", 30))
            .and_then(|b| b.set_default("query.alpha", 0.8))
            .and_then(|b| b.set_default("query.theta", 0.05))
            .and_then(|b| b.set_default("query.max_hops", 3))
            .and_then(|b| b.set_default("query.path_fallback_to_vector", true))
            .and_then(|b| b.set_default("query.budgets.qfs_map_tokens", 512))
            .and_then(|b| b.set_default("query.budgets.qfs_reduce_tokens", 512))
            .and_then(|b| b.set_default("query.budgets.paths_tokens", 800))
            .and_then(|b| b.set_default("query.budgets.vector_tokens", 1200))
            .and_then(|b| b.set_default("query.budgets.seed_limit", 12))
            .and_then(|b| b.set_default("query.budgets.seed_summary_tokens", 256))
            .map_err(|e| GraphRagError::ConfigInvalid(e.to_string()))?;

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(
            Environment::with_prefix("GRAPHRAG")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Self = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| GraphRagError::ConfigInvalid(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural checks beyond deserialization.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(GraphRagError::ConfigInvalid(
                "store.backend = postgres requires store.database_url".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.build.min_conf) {
            return Err(GraphRagError::ConfigInvalid("build.min_conf must be in [0, 1]".into()));
        }
        if self.build.levels == 0 {
            return Err(GraphRagError::ConfigInvalid("build.levels must be >= 1".into()));
        }
        if self.build.resolution <= 0.0 {
            return Err(GraphRagError::ConfigInvalid("build.resolution must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.query.alpha) || self.query.alpha == 0.0 {
            return Err(GraphRagError::ConfigInvalid("query.alpha must be in (0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.query.theta) {
            return Err(GraphRagError::ConfigInvalid("query.theta must be in [0, 1]".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = GraphRagConfig::default();
        cfg.validate().unwrap();
        assert!((cfg.build.min_conf - 0.35).abs() < f32::EPSILON);
        assert_eq!(cfg.build.levels, 3);
        assert_eq!(cfg.query.k, 12);
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut cfg = GraphRagConfig::default();
        cfg.store.backend = StoreBackend::Postgres;
        assert!(matches!(cfg.validate(), Err(GraphRagError::ConfigInvalid(_))));
        cfg.store.database_url = Some("postgres://localhost/graphrag".into());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_bad_alpha_rejected() {
        let mut cfg = GraphRagConfig::default();
        cfg.query.alpha = 0.0;
        assert!(cfg.validate().is_err());
        cfg.query.alpha = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_theta_rejected() {
        let mut cfg = GraphRagConfig::default();
        cfg.query.theta = 1.01;
        assert!(cfg.validate().is_err());
    }
}
