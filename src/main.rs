//! GraphRAG command-line entry point.
//!
//! Seeds pre-chunked records, runs builds, and answers questions against a
//! configured store and provider. The HTTP surface lives elsewhere; this
//! binary drives the same public API.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use graph_rag::GraphRag;
use graph_rag::config::GraphRagConfig;
use graph_rag::domain::answer::QueryMode;
use graph_rag::domain::chunk::ChunkRecord;
use graph_rag::kg::build::BuildOptions;
use graph_rag::query::QueryOptions;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "GraphRAG build and query CLI", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, env = "GRAPHRAG_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load pre-chunked JSONL records into the chunk store.
    Ingest {
        /// Series the chunks belong to.
        #[arg(long)]
        series: String,
        /// JSONL file: one {"id", "text", "doc_id"?, "page"?, "order"?} per line.
        file: PathBuf,
    },
    /// Build the knowledge graph, communities, summaries and indexes.
    Build {
        #[arg(long)]
        series: String,
        /// Minimum extraction confidence override.
        #[arg(long)]
        min_conf: Option<f32>,
        /// Community levels override.
        #[arg(long)]
        levels: Option<u32>,
        /// Base resolution override.
        #[arg(long)]
        resolution: Option<f64>,
    },
    /// Ask a question.
    Query {
        #[arg(long)]
        series: String,
        question: String,
        /// auto | graph | path | vector
        #[arg(long, default_value = "auto")]
        mode: String,
        /// Top-K override.
        #[arg(long)]
        k: Option<usize>,
    },
    /// Raw vector/fulltext top-k over chunks (debug view).
    Search {
        #[arg(long)]
        series: String,
        question: String,
        #[arg(long, default_value_t = 8)]
        k: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    graph_rag::telemetry::init();

    let cli = Cli::parse();
    let config = GraphRagConfig::load(cli.config.as_deref())?;
    let service = GraphRag::from_config(config).await?;

    match cli.command {
        Command::Ingest { series, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut rows = Vec::new();
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let mut record: ChunkRecord = serde_json::from_str(line)
                    .with_context(|| format!("parsing line {}", lineno + 1))?;
                record.series = series.clone();
                rows.push(record);
            }
            let written = service.ingest_chunks(&rows).await?;
            println!("ingested {written} chunks into series '{series}'");
        }
        Command::Build {
            series,
            min_conf,
            levels,
            resolution,
        } => {
            let report = service
                .build(
                    &series,
                    &BuildOptions {
                        min_conf,
                        levels,
                        resolution,
                        summary_levels: None,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Query {
            series,
            question,
            mode,
            k,
        } => {
            let mode = QueryMode::parse(&mode)
                .with_context(|| format!("unknown mode '{mode}' (auto|graph|path|vector)"))?;
            let bundle = service
                .query(
                    &series,
                    &question,
                    &QueryOptions {
                        mode: Some(mode),
                        k,
                        ..QueryOptions::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&bundle)?);
        }
        Command::Search { series, question, k } => {
            let hits = service.search(&series, &question, k).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
    }
    Ok(())
}
