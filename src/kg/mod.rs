//! Knowledge-graph construction pipeline.
//!
//! Chunks flow through canonicalization, entity linking, upsert, community
//! detection, hierarchy wiring, summarization, and index sync. The
//! [`build::BuildOrchestrator`] sequences the steps; each step is
//! individually idempotent under re-run.

pub mod build;
pub mod canonicalize;
pub mod community;
pub mod hierarchy;
pub mod indexer;
pub mod linker;
pub mod summarize;
