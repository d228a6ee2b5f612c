//! Entity linking: deduplicate near-identical entities.
//!
//! Canonicalization misses near-synonyms, casing and accent variants. The
//! linker blocks candidates by a coarse fingerprint and asks the LLM to pick
//! a winner per block (with a NONE option), then rewrites relations through
//! the id remap. Provider failure on a block is treated as NONE.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::graph::{EntityRow, RelationRow};
use crate::error::Result;
use crate::ids::relation_id;
use crate::prompts;
use crate::provider::{ChatProvider, json};

/// Cap on aliases kept per entity.
const MAX_ALIASES: usize = 20;
/// Fingerprint length cap.
const FINGERPRINT_LEN: usize = 64;

/// Result of a linking pass.
#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub nodes: Vec<EntityRow>,
    pub edges: Vec<RelationRow>,
    pub warnings: Vec<String>,
}

/// LLM-assisted entity deduplication.
pub struct EntityLinker {
    chat: Arc<dyn ChatProvider>,
}

impl std::fmt::Debug for EntityLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLinker").finish()
    }
}

/// Blocking fingerprint: lowercased alphanumerics and spaces, tokens longer
/// than 2 characters, capped at 64 chars.
#[must_use]
pub fn fingerprint(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let joined = cleaned
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .collect::<Vec<_>>()
        .join(" ");
    joined.chars().take(FINGERPRINT_LEN).collect()
}

impl EntityLinker {
    #[must_use]
    pub fn new(chat: Arc<dyn ChatProvider>) -> Self {
        Self { chat }
    }

    /// Deduplicate `nodes` and rewrite `edges` through the resulting remap.
    ///
    /// Deterministic for fixed provider responses: groups are visited in
    /// fingerprint order, aliases and cids come back sorted.
    pub async fn run(
        &self,
        series: &str,
        nodes: Vec<EntityRow>,
        edges: Vec<RelationRow>,
    ) -> Result<LinkOutcome> {
        let mut warnings = Vec::new();

        let mut groups: BTreeMap<String, Vec<EntityRow>> = BTreeMap::new();
        for node in nodes {
            groups.entry(fingerprint(&node.name)).or_default().push(node);
        }

        let mut id_map: HashMap<String, String> = HashMap::new();
        let mut new_nodes: Vec<EntityRow> = Vec::new();

        for (fp, mut group) in groups {
            group.sort_by(|a, b| a.id.cmp(&b.id));
            if group.len() == 1 {
                let node = group.into_iter().next().expect("non-empty group");
                id_map.insert(node.id.clone(), node.id.clone());
                new_nodes.push(node);
                continue;
            }

            let winner_id = match self.choose_winner(&group).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(fingerprint = %fp, error = %err, "disambiguation failed, keeping all");
                    warnings.push(format!("entity_link: group '{fp}' kept unmerged: {err}"));
                    None
                }
            };

            match winner_id {
                Some(winner_id) => {
                    let mut canon = group
                        .iter()
                        .find(|g| g.id == winner_id)
                        .unwrap_or(&group[0])
                        .clone();
                    let canon_id = canon.id.clone();

                    let mut aliases: Vec<String> = canon.aliases.clone();
                    let mut cids: Vec<String> = canon.cids.clone();
                    for member in &group {
                        id_map.insert(member.id.clone(), canon_id.clone());
                        if member.id != canon_id {
                            aliases.push(member.name.clone());
                        }
                        cids.extend(member.cids.iter().cloned());
                    }
                    aliases.sort();
                    aliases.dedup();
                    aliases.truncate(MAX_ALIASES);
                    cids.sort();
                    cids.dedup();

                    canon.aliases = aliases;
                    canon.cids = cids;
                    debug!(winner = %canon_id, merged = group.len(), "entity group merged");
                    new_nodes.push(canon);
                }
                None => {
                    for node in group {
                        id_map.insert(node.id.clone(), node.id.clone());
                        new_nodes.push(node);
                    }
                }
            }
        }

        // Relation rewrite: remap endpoints, recompute ids, dedup with
        // union/max merge.
        let mut new_edges: HashMap<String, RelationRow> = HashMap::new();
        for edge in edges {
            let src = id_map.get(&edge.src_id).cloned().unwrap_or(edge.src_id.clone());
            let dst = id_map.get(&edge.dst_id).cloned().unwrap_or(edge.dst_id.clone());
            let id = relation_id(series, &src, &edge.pred, &dst);

            let rewritten = RelationRow {
                id: id.clone(),
                series: edge.series.clone(),
                src_id: src,
                dst_id: dst,
                pred: edge.pred.clone(),
                cids: edge.cids.clone(),
                conf: edge.conf,
            };
            match new_edges.get_mut(&id) {
                Some(existing) => existing.merge(&rewritten),
                None => {
                    new_edges.insert(id, rewritten);
                }
            }
        }
        let mut new_edges: Vec<RelationRow> = new_edges.into_values().collect();
        for edge in &mut new_edges {
            edge.cids.sort();
            edge.cids.dedup();
        }
        new_edges.sort_by(|a, b| a.id.cmp(&b.id));
        new_nodes.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(LinkOutcome {
            nodes: new_nodes,
            edges: new_edges,
            warnings,
        })
    }

    /// Multi-choice disambiguation over one fingerprint group.
    ///
    /// `Ok(None)` means NONE (no merge); that is also the interpretation of
    /// unusable output. Provider errors bubble up so the caller can record a
    /// warning (equivalent to NONE).
    async fn choose_winner(&self, group: &[EntityRow]) -> Result<Option<String>> {
        let mention = serde_json::json!({
            "name": group[0].name,
            "type": group[0].entity_type,
            "desc": truncate(&group[0].desc, 160),
        });
        let candidates: Vec<serde_json::Value> = group
            .iter()
            .map(|g| {
                serde_json::json!({
                    "id": g.id,
                    "name": g.name,
                    "type": g.entity_type,
                    "desc": truncate(&g.desc, 160),
                })
            })
            .collect();

        let prompt = prompts::render(
            prompts::EL_DISAMBIGUATE,
            &[
                ("mention", &mention.to_string()),
                ("candidates", &serde_json::Value::Array(candidates).to_string()),
            ],
        );
        let raw = self.chat.ask(&prompt).await?;

        let winner = json::parse_lenient(&raw)
            .and_then(|v| v.get("winner").and_then(|w| w.as_str().map(ToString::to_string)));
        match winner {
            Some(id) if id != "NONE" && group.iter().any(|g| g.id == id) => Ok(Some(id)),
            _ => Ok(None),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
