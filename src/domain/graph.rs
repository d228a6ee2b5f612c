//! Knowledge-graph domain models.
//!
//! Entity, relation, community, and summary rows. Every row carries its
//! `series` (the corpus scope key); cross-series joins are forbidden in the
//! core, so the series is part of every store query.

use serde::{Deserialize, Serialize};

// =============================================================================
// Entity
// =============================================================================

/// An entity node with its evidence trail.
///
/// `id` is deterministic (`hash(series, name, type)`, normalized), so the same
/// mention extracted twice merges into one row. Merge rules: latest name/type
/// win, the longer non-empty description wins, `conf` takes the max, `aliases`
/// and `cids` are unioned as sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    /// Deterministic identifier.
    pub id: String,
    /// Corpus scope key.
    pub series: String,
    /// Canonical surface name.
    pub name: String,
    /// Entity type label (free-form, `"concept"` when unknown).
    pub entity_type: String,
    /// Alternative surface forms collected during linking.
    pub aliases: Vec<String>,
    /// LLM-produced description, possibly empty.
    pub desc: String,
    /// Source chunk ids providing evidence.
    pub cids: Vec<String>,
    /// Maximum extraction confidence observed, in `[0, 1]`.
    pub conf: f32,
    /// Embedding over `desc` (fallback `name`), written by the indexer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evec: Option<Vec<f32>>,
}

impl EntityRow {
    /// Merge another observation of the same entity into this row.
    ///
    /// Caller guarantees `other.id == self.id`. Latest name/type overwrite,
    /// longer non-empty desc wins, conf is monotone non-decreasing, aliases
    /// and cids are set-unioned preserving first-seen order.
    pub fn merge(&mut self, other: &EntityRow) {
        self.name = other.name.clone();
        self.entity_type = other.entity_type.clone();
        if other.desc.len() > self.desc.len() {
            self.desc = other.desc.clone();
        }
        self.conf = self.conf.max(other.conf);
        for alias in &other.aliases {
            if !self.aliases.contains(alias) {
                self.aliases.push(alias.clone());
            }
        }
        for cid in &other.cids {
            if !self.cids.contains(cid) {
                self.cids.push(cid.clone());
            }
        }
    }
}

// =============================================================================
// Relation
// =============================================================================

/// A directed edge between two entities.
///
/// `id = hash(series, src_id, pred, dst_id)`; the predicate is part of the
/// identity. On merge: `cids` unioned, `conf` maxed, `pred` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRow {
    /// Deterministic identifier.
    pub id: String,
    /// Corpus scope key.
    pub series: String,
    /// Source entity id.
    pub src_id: String,
    /// Target entity id.
    pub dst_id: String,
    /// Predicate label (e.g. `ACQUIRED`).
    pub pred: String,
    /// Source chunk ids providing evidence.
    pub cids: Vec<String>,
    /// Maximum extraction confidence observed, in `[0, 1]`.
    pub conf: f32,
}

impl RelationRow {
    /// Merge another observation of the same edge into this row.
    pub fn merge(&mut self, other: &RelationRow) {
        self.conf = self.conf.max(other.conf);
        for cid in &other.cids {
            if !self.cids.contains(cid) {
                self.cids.push(cid.clone());
            }
        }
    }
}

// =============================================================================
// Community
// =============================================================================

/// A cluster of entities at a given resolution level.
///
/// `cid` is opaque and only stable within a single detection run; consumers
/// must re-wire hierarchy after every build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityRow {
    /// Opaque community id, unique within `(series, level)`.
    pub cid: String,
    /// Corpus scope key.
    pub series: String,
    /// Resolution level; higher levels are finer.
    pub level: u32,
    /// Natural-language summary, written by the summarizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Membership of an entity in a community at one level.
///
/// Invariant: an entity has exactly one membership per level it participates
/// in (community detection emits a partition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    pub entity_id: String,
    pub cid: String,
}

/// Parent edge between communities of consecutive levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentEdgeRow {
    /// Child community (level `from`).
    pub cid_lo: String,
    /// Parent community (level `to = from + 1`).
    pub cid_hi: String,
    /// Lower level.
    pub from: u32,
    /// Upper level, always `from + 1`.
    pub to: u32,
    /// Number of entities shared by both communities, at least 1.
    pub overlap: u64,
}

// =============================================================================
// Summary
// =============================================================================

/// A community summary artifact, consumed by the GraphRAG seed search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// `{cid}@L{level}` — also the id QFS partials and citations refer to.
    pub id: String,
    /// Corpus scope key.
    pub series: String,
    /// Level of the summarized community.
    pub level: u32,
    /// Community the summary belongs to.
    pub cid: String,
    /// Summary text.
    pub text: String,
    /// Approximate token count of `text`.
    pub tokens: usize,
    /// Embedding of `text`, written by the indexer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vec: Option<Vec<f32>>,
}

impl SummaryRow {
    /// Build the summary id for a community at a level.
    #[must_use]
    pub fn id_for(cid: &str, level: u32) -> String {
        format!("{cid}@L{level}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, name: &str, desc: &str, conf: f32, cids: &[&str]) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            series: "s1".to_string(),
            name: name.to_string(),
            entity_type: "Org".to_string(),
            aliases: Vec::new(),
            desc: desc.to_string(),
            cids: cids.iter().map(ToString::to_string).collect(),
            conf,
            evec: None,
        }
    }

    #[test]
    fn test_entity_merge_unions_and_maxes() {
        let mut a = entity("e1", "Acme", "short", 0.6, &["c1"]);
        let b = entity("e1", "Acme Corp", "a much longer description", 0.4, &["c1", "c2"]);
        a.merge(&b);

        assert_eq!(a.name, "Acme Corp");
        assert_eq!(a.desc, "a much longer description");
        assert!((a.conf - 0.6).abs() < f32::EPSILON);
        assert_eq!(a.cids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_entity_merge_no_duplicate_cids() {
        let mut a = entity("e1", "Acme", "", 0.9, &["c1"]);
        let b = entity("e1", "Acme", "", 0.9, &["c1"]);
        a.merge(&b);
        assert_eq!(a.cids, vec!["c1"]);
    }

    #[test]
    fn test_relation_merge() {
        let mut a = RelationRow {
            id: "r1".into(),
            series: "s1".into(),
            src_id: "e1".into(),
            dst_id: "e2".into(),
            pred: "ACQUIRED".into(),
            cids: vec!["c1".into()],
            conf: 0.5,
        };
        let b = RelationRow {
            cids: vec!["c2".into()],
            conf: 0.8,
            ..a.clone()
        };
        a.merge(&b);
        assert_eq!(a.cids, vec!["c1", "c2"]);
        assert!((a.conf - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_summary_id_format() {
        assert_eq!(SummaryRow::id_for("c0_comm17", 0), "c0_comm17@L0");
    }
}
