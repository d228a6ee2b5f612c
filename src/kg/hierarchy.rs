//! Hierarchy wiring between consecutive community levels.
//!
//! A parent edge `(lo) -> (hi)` exists whenever at least one entity belongs
//! to both communities; `overlap` carries the shared-member count. Edges are
//! replaced per level pair, so re-wiring after a new detection run is safe.

use std::collections::{BTreeMap, HashMap};

use tracing::info;

use crate::domain::graph::ParentEdgeRow;
use crate::error::Result;
use crate::store::GraphStore;

/// Builds parent edges from membership overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HierarchyWirer;

impl HierarchyWirer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Wire every pair of consecutive levels in `levels` (sorted first).
    ///
    /// Returns the total number of parent edges written.
    pub async fn wire(&self, store: &dyn GraphStore, series: &str, levels: &[u32]) -> Result<u64> {
        let mut sorted: Vec<u32> = levels.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut written = 0;
        for pair in sorted.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if hi != lo + 1 {
                // Parent edges only connect consecutive levels.
                continue;
            }

            let lo_members = store.memberships(series, lo).await?;
            let hi_members: HashMap<String, String> = store
                .memberships(series, hi)
                .await?
                .into_iter()
                .map(|m| (m.entity_id, m.cid))
                .collect();

            let mut overlap: BTreeMap<(String, String), u64> = BTreeMap::new();
            for member in &lo_members {
                if let Some(hi_cid) = hi_members.get(&member.entity_id) {
                    *overlap
                        .entry((member.cid.clone(), hi_cid.clone()))
                        .or_insert(0) += 1;
                }
            }

            let rows: Vec<ParentEdgeRow> = overlap
                .into_iter()
                .map(|((cid_lo, cid_hi), count)| ParentEdgeRow {
                    cid_lo,
                    cid_hi,
                    from: lo,
                    to: hi,
                    overlap: count,
                })
                .collect();

            written += store.replace_parent_edges(series, lo, hi, &rows).await?;
            info!(series, lo, hi, edges = rows.len(), "hierarchy level pair wired");
        }
        Ok(written)
    }
}
