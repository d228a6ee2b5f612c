//! Multi-resolution community detection.
//!
//! Runs a deterministic, weighted modularity local-moving pass (Leiden-class)
//! over the per-series projection, once per resolution level. Level ℓ uses
//! resolution `γ_ℓ = resolution · (1 + 0.5ℓ)`, so higher levels produce finer
//! communities. Memberships are replaced per `(series, level)` on re-run;
//! community ids are opaque and only stable within a single run.

use tracing::info;

use crate::domain::graph::MembershipRow;
use crate::error::Result;
use crate::graph::projection::GraphProjection;
use crate::store::{GraphStore, LevelStats};

/// Detection parameters.
#[derive(Debug, Clone)]
pub struct CommunityDetectorConfig {
    /// Number of resolution levels to produce.
    pub levels: u32,
    /// Base resolution.
    pub resolution: f64,
    /// Maximum local-moving sweeps per level.
    pub max_iterations: usize,
    /// Minimum modularity gain to accept a move.
    pub min_improvement: f64,
}

impl Default for CommunityDetectorConfig {
    fn default() -> Self {
        Self {
            levels: 3,
            resolution: 1.2,
            max_iterations: 100,
            min_improvement: 1e-4,
        }
    }
}

/// Modularity-optimizing community detector.
#[derive(Debug, Clone)]
pub struct CommunityDetector {
    config: CommunityDetectorConfig,
}

impl CommunityDetector {
    #[must_use]
    pub fn new(config: CommunityDetectorConfig) -> Self {
        Self { config }
    }

    /// Detect communities for every level and write memberships.
    ///
    /// Re-runnable: each level's memberships replace the previous run's.
    pub async fn detect(
        &self,
        store: &dyn GraphStore,
        series: &str,
    ) -> Result<Vec<LevelStats>> {
        let (entities, relations) = store.load_graph(series).await?;
        let projection = GraphProjection::build(&entities, &relations);
        let node_ids = projection.node_ids();
        let adjacency = projection.weighted_adjacency();

        let mut stats = Vec::with_capacity(self.config.levels as usize);
        for level in 0..self.config.levels {
            let gamma = self.config.resolution * (1.0 + 0.5 * f64::from(level));
            let assignment = local_moving(
                &adjacency,
                gamma,
                self.config.max_iterations,
                self.config.min_improvement,
            );

            let labels = compact_labels(&assignment);
            let rows: Vec<MembershipRow> = node_ids
                .iter()
                .zip(&labels)
                .map(|(entity_id, &label)| MembershipRow {
                    entity_id: entity_id.clone(),
                    cid: format!("c{level}_comm{label}"),
                })
                .collect();

            let level_stats = store.replace_memberships(series, level, &rows).await?;
            info!(
                series,
                level,
                gamma,
                communities = level_stats.communities,
                memberships = level_stats.memberships,
                "community level written"
            );
            stats.push(level_stats);
        }
        Ok(stats)
    }
}

/// One pass of weighted modularity local moving.
///
/// Deterministic: nodes are visited in index order and ties break toward the
/// smallest community label. Returns a partition as a community index per
/// node (every node lands in exactly one community).
fn local_moving(
    adjacency: &[Vec<(usize, f64)>],
    gamma: f64,
    max_iterations: usize,
    min_improvement: f64,
) -> Vec<usize> {
    let n = adjacency.len();
    let mut community: Vec<usize> = (0..n).collect();
    if n == 0 {
        return community;
    }

    // Weighted degree per node and total edge weight (times two).
    let degree: Vec<f64> = adjacency.iter().map(|row| row.iter().map(|(_, w)| w).sum()).collect();
    let m2: f64 = degree.iter().sum();
    if m2 == 0.0 {
        // No edges: every node is its own community.
        return community;
    }

    let mut community_total = degree.clone();

    let mut improved = true;
    let mut iterations = 0;
    while improved && iterations < max_iterations {
        improved = false;
        iterations += 1;

        for node in 0..n {
            let current = community[node];
            community_total[current] -= degree[node];

            // Weight from `node` into each neighboring community.
            let mut weight_to: std::collections::BTreeMap<usize, f64> =
                std::collections::BTreeMap::new();
            for &(neighbor, w) in &adjacency[node] {
                *weight_to.entry(community[neighbor]).or_insert(0.0) += w;
            }

            let gain_for = |comm: usize, k_in: f64| -> f64 {
                k_in - gamma * degree[node] * community_total[comm] / m2
            };

            let stay_gain = gain_for(current, weight_to.get(&current).copied().unwrap_or(0.0));
            let mut best_comm = current;
            let mut best_gain = stay_gain;
            for (&comm, &k_in) in &weight_to {
                if comm == current {
                    continue;
                }
                let gain = gain_for(comm, k_in);
                if gain > best_gain + min_improvement {
                    best_gain = gain;
                    best_comm = comm;
                }
            }

            community_total[best_comm] += degree[node];
            if best_comm != current {
                community[node] = best_comm;
                improved = true;
            }
        }
    }
    community
}

/// Relabel community indices compactly in first-occurrence order, so labels
/// are dense and keyed by the smallest member node.
fn compact_labels(assignment: &[usize]) -> Vec<usize> {
    let mut remap = std::collections::HashMap::new();
    let mut next = 0usize;
    assignment
        .iter()
        .map(|&c| {
            *remap.entry(c).or_insert_with(|| {
                let label = next;
                next += 1;
                label
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{EntityRow, RelationRow};
    use crate::store::providers::MemoryGraphStore;

    fn entity(id: &str) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            series: "s1".to_string(),
            name: id.to_uppercase(),
            entity_type: "Org".to_string(),
            aliases: Vec::new(),
            desc: String::new(),
            cids: Vec::new(),
            conf: 0.9,
            evec: None,
        }
    }

    fn relation(src: &str, dst: &str, conf: f32) -> RelationRow {
        RelationRow {
            id: format!("{src}-{dst}"),
            series: "s1".to_string(),
            src_id: src.to_string(),
            dst_id: dst.to_string(),
            pred: "REL".to_string(),
            cids: Vec::new(),
            conf,
        }
    }

    /// Two triangles joined by a single weak bridge.
    async fn two_cluster_store() -> MemoryGraphStore {
        let store = MemoryGraphStore::new();
        let ids = ["a", "b", "c", "x", "y", "z"];
        let entities: Vec<EntityRow> = ids.iter().map(|i| entity(i)).collect();
        store.upsert_entities("s1", &entities).await.unwrap();
        let edges = vec![
            relation("a", "b", 0.9),
            relation("b", "c", 0.9),
            relation("a", "c", 0.9),
            relation("x", "y", 0.9),
            relation("y", "z", 0.9),
            relation("x", "z", 0.9),
            relation("c", "x", 0.1),
        ];
        store.upsert_relations("s1", &edges).await.unwrap();
        store
    }

    #[test]
    fn test_local_moving_empty() {
        assert!(local_moving(&[], 1.0, 100, 1e-4).is_empty());
    }

    #[test]
    fn test_local_moving_no_edges_isolates() {
        let adj = vec![Vec::new(), Vec::new(), Vec::new()];
        assert_eq!(local_moving(&adj, 1.0, 100, 1e-4), vec![0, 1, 2]);
    }

    #[test]
    fn test_local_moving_splits_two_triangles() {
        // 0-1-2 triangle, 3-4-5 triangle, weak 2-3 bridge.
        let mut adj = vec![Vec::new(); 6];
        let mut connect = |a: usize, b: usize, w: f64| {
            adj[a].push((b, w));
            adj[b].push((a, w));
        };
        connect(0, 1, 1.0);
        connect(1, 2, 1.0);
        connect(0, 2, 1.0);
        connect(3, 4, 1.0);
        connect(4, 5, 1.0);
        connect(3, 5, 1.0);
        connect(2, 3, 0.1);

        let labels = compact_labels(&local_moving(&adj, 1.0, 100, 1e-4));
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_local_moving_deterministic() {
        let adj = vec![
            vec![(1, 1.0), (2, 1.0)],
            vec![(0, 1.0), (2, 1.0)],
            vec![(0, 1.0), (1, 1.0)],
        ];
        let a = local_moving(&adj, 1.0, 100, 1e-4);
        let b = local_moving(&adj, 1.0, 100, 1e-4);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_detect_writes_every_level() {
        let store = two_cluster_store().await;
        let detector = CommunityDetector::new(CommunityDetectorConfig {
            levels: 3,
            resolution: 1.0,
            ..CommunityDetectorConfig::default()
        });

        let stats = detector.detect(&store, "s1").await.unwrap();
        assert_eq!(stats.len(), 3);
        for (level, s) in stats.iter().enumerate() {
            assert_eq!(s.level, level as u32);
            assert_eq!(s.memberships, 6);
            assert!(s.communities >= 2);
        }
    }

    #[tokio::test]
    async fn test_membership_is_partition() {
        let store = two_cluster_store().await;
        let detector = CommunityDetector::new(CommunityDetectorConfig::default());
        detector.detect(&store, "s1").await.unwrap();

        for level in 0..3 {
            let members = store.memberships("s1", level).await.unwrap();
            let mut seen = std::collections::HashSet::new();
            for m in &members {
                // Exactly one membership per entity per level.
                assert!(seen.insert(m.entity_id.clone()));
            }
            assert_eq!(seen.len(), 6);
        }
    }

    #[tokio::test]
    async fn test_single_entity_one_community_per_level() {
        let store = MemoryGraphStore::new();
        store.upsert_entities("s1", &[entity("solo")]).await.unwrap();

        let detector = CommunityDetector::new(CommunityDetectorConfig::default());
        let stats = detector.detect(&store, "s1").await.unwrap();
        for s in stats {
            assert_eq!(s.communities, 1);
            assert_eq!(s.memberships, 1);
        }
    }

    #[tokio::test]
    async fn test_rerun_replaces_memberships() {
        let store = two_cluster_store().await;
        let detector = CommunityDetector::new(CommunityDetectorConfig::default());
        detector.detect(&store, "s1").await.unwrap();
        detector.detect(&store, "s1").await.unwrap();

        let members = store.memberships("s1", 0).await.unwrap();
        assert_eq!(members.len(), 6);
    }
}
