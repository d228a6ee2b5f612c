//! Weighted undirected projection of a per-series subgraph.
//!
//! Built once from store rows, then shared by community detection (weights,
//! degrees) and PathRAG (bounded path enumeration). Edge weight is
//! `max(conf, 1e-3)`; direction is dropped, the projection is undirected.

use std::collections::HashMap;

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;

use crate::domain::graph::{EntityRow, RelationRow};

/// Minimum edge weight, so zero-confidence edges still connect.
const MIN_WEIGHT: f64 = 1e-3;

/// Node payload of the projection.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub id: String,
    pub name: String,
    pub conf: f32,
}

/// Edge payload of the projection.
#[derive(Debug, Clone)]
pub struct EdgeData {
    pub id: String,
    pub pred: String,
    pub conf: f32,
    pub weight: f64,
}

/// A path found between two seed nodes; nodes and edges are parallel lists
/// (`nodes.len() == edges.len() + 1`).
#[derive(Debug, Clone)]
pub struct PathRecord {
    pub node_ids: Vec<String>,
    pub node_names: Vec<String>,
    pub node_confs: Vec<f32>,
    pub edge_ids: Vec<String>,
    pub preds: Vec<String>,
    pub edge_confs: Vec<f32>,
}

impl PathRecord {
    /// Number of edges in the path.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edge_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edge_ids.is_empty()
    }
}

/// Weighted undirected projection of one series.
#[derive(Debug)]
pub struct GraphProjection {
    graph: UnGraph<NodeData, EdgeData>,
    by_id: HashMap<String, NodeIndex>,
}

impl GraphProjection {
    /// Build the projection. Entities arrive id-ordered from the store, so
    /// node indices are deterministic; relations with endpoints missing from
    /// the entity list are dropped.
    #[must_use]
    pub fn build(entities: &[EntityRow], relations: &[RelationRow]) -> Self {
        let mut graph = UnGraph::new_undirected();
        let mut by_id = HashMap::with_capacity(entities.len());

        for entity in entities {
            let idx = graph.add_node(NodeData {
                id: entity.id.clone(),
                name: entity.name.clone(),
                conf: entity.conf,
            });
            by_id.insert(entity.id.clone(), idx);
        }

        for rel in relations {
            if let (Some(&src), Some(&dst)) = (by_id.get(&rel.src_id), by_id.get(&rel.dst_id)) {
                graph.add_edge(
                    src,
                    dst,
                    EdgeData {
                        id: rel.id.clone(),
                        pred: rel.pred.clone(),
                        conf: rel.conf,
                        weight: f64::from(rel.conf).max(MIN_WEIGHT),
                    },
                );
            }
        }

        Self { graph, by_id }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Entity ids in node-index order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .map(|i| self.graph[i].id.clone())
            .collect()
    }

    /// Unweighted degree of an entity, 0 when absent.
    #[must_use]
    pub fn degree(&self, entity_id: &str) -> usize {
        self.by_id
            .get(entity_id)
            .map_or(0, |&idx| self.graph.edges(idx).count())
    }

    /// Weighted adjacency `(neighbor, weight)` per node, self-loops excluded,
    /// neighbor lists sorted by index for determinism.
    #[must_use]
    pub fn weighted_adjacency(&self) -> Vec<Vec<(usize, f64)>> {
        let mut adj = vec![Vec::new(); self.graph.node_count()];
        for edge in self.graph.edge_references() {
            let (a, b) = (edge.source().index(), edge.target().index());
            if a == b {
                continue;
            }
            let w = edge.weight().weight;
            adj[a].push((b, w));
            adj[b].push((a, w));
        }
        for row in &mut adj {
            row.sort_by(|x, y| x.0.cmp(&y.0));
        }
        adj
    }

    /// Paths between two entities with at most `max_hops` edges.
    ///
    /// Every node and edge on a returned path has `conf >= theta`; at most
    /// `cap` paths are returned, discovered in deterministic order
    /// (shorter first, then by neighbor index).
    #[must_use]
    pub fn paths_between(
        &self,
        src_id: &str,
        dst_id: &str,
        max_hops: usize,
        theta: f32,
        cap: usize,
    ) -> Vec<PathRecord> {
        let (Some(&src), Some(&dst)) = (self.by_id.get(src_id), self.by_id.get(dst_id)) else {
            return Vec::new();
        };
        if max_hops == 0 || cap == 0 || src == dst {
            return Vec::new();
        }
        if self.graph[src].conf < theta || self.graph[dst].conf < theta {
            return Vec::new();
        }

        let mut found = Vec::new();
        // Iterative deepening keeps shorter paths ahead of longer ones.
        for depth in 1..=max_hops {
            if found.len() >= cap {
                break;
            }
            let mut visited = vec![false; self.graph.node_count()];
            visited[src.index()] = true;
            let mut nodes = vec![src];
            let mut edges = Vec::new();
            self.dfs_exact(
                src, dst, depth, theta, cap, &mut visited, &mut nodes, &mut edges, &mut found,
            );
        }
        found
    }

    #[allow(clippy::too_many_arguments)]
    fn dfs_exact(
        &self,
        current: NodeIndex,
        dst: NodeIndex,
        remaining: usize,
        theta: f32,
        cap: usize,
        visited: &mut Vec<bool>,
        nodes: &mut Vec<NodeIndex>,
        edges: &mut Vec<petgraph::graph::EdgeIndex>,
        found: &mut Vec<PathRecord>,
    ) {
        if found.len() >= cap {
            return;
        }
        let mut outgoing: Vec<_> = self
            .graph
            .edges(current)
            .map(|e| {
                let other = if e.source() == current { e.target() } else { e.source() };
                (other, e.id())
            })
            .collect();
        outgoing.sort_by_key(|(n, e)| (n.index(), e.index()));

        for (next, edge_idx) in outgoing {
            if found.len() >= cap {
                return;
            }
            if self.graph[edge_idx].conf < theta || self.graph[next].conf < theta {
                continue;
            }
            if remaining == 1 {
                if next == dst {
                    nodes.push(next);
                    edges.push(edge_idx);
                    found.push(self.record(nodes, edges));
                    nodes.pop();
                    edges.pop();
                }
                continue;
            }
            if visited[next.index()] || next == dst {
                continue;
            }
            visited[next.index()] = true;
            nodes.push(next);
            edges.push(edge_idx);
            self.dfs_exact(next, dst, remaining - 1, theta, cap, visited, nodes, edges, found);
            nodes.pop();
            edges.pop();
            visited[next.index()] = false;
        }
    }

    fn record(&self, nodes: &[NodeIndex], edges: &[petgraph::graph::EdgeIndex]) -> PathRecord {
        PathRecord {
            node_ids: nodes.iter().map(|&n| self.graph[n].id.clone()).collect(),
            node_names: nodes.iter().map(|&n| self.graph[n].name.clone()).collect(),
            node_confs: nodes.iter().map(|&n| self.graph[n].conf).collect(),
            edge_ids: edges.iter().map(|&e| self.graph[e].id.clone()).collect(),
            preds: edges.iter().map(|&e| self.graph[e].pred.clone()).collect(),
            edge_confs: edges.iter().map(|&e| self.graph[e].conf).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, conf: f32) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            series: "s1".to_string(),
            name: id.to_uppercase(),
            entity_type: "Org".to_string(),
            aliases: Vec::new(),
            desc: String::new(),
            cids: Vec::new(),
            conf,
            evec: None,
        }
    }

    fn relation(src: &str, dst: &str, pred: &str, conf: f32) -> RelationRow {
        RelationRow {
            id: format!("{src}-{pred}-{dst}"),
            series: "s1".to_string(),
            src_id: src.to_string(),
            dst_id: dst.to_string(),
            pred: pred.to_string(),
            cids: Vec::new(),
            conf,
        }
    }

    fn chain() -> GraphProjection {
        // a - b - c - d plus shortcut a - d
        let entities = vec![
            entity("a", 0.9),
            entity("b", 0.8),
            entity("c", 0.7),
            entity("d", 0.9),
        ];
        let relations = vec![
            relation("a", "b", "R1", 0.8),
            relation("b", "c", "R2", 0.8),
            relation("c", "d", "R3", 0.8),
            relation("a", "d", "R4", 0.6),
        ];
        GraphProjection::build(&entities, &relations)
    }

    #[test]
    fn test_build_counts() {
        let p = chain();
        assert_eq!(p.node_count(), 4);
        assert_eq!(p.edge_count(), 4);
        assert_eq!(p.degree("a"), 2);
        assert_eq!(p.degree("b"), 2);
        assert_eq!(p.degree("missing"), 0);
    }

    #[test]
    fn test_missing_endpoints_dropped() {
        let p = GraphProjection::build(
            &[entity("a", 0.9)],
            &[relation("a", "ghost", "R", 0.5)],
        );
        assert_eq!(p.edge_count(), 0);
    }

    #[test]
    fn test_paths_shorter_first() {
        let p = chain();
        let paths = p.paths_between("a", "d", 3, 0.0, 10);
        assert_eq!(paths.len(), 2);
        // Direct edge first, then the 3-hop chain.
        assert_eq!(paths[0].len(), 1);
        assert_eq!(paths[0].preds, vec!["R4"]);
        assert_eq!(paths[1].len(), 3);
        assert_eq!(paths[1].node_ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_theta_filters_paths() {
        let p = chain();
        // theta above the shortcut's conf: only the chain survives.
        let paths = p.paths_between("a", "d", 3, 0.65, 10);
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 3);
        // theta above everything: no paths.
        assert!(p.paths_between("a", "d", 3, 1.0, 10).is_empty());
    }

    #[test]
    fn test_max_hops_bounds_length() {
        let p = chain();
        for path in p.paths_between("a", "d", 2, 0.0, 10) {
            assert!(path.len() <= 2);
        }
    }

    #[test]
    fn test_cap_limits_results() {
        let p = chain();
        let paths = p.paths_between("a", "d", 3, 0.0, 1);
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn test_undirected_traversal() {
        // Edge direction must not matter for reachability.
        let p = GraphProjection::build(
            &[entity("a", 0.9), entity("b", 0.9)],
            &[relation("b", "a", "R", 0.9)],
        );
        assert_eq!(p.paths_between("a", "b", 2, 0.0, 5).len(), 1);
    }
}
