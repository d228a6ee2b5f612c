//! In-process graph store.
//!
//! Observable semantics match the Postgres provider; this backend drives the
//! test suites and local development without a database. State is held in
//! `BTreeMap`s so every listing comes back id-ordered for free.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::RwLock;

use crate::domain::chunk::{ChunkHit, ChunkRecord};
use crate::domain::graph::{
    CommunityRow, EntityRow, MembershipRow, ParentEdgeRow, RelationRow, SummaryRow,
};
use crate::error::Result;
use crate::store::{
    GraphStore, IndexKind, LevelStats, RelationUpsertStats, cosine, keyword_overlap,
};

#[derive(Debug, Default)]
struct SeriesData {
    chunks: BTreeMap<String, ChunkRecord>,
    entities: BTreeMap<String, EntityRow>,
    relations: BTreeMap<String, RelationRow>,
    /// level -> entity_id -> cid
    memberships: HashMap<u32, BTreeMap<String, String>>,
    /// (level, cid) -> community
    communities: BTreeMap<(u32, String), CommunityRow>,
    /// (from, to) -> edges
    parents: HashMap<(u32, u32), Vec<ParentEdgeRow>>,
    summaries: BTreeMap<String, SummaryRow>,
    mentions: BTreeSet<(String, String)>,
    index_dims: HashMap<IndexKind, usize>,
}

/// In-memory [`GraphStore`] provider.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraphStore {
    inner: Arc<RwLock<HashMap<String, SeriesData>>>,
}

impl MemoryGraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mention links recorded so far, as `(entity_id, chunk_id)` pairs.
    pub async fn mention_links(&self, series: &str) -> Vec<(String, String)> {
        let guard = self.inner.read().await;
        guard
            .get(series)
            .map(|d| d.mentions.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ensure_constraints(&self) -> Result<()> {
        // Identity maps enforce uniqueness structurally.
        Ok(())
    }

    async fn upsert_chunks(&self, rows: &[ChunkRecord]) -> Result<u64> {
        let mut guard = self.inner.write().await;
        for row in rows {
            let data = guard.entry(row.series.clone()).or_default();
            data.chunks.insert(row.id.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    fn stream_chunks(&self, series: &str) -> BoxStream<'_, Result<ChunkRecord>> {
        let inner = Arc::clone(&self.inner);
        let series = series.to_string();
        Box::pin(async_stream::try_stream! {
            let chunks: Vec<ChunkRecord> = {
                let guard = inner.read().await;
                guard
                    .get(&series)
                    .map(|d| d.chunks.values().cloned().collect())
                    .unwrap_or_default()
            };
            for chunk in chunks {
                yield chunk;
            }
        })
    }

    async fn count_chunks(&self, series: &str) -> Result<u64> {
        let guard = self.inner.read().await;
        Ok(guard.get(series).map_or(0, |d| d.chunks.len() as u64))
    }

    async fn upsert_entities(&self, series: &str, rows: &[EntityRow]) -> Result<u64> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        for row in rows {
            match data.entities.get_mut(&row.id) {
                Some(existing) => existing.merge(row),
                None => {
                    data.entities.insert(row.id.clone(), row.clone());
                }
            }
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_relations(
        &self,
        series: &str,
        rows: &[RelationRow],
    ) -> Result<RelationUpsertStats> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        let mut stats = RelationUpsertStats::default();
        for row in rows {
            if !data.entities.contains_key(&row.src_id) || !data.entities.contains_key(&row.dst_id)
            {
                stats.skipped_missing_endpoint += 1;
                continue;
            }
            match data.relations.get_mut(&row.id) {
                Some(existing) => existing.merge(row),
                None => {
                    data.relations.insert(row.id.clone(), row.clone());
                }
            }
            stats.written += 1;
        }
        Ok(stats)
    }

    async fn link_mentions(&self, series: &str, rows: &[EntityRow]) -> Result<u64> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        let mut linked = 0;
        for row in rows {
            for cid in &row.cids {
                if data.chunks.contains_key(cid)
                    && data.mentions.insert((row.id.clone(), cid.clone()))
                {
                    linked += 1;
                }
            }
        }
        Ok(linked)
    }

    async fn load_graph(&self, series: &str) -> Result<(Vec<EntityRow>, Vec<RelationRow>)> {
        let guard = self.inner.read().await;
        let Some(data) = guard.get(series) else {
            return Ok((Vec::new(), Vec::new()));
        };
        Ok((
            data.entities.values().cloned().collect(),
            data.relations.values().cloned().collect(),
        ))
    }

    async fn replace_memberships(
        &self,
        series: &str,
        level: u32,
        rows: &[MembershipRow],
    ) -> Result<LevelStats> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();

        let mut by_entity = BTreeMap::new();
        let mut cids = BTreeSet::new();
        for row in rows {
            by_entity.insert(row.entity_id.clone(), row.cid.clone());
            cids.insert(row.cid.clone());
        }

        data.communities
            .retain(|(lvl, _), _| *lvl != level);
        for cid in &cids {
            data.communities.insert(
                (level, cid.clone()),
                CommunityRow {
                    cid: cid.clone(),
                    series: series.to_string(),
                    level,
                    summary: None,
                },
            );
        }
        let memberships = by_entity.len() as u64;
        data.memberships.insert(level, by_entity);

        Ok(LevelStats {
            level,
            communities: cids.len() as u64,
            memberships,
        })
    }

    async fn memberships(&self, series: &str, level: u32) -> Result<Vec<MembershipRow>> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(series)
            .and_then(|d| d.memberships.get(&level))
            .map(|m| {
                m.iter()
                    .map(|(entity_id, cid)| MembershipRow {
                        entity_id: entity_id.clone(),
                        cid: cid.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn communities(&self, series: &str, levels: Option<&[u32]>) -> Result<Vec<CommunityRow>> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(series)
            .map(|d| {
                d.communities
                    .values()
                    .filter(|c| levels.is_none_or(|ls| ls.contains(&c.level)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn replace_parent_edges(
        &self,
        series: &str,
        from: u32,
        to: u32,
        rows: &[ParentEdgeRow],
    ) -> Result<u64> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        data.parents.insert((from, to), rows.to_vec());
        Ok(rows.len() as u64)
    }

    async fn parent_edges(&self, series: &str) -> Result<Vec<ParentEdgeRow>> {
        let guard = self.inner.read().await;
        let Some(data) = guard.get(series) else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<_> = data.parents.keys().copied().collect();
        keys.sort_unstable();
        Ok(keys
            .into_iter()
            .flat_map(|k| data.parents[&k].clone())
            .collect())
    }

    async fn set_community_summary(
        &self,
        series: &str,
        level: u32,
        cid: &str,
        summary: &str,
    ) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(community) = guard
            .get_mut(series)
            .and_then(|d| d.communities.get_mut(&(level, cid.to_string())))
        {
            community.summary = Some(summary.to_string());
        }
        Ok(())
    }

    async fn replace_summaries(
        &self,
        series: &str,
        level: u32,
        rows: &[SummaryRow],
    ) -> Result<u64> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        data.summaries.retain(|_, s| s.level != level);
        for row in rows {
            data.summaries.insert(row.id.clone(), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn summaries(&self, series: &str, levels: Option<&[u32]>) -> Result<Vec<SummaryRow>> {
        let guard = self.inner.read().await;
        Ok(guard
            .get(series)
            .map(|d| {
                d.summaries
                    .values()
                    .filter(|s| levels.is_none_or(|ls| ls.contains(&s.level)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn register_index(&self, kind: IndexKind, series: &str, dim: usize) -> Result<usize> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        Ok(*data.index_dims.entry(kind).or_insert(dim))
    }

    async fn write_entity_vectors(
        &self,
        series: &str,
        rows: &[(String, Vec<f32>)],
    ) -> Result<u64> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        let mut written = 0;
        for (id, vec) in rows {
            if let Some(entity) = data.entities.get_mut(id) {
                entity.evec = Some(vec.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn write_summary_vectors(
        &self,
        series: &str,
        rows: &[(String, Vec<f32>)],
    ) -> Result<u64> {
        let mut guard = self.inner.write().await;
        let data = guard.entry(series.to_string()).or_default();
        let mut written = 0;
        for (id, vec) in rows {
            if let Some(summary) = data.summaries.get_mut(id) {
                summary.vec = Some(vec.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn entities_by_keywords(
        &self,
        series: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<EntityRow>> {
        let guard = self.inner.read().await;
        let Some(data) = guard.get(series) else {
            return Ok(Vec::new());
        };
        let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        Ok(data
            .entities
            .values()
            .filter(|e| {
                let name = e.name.to_lowercase();
                lowered.iter().any(|kw| {
                    name.contains(kw)
                        || e.aliases.iter().any(|a| a.to_lowercase().contains(kw))
                })
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn chunks_by_vector(
        &self,
        series: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkHit>> {
        let guard = self.inner.read().await;
        let Some(data) = guard.get(series) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ChunkHit> = data
            .chunks
            .values()
            .filter_map(|c| {
                let emb = c.embedding.as_ref()?;
                Some(ChunkHit {
                    chunk: c.clone(),
                    score: cosine(query_vec, emb),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk.id.cmp(&b.chunk.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn chunks_by_fulltext(
        &self,
        series: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ChunkHit>> {
        let guard = self.inner.read().await;
        let Some(data) = guard.get(series) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<ChunkHit> = data
            .chunks
            .values()
            .map(|c| ChunkHit {
                score: keyword_overlap(&c.text, query),
                chunk: c.clone(),
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk.id.cmp(&b.chunk.id)));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            series: "s1".to_string(),
            doc_id: Some("doc1".to_string()),
            page: Some(1),
            order: Some(0),
            text: text.to_string(),
            embedding: None,
        }
    }

    fn entity(id: &str, name: &str) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            series: "s1".to_string(),
            name: name.to_string(),
            entity_type: "Org".to_string(),
            aliases: Vec::new(),
            desc: String::new(),
            cids: vec!["c1".to_string()],
            conf: 0.9,
            evec: None,
        }
    }

    fn relation(id: &str, src: &str, dst: &str) -> RelationRow {
        RelationRow {
            id: id.to_string(),
            series: "s1".to_string(),
            src_id: src.to_string(),
            dst_id: dst.to_string(),
            pred: "ACQUIRED".to_string(),
            cids: vec!["c1".to_string()],
            conf: 0.8,
        }
    }

    #[tokio::test]
    async fn test_upsert_entities_idempotent() {
        let store = MemoryGraphStore::new();
        let rows = vec![entity("e1", "Acme"), entity("e2", "Beta")];
        store.upsert_entities("s1", &rows).await.unwrap();
        store.upsert_entities("s1", &rows).await.unwrap();

        let (entities, _) = store.load_graph("s1").await.unwrap();
        assert_eq!(entities.len(), 2);
        // cids not duplicated by the replay
        assert_eq!(entities[0].cids, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_upsert_relations_skips_missing_endpoints() {
        let store = MemoryGraphStore::new();
        store.upsert_entities("s1", &[entity("e1", "Acme")]).await.unwrap();

        let stats = store
            .upsert_relations("s1", &[relation("r1", "e1", "missing")])
            .await
            .unwrap();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.skipped_missing_endpoint, 1);
    }

    #[tokio::test]
    async fn test_relations_scoped_to_series() {
        let store = MemoryGraphStore::new();
        store.upsert_entities("s1", &[entity("e1", "Acme")]).await.unwrap();
        store.upsert_entities("s2", &[entity("e2", "Beta")]).await.unwrap();

        // e2 lives in another series, so the edge must be skipped.
        let stats = store
            .upsert_relations("s1", &[relation("r1", "e1", "e2")])
            .await
            .unwrap();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.skipped_missing_endpoint, 1);
    }

    #[tokio::test]
    async fn test_link_mentions_requires_chunk() {
        let store = MemoryGraphStore::new();
        store.upsert_chunks(&[chunk("c1", "text")]).await.unwrap();
        let mut e = entity("e1", "Acme");
        e.cids = vec!["c1".to_string(), "c-unknown".to_string()];
        store.upsert_entities("s1", &[e.clone()]).await.unwrap();

        let linked = store.link_mentions("s1", &[e]).await.unwrap();
        assert_eq!(linked, 1);
        assert_eq!(
            store.mention_links("s1").await,
            vec![("e1".to_string(), "c1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_replace_memberships_reruns() {
        let store = MemoryGraphStore::new();
        let rows = vec![
            MembershipRow { entity_id: "e1".into(), cid: "a".into() },
            MembershipRow { entity_id: "e2".into(), cid: "a".into() },
        ];
        let stats = store.replace_memberships("s1", 0, &rows).await.unwrap();
        assert_eq!(stats.communities, 1);
        assert_eq!(stats.memberships, 2);

        // Re-run with a different partition replaces, never accumulates.
        let rows2 = vec![MembershipRow { entity_id: "e1".into(), cid: "b".into() }];
        let stats2 = store.replace_memberships("s1", 0, &rows2).await.unwrap();
        assert_eq!(stats2.memberships, 1);
        let communities = store.communities("s1", Some(&[0])).await.unwrap();
        assert_eq!(communities.len(), 1);
        assert_eq!(communities[0].cid, "b");
    }

    #[tokio::test]
    async fn test_register_index_fixes_dimension() {
        let store = MemoryGraphStore::new();
        assert_eq!(store.register_index(IndexKind::Entity, "s1", 384).await.unwrap(), 384);
        // Second registration with a different dim keeps the first.
        assert_eq!(store.register_index(IndexKind::Entity, "s1", 768).await.unwrap(), 384);
    }

    #[tokio::test]
    async fn test_fulltext_search_scores_overlap() {
        let store = MemoryGraphStore::new();
        store
            .upsert_chunks(&[
                chunk("c1", "numéro d'identification fiscale"),
                chunk("c2", "couleur du logo"),
            ])
            .await
            .unwrap();

        let hits = store
            .chunks_by_fulltext("s1", "numéro d'identification", 5)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk.id, "c1");
    }

    #[tokio::test]
    async fn test_stream_chunks_ordered_and_restartable() {
        use futures::TryStreamExt;

        let store = MemoryGraphStore::new();
        store
            .upsert_chunks(&[chunk("c2", "b"), chunk("c1", "a")])
            .await
            .unwrap();

        for _ in 0..2 {
            let ids: Vec<String> = store
                .stream_chunks("s1")
                .map_ok(|c| c.id)
                .try_collect()
                .await
                .unwrap();
            assert_eq!(ids, vec!["c1", "c2"]);
        }
    }
}
