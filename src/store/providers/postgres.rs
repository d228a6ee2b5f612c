//! Postgres + pgvector graph store.
//!
//! Upserts are `ON CONFLICT .. DO UPDATE` with the merge rules spelled out in
//! SQL (longer description wins, max conf, array set-union). Vector search
//! uses the pgvector `<=>` cosine operator.

use futures::stream::BoxStream;
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::warn;

use crate::domain::chunk::{ChunkHit, ChunkRecord};
use crate::domain::graph::{
    CommunityRow, EntityRow, MembershipRow, ParentEdgeRow, RelationRow, SummaryRow,
};
use crate::error::Result;
use crate::store::{
    GraphStore, IndexKind, LevelStats, RelationUpsertStats, UPSERT_BATCH, index_name,
    keyword_overlap,
};

const CHUNK_PAGE: i64 = 500;

/// Postgres-backed [`GraphStore`] provider.
#[derive(Debug, Clone)]
pub struct PostgresGraphStore {
    pool: PgPool,
}

impl PostgresGraphStore {
    /// Connect and run the embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| crate::error::GraphRagError::StorageUnavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Escape hatch: run a raw statement inside its own transaction.
    ///
    /// Returns the number of affected rows.
    pub async fn run_sql(&self, stmt: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let done = sqlx::query(stmt).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn kind_key(kind: IndexKind) -> &'static str {
    match kind {
        IndexKind::Chunk => "chunk",
        IndexKind::Entity => "entity",
        IndexKind::Community => "community",
    }
}

fn decode_chunk(row: &PgRow) -> Result<ChunkRecord> {
    let embedding: Option<Vector> = row.try_get("embedding")?;
    Ok(ChunkRecord {
        id: row.try_get("id")?,
        series: row.try_get("series")?,
        doc_id: row.try_get("doc_id")?,
        page: row.try_get::<Option<i32>, _>("page")?.map(|p| p as u32),
        order: row
            .try_get::<Option<i32>, _>("chunk_order")?
            .map(|o| o as u32),
        text: row.try_get("text")?,
        embedding: embedding.map(|v| v.to_vec()),
    })
}

fn decode_entity(row: &PgRow) -> Result<EntityRow> {
    let evec: Option<Vector> = row.try_get("evec")?;
    Ok(EntityRow {
        id: row.try_get("id")?,
        series: row.try_get("series")?,
        name: row.try_get("name")?,
        entity_type: row.try_get("entity_type")?,
        aliases: row.try_get("aliases")?,
        desc: row.try_get("description")?,
        cids: row.try_get("cids")?,
        conf: row.try_get("conf")?,
        evec: evec.map(|v| v.to_vec()),
    })
}

fn decode_relation(row: &PgRow) -> Result<RelationRow> {
    Ok(RelationRow {
        id: row.try_get("id")?,
        series: row.try_get("series")?,
        src_id: row.try_get("src_id")?,
        dst_id: row.try_get("dst_id")?,
        pred: row.try_get("pred")?,
        cids: row.try_get("cids")?,
        conf: row.try_get("conf")?,
    })
}

fn decode_summary(row: &PgRow) -> Result<SummaryRow> {
    let vec: Option<Vector> = row.try_get("vec")?;
    Ok(SummaryRow {
        id: row.try_get("id")?,
        series: row.try_get("series")?,
        level: row.try_get::<i32, _>("level")? as u32,
        cid: row.try_get("cid")?,
        text: row.try_get("text")?,
        tokens: row.try_get::<i64, _>("tokens")? as usize,
        vec: vec.map(|v| v.to_vec()),
    })
}

#[async_trait::async_trait]
impl GraphStore for PostgresGraphStore {
    async fn ensure_constraints(&self) -> Result<()> {
        // The migration creates everything; re-assert the unique indexes for
        // engines that predate it and ignore installation failures.
        for stmt in [
            "CREATE UNIQUE INDEX IF NOT EXISTS entities_id_unique ON entities (id)",
            "CREATE UNIQUE INDEX IF NOT EXISTS chunks_id_unique ON chunks (id)",
            "CREATE UNIQUE INDEX IF NOT EXISTS relations_id_unique ON relations (id)",
        ] {
            if let Err(err) = sqlx::query(stmt).execute(&self.pool).await {
                warn!(error = %err, stmt, "constraint install skipped");
            }
        }
        Ok(())
    }

    async fn upsert_chunks(&self, rows: &[ChunkRecord]) -> Result<u64> {
        for batch in rows.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for row in batch {
                sqlx::query(
                    r#"
                    INSERT INTO chunks (id, series, doc_id, page, chunk_order, text, embedding)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (id) DO UPDATE SET
                        text = EXCLUDED.text,
                        doc_id = EXCLUDED.doc_id,
                        page = EXCLUDED.page,
                        chunk_order = EXCLUDED.chunk_order,
                        embedding = COALESCE(EXCLUDED.embedding, chunks.embedding)
                    "#,
                )
                .bind(&row.id)
                .bind(&row.series)
                .bind(&row.doc_id)
                .bind(row.page.map(|p| p as i32))
                .bind(row.order.map(|o| o as i32))
                .bind(&row.text)
                .bind(row.embedding.clone().map(Vector::from))
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(rows.len() as u64)
    }

    fn stream_chunks(&self, series: &str) -> BoxStream<'_, Result<ChunkRecord>> {
        let pool = self.pool.clone();
        let series = series.to_string();
        Box::pin(async_stream::try_stream! {
            let mut last_id = String::new();
            loop {
                let rows = sqlx::query(
                    r#"
                    SELECT id, series, doc_id, page, chunk_order, text, embedding
                    FROM chunks
                    WHERE series = $1 AND id > $2
                    ORDER BY id
                    LIMIT $3
                    "#,
                )
                .bind(&series)
                .bind(&last_id)
                .bind(CHUNK_PAGE)
                .fetch_all(&pool)
                .await?;

                if rows.is_empty() {
                    break;
                }
                for row in &rows {
                    let chunk = decode_chunk(row)?;
                    last_id = chunk.id.clone();
                    yield chunk;
                }
            }
        })
    }

    async fn count_chunks(&self, series: &str) -> Result<u64> {
        let row = sqlx::query("SELECT count(*) AS n FROM chunks WHERE series = $1")
            .bind(series)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }

    async fn upsert_entities(&self, series: &str, rows: &[EntityRow]) -> Result<u64> {
        for batch in rows.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for row in batch {
                sqlx::query(
                    r#"
                    INSERT INTO entities (id, series, name, entity_type, aliases, description, cids, conf)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (id) DO UPDATE SET
                        name = EXCLUDED.name,
                        entity_type = EXCLUDED.entity_type,
                        description = CASE
                            WHEN length(EXCLUDED.description) > length(entities.description)
                            THEN EXCLUDED.description ELSE entities.description END,
                        conf = GREATEST(entities.conf, EXCLUDED.conf),
                        aliases = ARRAY(
                            SELECT DISTINCT x FROM unnest(entities.aliases || EXCLUDED.aliases) AS t(x)
                            ORDER BY x),
                        cids = ARRAY(
                            SELECT DISTINCT x FROM unnest(entities.cids || EXCLUDED.cids) AS t(x)
                            ORDER BY x)
                    "#,
                )
                .bind(&row.id)
                .bind(series)
                .bind(&row.name)
                .bind(&row.entity_type)
                .bind(&row.aliases)
                .bind(&row.desc)
                .bind(&row.cids)
                .bind(row.conf)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_relations(
        &self,
        series: &str,
        rows: &[RelationRow],
    ) -> Result<RelationUpsertStats> {
        let mut stats = RelationUpsertStats::default();
        for batch in rows.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for row in batch {
                let done = sqlx::query(
                    r#"
                    INSERT INTO relations (id, series, src_id, dst_id, pred, cids, conf)
                    SELECT $1, $2, $3, $4, $5, $6, $7
                    WHERE EXISTS (SELECT 1 FROM entities e WHERE e.id = $3 AND e.series = $2)
                      AND EXISTS (SELECT 1 FROM entities e WHERE e.id = $4 AND e.series = $2)
                    ON CONFLICT (id) DO UPDATE SET
                        conf = GREATEST(relations.conf, EXCLUDED.conf),
                        cids = ARRAY(
                            SELECT DISTINCT x FROM unnest(relations.cids || EXCLUDED.cids) AS t(x)
                            ORDER BY x)
                    "#,
                )
                .bind(&row.id)
                .bind(series)
                .bind(&row.src_id)
                .bind(&row.dst_id)
                .bind(&row.pred)
                .bind(&row.cids)
                .bind(row.conf)
                .execute(&mut *tx)
                .await?;

                if done.rows_affected() == 0 {
                    stats.skipped_missing_endpoint += 1;
                } else {
                    stats.written += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(stats)
    }

    async fn link_mentions(&self, series: &str, rows: &[EntityRow]) -> Result<u64> {
        let mut linked = 0;
        for batch in rows.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for row in batch {
                let done = sqlx::query(
                    r#"
                    INSERT INTO mentions (series, entity_id, chunk_id)
                    SELECT $1, $2, t.cid FROM unnest($3::text[]) AS t(cid)
                    WHERE EXISTS (SELECT 1 FROM chunks c WHERE c.id = t.cid AND c.series = $1)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(series)
                .bind(&row.id)
                .bind(&row.cids)
                .execute(&mut *tx)
                .await?;
                linked += done.rows_affected();
            }
            tx.commit().await?;
        }
        Ok(linked)
    }

    async fn load_graph(&self, series: &str) -> Result<(Vec<EntityRow>, Vec<RelationRow>)> {
        let entity_rows = sqlx::query(
            "SELECT id, series, name, entity_type, aliases, description, cids, conf, evec
             FROM entities WHERE series = $1 ORDER BY id",
        )
        .bind(series)
        .fetch_all(&self.pool)
        .await?;

        let relation_rows = sqlx::query(
            "SELECT id, series, src_id, dst_id, pred, cids, conf
             FROM relations WHERE series = $1 ORDER BY id",
        )
        .bind(series)
        .fetch_all(&self.pool)
        .await?;

        let entities = entity_rows
            .iter()
            .map(decode_entity)
            .collect::<Result<Vec<_>>>()?;
        let relations = relation_rows
            .iter()
            .map(decode_relation)
            .collect::<Result<Vec<_>>>()?;
        Ok((entities, relations))
    }

    async fn replace_memberships(
        &self,
        series: &str,
        level: u32,
        rows: &[MembershipRow],
    ) -> Result<LevelStats> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM memberships WHERE series = $1 AND level = $2")
            .bind(series)
            .bind(level as i32)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM communities WHERE series = $1 AND level = $2")
            .bind(series)
            .bind(level as i32)
            .execute(&mut *tx)
            .await?;

        let mut cids: Vec<&str> = rows.iter().map(|r| r.cid.as_str()).collect();
        cids.sort_unstable();
        cids.dedup();

        for cid in &cids {
            sqlx::query(
                "INSERT INTO communities (series, level, cid) VALUES ($1, $2, $3)
                 ON CONFLICT DO NOTHING",
            )
            .bind(series)
            .bind(level as i32)
            .bind(cid)
            .execute(&mut *tx)
            .await?;
        }
        for row in rows {
            sqlx::query(
                "INSERT INTO memberships (series, level, entity_id, cid) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (series, level, entity_id) DO UPDATE SET cid = EXCLUDED.cid",
            )
            .bind(series)
            .bind(level as i32)
            .bind(&row.entity_id)
            .bind(&row.cid)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(LevelStats {
            level,
            communities: cids.len() as u64,
            memberships: rows.len() as u64,
        })
    }

    async fn memberships(&self, series: &str, level: u32) -> Result<Vec<MembershipRow>> {
        let rows = sqlx::query(
            "SELECT entity_id, cid FROM memberships
             WHERE series = $1 AND level = $2 ORDER BY entity_id",
        )
        .bind(series)
        .bind(level as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(MembershipRow {
                    entity_id: r.try_get("entity_id")?,
                    cid: r.try_get("cid")?,
                })
            })
            .collect()
    }

    async fn communities(&self, series: &str, levels: Option<&[u32]>) -> Result<Vec<CommunityRow>> {
        let level_filter: Option<Vec<i32>> =
            levels.map(|ls| ls.iter().map(|l| *l as i32).collect());
        let rows = sqlx::query(
            "SELECT series, level, cid, summary FROM communities
             WHERE series = $1 AND ($2::int[] IS NULL OR level = ANY($2))
             ORDER BY level, cid",
        )
        .bind(series)
        .bind(level_filter)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(CommunityRow {
                    series: r.try_get("series")?,
                    level: r.try_get::<i32, _>("level")? as u32,
                    cid: r.try_get("cid")?,
                    summary: r.try_get("summary")?,
                })
            })
            .collect()
    }

    async fn replace_parent_edges(
        &self,
        series: &str,
        from: u32,
        to: u32,
        rows: &[ParentEdgeRow],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM parent_edges WHERE series = $1 AND lvl_from = $2 AND lvl_to = $3")
            .bind(series)
            .bind(from as i32)
            .bind(to as i32)
            .execute(&mut *tx)
            .await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO parent_edges (series, lvl_from, lvl_to, cid_lo, cid_hi, overlap)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (series, lvl_from, lvl_to, cid_lo, cid_hi)
                 DO UPDATE SET overlap = EXCLUDED.overlap",
            )
            .bind(series)
            .bind(from as i32)
            .bind(to as i32)
            .bind(&row.cid_lo)
            .bind(&row.cid_hi)
            .bind(row.overlap as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn parent_edges(&self, series: &str) -> Result<Vec<ParentEdgeRow>> {
        let rows = sqlx::query(
            "SELECT lvl_from, lvl_to, cid_lo, cid_hi, overlap FROM parent_edges
             WHERE series = $1 ORDER BY lvl_from, cid_lo, cid_hi",
        )
        .bind(series)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(ParentEdgeRow {
                    from: r.try_get::<i32, _>("lvl_from")? as u32,
                    to: r.try_get::<i32, _>("lvl_to")? as u32,
                    cid_lo: r.try_get("cid_lo")?,
                    cid_hi: r.try_get("cid_hi")?,
                    overlap: r.try_get::<i64, _>("overlap")? as u64,
                })
            })
            .collect()
    }

    async fn set_community_summary(
        &self,
        series: &str,
        level: u32,
        cid: &str,
        summary: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE communities SET summary = $4
             WHERE series = $1 AND level = $2 AND cid = $3",
        )
        .bind(series)
        .bind(level as i32)
        .bind(cid)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_summaries(
        &self,
        series: &str,
        level: u32,
        rows: &[SummaryRow],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM summaries WHERE series = $1 AND level = $2")
            .bind(series)
            .bind(level as i32)
            .execute(&mut *tx)
            .await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO summaries (id, series, level, cid, text, tokens, vec)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (series, id) DO UPDATE SET
                     text = EXCLUDED.text,
                     tokens = EXCLUDED.tokens,
                     vec = COALESCE(EXCLUDED.vec, summaries.vec)",
            )
            .bind(&row.id)
            .bind(series)
            .bind(level as i32)
            .bind(&row.cid)
            .bind(&row.text)
            .bind(row.tokens as i64)
            .bind(row.vec.clone().map(Vector::from))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn summaries(&self, series: &str, levels: Option<&[u32]>) -> Result<Vec<SummaryRow>> {
        let level_filter: Option<Vec<i32>> =
            levels.map(|ls| ls.iter().map(|l| *l as i32).collect());
        let rows = sqlx::query(
            "SELECT id, series, level, cid, text, tokens, vec FROM summaries
             WHERE series = $1 AND ($2::int[] IS NULL OR level = ANY($2))
             ORDER BY id",
        )
        .bind(series)
        .bind(level_filter)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_summary).collect()
    }

    async fn register_index(&self, kind: IndexKind, series: &str, dim: usize) -> Result<usize> {
        sqlx::query(
            "INSERT INTO index_meta (series, kind, index_name, dim)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (series, kind) DO NOTHING",
        )
        .bind(series)
        .bind(kind_key(kind))
        .bind(index_name(kind, series))
        .bind(dim as i32)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT dim FROM index_meta WHERE series = $1 AND kind = $2")
            .bind(series)
            .bind(kind_key(kind))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i32, _>("dim")? as usize)
    }

    async fn write_entity_vectors(
        &self,
        series: &str,
        rows: &[(String, Vec<f32>)],
    ) -> Result<u64> {
        let mut written = 0;
        for batch in rows.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for (id, vec) in batch {
                let done =
                    sqlx::query("UPDATE entities SET evec = $3 WHERE id = $1 AND series = $2")
                        .bind(id)
                        .bind(series)
                        .bind(Vector::from(vec.clone()))
                        .execute(&mut *tx)
                        .await?;
                written += done.rows_affected();
            }
            tx.commit().await?;
        }
        Ok(written)
    }

    async fn write_summary_vectors(
        &self,
        series: &str,
        rows: &[(String, Vec<f32>)],
    ) -> Result<u64> {
        let mut written = 0;
        for batch in rows.chunks(UPSERT_BATCH) {
            let mut tx = self.pool.begin().await?;
            for (id, vec) in batch {
                let done =
                    sqlx::query("UPDATE summaries SET vec = $3 WHERE id = $1 AND series = $2")
                        .bind(id)
                        .bind(series)
                        .bind(Vector::from(vec.clone()))
                        .execute(&mut *tx)
                        .await?;
                written += done.rows_affected();
            }
            tx.commit().await?;
        }
        Ok(written)
    }

    async fn entities_by_keywords(
        &self,
        series: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<EntityRow>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let patterns: Vec<String> = keywords.iter().map(|k| format!("%{k}%")).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, series, name, entity_type, aliases, description, cids, conf, evec
            FROM entities
            WHERE series = $1
              AND (name ILIKE ANY($2)
                   OR EXISTS (SELECT 1 FROM unnest(aliases) AS a WHERE a ILIKE ANY($2)))
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(series)
        .bind(&patterns)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_entity).collect()
    }

    async fn chunks_by_vector(
        &self,
        series: &str,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<ChunkHit>> {
        let rows = sqlx::query(
            r#"
            SELECT id, series, doc_id, page, chunk_order, text, embedding,
                   1 - (embedding <=> $2) AS score
            FROM chunks
            WHERE series = $1 AND embedding IS NOT NULL
            ORDER BY embedding <=> $2
            LIMIT $3
            "#,
        )
        .bind(series)
        .bind(Vector::from(query_vec.to_vec()))
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let score: f64 = row.try_get("score")?;
                Ok(ChunkHit {
                    chunk: decode_chunk(row)?,
                    score: score as f32,
                })
            })
            .collect()
    }

    async fn chunks_by_fulltext(
        &self,
        series: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ChunkHit>> {
        let patterns: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(|t| format!("%{t}%"))
            .collect();
        if patterns.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, series, doc_id, page, chunk_order, text, embedding
            FROM chunks
            WHERE series = $1 AND text ILIKE ANY($2)
            ORDER BY id
            LIMIT 400
            "#,
        )
        .bind(series)
        .bind(&patterns)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<ChunkHit> = rows
            .iter()
            .map(|row| {
                let chunk = decode_chunk(row)?;
                let score = keyword_overlap(&chunk.text, query);
                Ok(ChunkHit { chunk, score })
            })
            .collect::<Result<Vec<_>>>()?;
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.chunk.id.cmp(&b.chunk.id)));
        hits.truncate(k);
        Ok(hits)
    }
}
