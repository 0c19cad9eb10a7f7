//! Hybrid retrieval over per-tenant knowledge: vector channel (cosine over
//! stored embeddings, via a registered scalar function) and keyword channel
//! (FTS5 bm25), fused with reciprocal-rank scoring in a single SQL query.
//!
//! The dual-gate filter is the load-bearing invariant: a chunk is emitted
//! when it is strong in *either* channel, not by aggregate score alone, so a
//! single exact keyword hit cannot be drowned out by chunks that are
//! mediocre everywhere.

use std::sync::{Arc, Mutex};

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tracing::{debug, info};

use funnel_core::config::RetrievalConfig;

use crate::embed::{blob_to_vector, vector_to_blob, EmbeddingClient};
use crate::{Result, RetrievalError};

/// Conventional RRF smoothing constant.
pub const RRF_K: f64 = 60.0;

/// Which gate admitted a chunk. Semantic is preferred when both hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Semantic,
    Keyword,
}

impl MatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub vec_sim: Option<f64>,
    pub vec_rank: Option<i64>,
    pub key_rank: Option<i64>,
    pub rrf_score: f64,
    pub reason: MatchReason,
}

/// SQLite-backed knowledge index. Thread-safe via an internal mutex, in the
/// same shape as the other store types in this workspace.
pub struct KnowledgeStore {
    db: Mutex<Connection>,
}

impl KnowledgeStore {
    pub fn open(path: &str) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        register_vector_distance(&conn)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Insert a chunk and sync the FTS index. The embedding must already be
    /// normalized/truncated (see `embed::normalize_and_truncate`).
    pub fn insert_item(
        &self,
        tenant_id: i64,
        title: &str,
        content: &str,
        embedding: &[f32],
    ) -> Result<i64> {
        let db = self.db.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        db.execute(
            "INSERT INTO knowledge_items (tenant_id, title, content, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![tenant_id, title, content, vector_to_blob(embedding), now],
        )?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO knowledge_fts(rowid, title, content) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, title, content],
        )?;
        Ok(id)
    }

    /// Remove a chunk (used when its parent document is deleted).
    pub fn delete_item(&self, id: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let row: Option<(String, String)> = db
            .query_row(
                "SELECT title, content FROM knowledge_items WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        if let Some((title, content)) = row {
            db.execute(
                "INSERT INTO knowledge_fts(knowledge_fts, rowid, title, content)
                 VALUES ('delete', ?1, ?2, ?3)",
                rusqlite::params![id, title, content],
            )?;
            db.execute("DELETE FROM knowledge_items WHERE id = ?1", [id])?;
        }
        Ok(())
    }

    /// One hybrid query: vector top-k and keyword top-k, full-outer-joined,
    /// RRF-scored, dual-gate filtered, ordered by fused score.
    pub fn hybrid_search(
        &self,
        tenant_id: i64,
        query_vector: &[f32],
        query_text: &str,
        cfg: &RetrievalConfig,
    ) -> Result<Vec<RetrievedChunk>> {
        let match_expr = fts_match_expression(query_text);
        let db = self.db.lock().unwrap();

        let rows: Vec<RawRow> = if match_expr.is_empty() {
            // Nothing tokenizable for the keyword channel (all punctuation,
            // emoji-only bursts): vector channel alone.
            let mut stmt = db.prepare_cached(VECTOR_ONLY_SQL)?;
            let mapped = stmt.query_map(
                rusqlite::params![
                    tenant_id,
                    cfg.top_k,
                    vector_to_blob(query_vector),
                    cfg.vector_threshold,
                ],
                raw_row,
            )?;
            mapped.collect::<rusqlite::Result<_>>()?
        } else {
            let mut stmt = db.prepare_cached(HYBRID_SQL)?;
            let mapped = stmt.query_map(
                rusqlite::params![
                    tenant_id,
                    cfg.top_k,
                    vector_to_blob(query_vector),
                    match_expr,
                    cfg.vector_threshold,
                    cfg.keyword_rank_threshold,
                ],
                raw_row,
            )?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let chunks: Vec<RetrievedChunk> = rows
            .into_iter()
            .map(|r| {
                let semantic = r.vec_sim.map(|s| s > cfg.vector_threshold).unwrap_or(false);
                RetrievedChunk {
                    id: r.id,
                    title: r.title,
                    content: r.content,
                    vec_sim: r.vec_sim,
                    vec_rank: r.vec_rank,
                    key_rank: r.key_rank,
                    rrf_score: r.rrf_score,
                    reason: if semantic {
                        MatchReason::Semantic
                    } else {
                        MatchReason::Keyword
                    },
                }
            })
            .collect();

        debug!(
            tenant_id,
            results = chunks.len(),
            "hybrid search complete"
        );
        Ok(chunks)
    }
}

/// Retrieval front door used by the pipeline: embed, then hybrid-search.
pub struct RetrievalEngine {
    store: Arc<KnowledgeStore>,
    embedder: EmbeddingClient,
    cfg: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<KnowledgeStore>, embedder: EmbeddingClient, cfg: RetrievalConfig) -> Self {
        Self {
            store,
            embedder,
            cfg,
        }
    }

    pub async fn search(&self, tenant_id: i64, query: &str) -> Result<Vec<RetrievedChunk>> {
        let vector = self.embedder.embed(query).await?;
        let chunks = self
            .store
            .hybrid_search(tenant_id, &vector, query, &self.cfg)?;
        info!(
            tenant_id,
            results = chunks.len(),
            "knowledge retrieval complete"
        );
        Ok(chunks)
    }
}

// Vector top-k and keyword top-k are ranked independently; the fused score
// is 1/(60+vec_rank) + 1/(60+key_rank) with a missing rank contributing 0.
// The WHERE clause is the dual gate.
const HYBRID_SQL: &str = "
WITH vec_results AS (
    SELECT id, title, content,
           1.0 - vec_distance(embedding, ?3) AS vec_sim,
           ROW_NUMBER() OVER (ORDER BY vec_distance(embedding, ?3)) AS vec_rank
    FROM knowledge_items
    WHERE tenant_id = ?1
    ORDER BY vec_rank
    LIMIT ?2
),
keyword_results AS (
    SELECT id, title, content,
           ROW_NUMBER() OVER (ORDER BY score) AS key_rank
    FROM (
        SELECT ki.id AS id, ki.title AS title, ki.content AS content,
               bm25(knowledge_fts) AS score
        FROM knowledge_fts
        JOIN knowledge_items ki ON ki.id = knowledge_fts.rowid
        WHERE knowledge_fts MATCH ?4 AND ki.tenant_id = ?1
        ORDER BY score
        LIMIT ?2
    )
)
SELECT COALESCE(v.id, k.id) AS id,
       COALESCE(v.title, k.title) AS title,
       COALESCE(v.content, k.content) AS content,
       v.vec_sim AS vec_sim,
       v.vec_rank AS vec_rank,
       k.key_rank AS key_rank,
       COALESCE(1.0 / (60.0 + v.vec_rank), 0.0)
         + COALESCE(1.0 / (60.0 + k.key_rank), 0.0) AS rrf_score
FROM vec_results v
FULL OUTER JOIN keyword_results k ON k.id = v.id
WHERE COALESCE(v.vec_sim, 0.0) > ?5
   OR COALESCE(k.key_rank, ?6 + 1) <= ?6
ORDER BY rrf_score DESC";

const VECTOR_ONLY_SQL: &str = "
WITH vec_results AS (
    SELECT id, title, content,
           1.0 - vec_distance(embedding, ?3) AS vec_sim,
           ROW_NUMBER() OVER (ORDER BY vec_distance(embedding, ?3)) AS vec_rank
    FROM knowledge_items
    WHERE tenant_id = ?1
    ORDER BY vec_rank
    LIMIT ?2
)
SELECT id, title, content, vec_sim, vec_rank,
       NULL AS key_rank,
       1.0 / (60.0 + vec_rank) AS rrf_score
FROM vec_results
WHERE vec_sim > ?4
ORDER BY rrf_score DESC";

struct RawRow {
    id: i64,
    title: String,
    content: String,
    vec_sim: Option<f64>,
    vec_rank: Option<i64>,
    key_rank: Option<i64>,
    rrf_score: f64,
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        vec_sim: row.get(3)?,
        vec_rank: row.get(4)?,
        key_rank: row.get(5)?,
        rrf_score: row.get(6)?,
    })
}

/// Cosine distance over two BLOB-packed f32 vectors. Stored vectors are
/// unit-length, so distance = 1 - dot product.
fn register_vector_distance(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "vec_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a = ctx.get_raw(0).as_blob().map_err(|e| {
                rusqlite::Error::UserFunctionError(Box::new(e))
            })?;
            let b = ctx.get_raw(1).as_blob().map_err(|e| {
                rusqlite::Error::UserFunctionError(Box::new(e))
            })?;
            let va = blob_to_vector(a);
            let vb = blob_to_vector(b);
            let dot: f32 = va.iter().zip(vb.iter()).map(|(x, y)| x * y).sum();
            Ok(1.0 - dot as f64)
        },
    )
    .map_err(RetrievalError::Database)
}

fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge_items (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id   INTEGER NOT NULL,
            title       TEXT NOT NULL,
            content     TEXT NOT NULL,
            embedding   BLOB NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_knowledge_tenant
            ON knowledge_items(tenant_id);
        CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts
            USING fts5(title, content, content='knowledge_items', content_rowid='id');",
    )?;
    Ok(())
}

/// Build a websearch-style FTS5 match expression: each token quoted, joined
/// with implicit AND. Quoting keeps user punctuation from being parsed as
/// FTS5 syntax.
fn fts_match_expression(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[hot] = 1.0;
        v
    }

    /// Blend of two axes, normalized.
    fn blend(dim: usize, a: usize, b: usize, wa: f32, wb: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[a] = wa;
        v[b] = wb;
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    fn store_with_items() -> KnowledgeStore {
        let store = KnowledgeStore::open_in_memory().unwrap();
        // Axis 0: pricing-ish. Axis 1: shipping-ish. Axis 2: unrelated.
        store
            .insert_item(1, "Pricing", "Our premium plan costs 49 euros monthly", &unit(8, 0))
            .unwrap();
        store
            .insert_item(1, "Shipping", "Delivery time is three business days", &unit(8, 1))
            .unwrap();
        store
            .insert_item(
                1,
                "Mediocre",
                "General terms and conditions apply to everything",
                &blend(8, 0, 2, 0.5, 0.87),
            )
            .unwrap();
        store
            .insert_item(2, "Other tenant pricing", "premium plan costs 99", &unit(8, 0))
            .unwrap();
        store
    }

    #[test]
    fn semantic_gate_admits_strong_vector_match() {
        let store = store_with_items();
        let cfg = RetrievalConfig::default();
        let results = store
            .hybrid_search(1, &unit(8, 0), "what does it cost", &cfg)
            .unwrap();
        assert!(results.iter().any(|c| c.title == "Pricing"));
        let pricing = results.iter().find(|c| c.title == "Pricing").unwrap();
        assert_eq!(pricing.reason, MatchReason::Semantic);
        assert!(pricing.vec_sim.unwrap() > cfg.vector_threshold);
    }

    #[test]
    fn keyword_gate_admits_lexical_match_with_weak_vector() {
        let store = store_with_items();
        let cfg = RetrievalConfig::default();
        // Query vector points at axis 3: no item is semantically close, but
        // "delivery" is an exact keyword hit.
        let results = store
            .hybrid_search(1, &unit(8, 3), "delivery time", &cfg)
            .unwrap();
        let shipping = results.iter().find(|c| c.title == "Shipping").unwrap();
        assert_eq!(shipping.reason, MatchReason::Keyword);
        assert!(shipping.key_rank.unwrap() <= cfg.keyword_rank_threshold as i64);
    }

    #[test]
    fn dual_gate_excludes_mediocre_in_both_channels() {
        let store = store_with_items();
        let cfg = RetrievalConfig::default();
        // "Mediocre" has vec_sim = 0.5 against axis 0 (below 0.65) and no
        // keyword overlap with the query.
        let results = store
            .hybrid_search(1, &unit(8, 0), "premium plan price", &cfg)
            .unwrap();
        assert!(results.iter().all(|c| c.title != "Mediocre"));
    }

    #[test]
    fn rrf_score_matches_formula_for_dual_channel_hit() {
        let store = store_with_items();
        let cfg = RetrievalConfig::default();
        // "Pricing" is rank 1 in the vector channel and a keyword hit for
        // "premium"; verify rrf = 1/(60+rv) + 1/(60+rk).
        let results = store
            .hybrid_search(1, &unit(8, 0), "premium plan", &cfg)
            .unwrap();
        let pricing = results.iter().find(|c| c.title == "Pricing").unwrap();
        let rv = pricing.vec_rank.unwrap() as f64;
        let rk = pricing.key_rank.unwrap() as f64;
        let expected = 1.0 / (RRF_K + rv) + 1.0 / (RRF_K + rk);
        assert!((pricing.rrf_score - expected).abs() < 1e-9);
    }

    #[test]
    fn missing_vector_rank_contributes_zero() {
        let store = KnowledgeStore::open_in_memory().unwrap();
        // Five fillers closer to the query axis than the keyword item, so the
        // keyword item falls outside the vector top-5 entirely.
        for i in 0..5 {
            store
                .insert_item(1, &format!("Filler {i}"), "nothing relevant here", &blend(8, 3, 4, 0.2, 0.98))
                .unwrap();
        }
        store
            .insert_item(1, "Refunds", "Refund requests are handled within a week", &unit(8, 6))
            .unwrap();

        let cfg = RetrievalConfig::default();
        let results = store.hybrid_search(1, &unit(8, 3), "refund", &cfg).unwrap();
        let refunds = results.iter().find(|c| c.title == "Refunds").unwrap();
        assert!(refunds.vec_rank.is_none());
        let rk = refunds.key_rank.unwrap() as f64;
        assert!((refunds.rrf_score - 1.0 / (RRF_K + rk)).abs() < 1e-9);
    }

    #[test]
    fn results_are_tenant_scoped() {
        let store = store_with_items();
        let cfg = RetrievalConfig::default();
        let results = store
            .hybrid_search(1, &unit(8, 0), "premium plan", &cfg)
            .unwrap();
        assert!(results.iter().all(|c| c.title != "Other tenant pricing"));
    }

    #[test]
    fn punctuation_only_query_falls_back_to_vector_channel() {
        let store = store_with_items();
        let cfg = RetrievalConfig::default();
        let results = store.hybrid_search(1, &unit(8, 0), "???!!!", &cfg).unwrap();
        assert!(results.iter().any(|c| c.title == "Pricing"));
    }

    #[test]
    fn delete_item_removes_from_both_channels() {
        let store = store_with_items();
        let cfg = RetrievalConfig::default();
        let results = store
            .hybrid_search(1, &unit(8, 1), "delivery", &cfg)
            .unwrap();
        let id = results.iter().find(|c| c.title == "Shipping").unwrap().id;
        store.delete_item(id).unwrap();
        let results = store
            .hybrid_search(1, &unit(8, 1), "delivery", &cfg)
            .unwrap();
        assert!(results.iter().all(|c| c.id != id));
    }

    #[test]
    fn match_expression_quotes_tokens() {
        assert_eq!(
            fts_match_expression("what's the price?"),
            "\"what\" \"s\" \"the\" \"price\""
        );
        assert_eq!(fts_match_expression("!!!"), "");
    }
}
