//! Per-dataset hybrid index: embedding rows with an FTS5 mirror.
//!
//! Vector search scores every row of the dataset by cosine similarity. Text
//! search runs FTS5 `MATCH` ranked by `bm25`. [`Storage::hybrid_search`] fuses
//! both rankings with reciprocal rank fusion. Every query is scoped to a single
//! `dataset_id`.

use std::collections::HashMap;

use chrono::Utc;
use cellforge_shared::{CellforgeError, DatasetId, Result};
use libsql::params;
use tracing::{debug, instrument};

use crate::{Storage, storage_err, timestamp};

/// Reciprocal rank fusion constant.
pub const RRF_K: f64 = 60.0;

/// How many candidates each ranking contributes per requested hit.
const CANDIDATES_PER_HIT: usize = 4;
const MIN_CANDIDATES: usize = 20;

/// A chunk ready to be written to the index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub source_uri: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A row returned by a search.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub rowid: i64,
    pub text: String,
    pub source_uri: String,
    /// Cosine similarity, negated bm25, or fused RRF score. Higher is better.
    pub score: f64,
}

impl Storage {
    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert rows for `dataset_id` in a single transaction.
    pub async fn insert_embeddings(
        &self,
        dataset_id: DatasetId,
        rows: &[IndexRow],
    ) -> Result<usize> {
        self.check_writable()?;
        if rows.is_empty() {
            return Ok(0);
        }

        let now = timestamp(&Utc::now());
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        for row in rows {
            tx.execute(
                "INSERT INTO embeddings (dataset_id, source_uri, text, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    dataset_id.to_string(),
                    row.source_uri.as_str(),
                    row.text.as_str(),
                    encode_vector(&row.embedding),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(dataset_id = %dataset_id, count = rows.len(), "index rows inserted");
        Ok(rows.len())
    }

    /// Remove every row of `source_uri` within the dataset.
    pub async fn delete_source_rows(
        &self,
        dataset_id: DatasetId,
        source_uri: &str,
    ) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM embeddings WHERE dataset_id = ?1 AND source_uri = ?2",
                params![dataset_id.to_string(), source_uri],
            )
            .await
            .map_err(storage_err)
    }

    // -----------------------------------------------------------------------
    // Counts
    // -----------------------------------------------------------------------

    pub async fn count_source_rows(
        &self,
        dataset_id: DatasetId,
        source_uri: &str,
    ) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM embeddings WHERE dataset_id = ?1 AND source_uri = ?2",
            params![dataset_id.to_string(), source_uri],
        )
        .await
    }

    pub async fn count_dataset_rows(&self, dataset_id: DatasetId) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM embeddings WHERE dataset_id = ?1",
            params![dataset_id.to_string()],
        )
        .await
    }

    async fn count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<u64> {
        let mut rows = self.conn.query(sql, params).await.map_err(storage_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Rank the dataset's rows by cosine similarity to `query`.
    pub async fn vector_search(
        &self,
        dataset_id: DatasetId,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, text, source_uri, embedding FROM embeddings WHERE dataset_id = ?1",
                params![dataset_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut hits = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let embedding = decode_vector(&row.get::<Vec<u8>>(3).map_err(storage_err)?)?;
            if embedding.len() != query.len() {
                debug!(
                    expected = query.len(),
                    found = embedding.len(),
                    "dimension mismatch, skipping row"
                );
                continue;
            }
            hits.push(IndexHit {
                rowid: row.get::<i64>(0).map_err(storage_err)?,
                text: row.get::<String>(1).map_err(storage_err)?,
                source_uri: row.get::<String>(2).map_err(storage_err)?,
                score: cosine_similarity(query, &embedding),
            });
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.rowid.cmp(&b.rowid)));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Full-text search over the dataset's rows, best match first.
    pub async fn fts_search(
        &self,
        dataset_id: DatasetId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let mut rows = self
            .conn
            .query(
                "SELECT e.id, e.text, e.source_uri, bm25(embeddings_fts) AS rank
                 FROM embeddings_fts
                 JOIN embeddings e ON e.id = embeddings_fts.rowid
                 WHERE embeddings_fts MATCH ?1 AND e.dataset_id = ?2
                 ORDER BY rank
                 LIMIT ?3",
                params![match_expr, dataset_id.to_string(), limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut hits = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let rank: f64 = row.get(3).unwrap_or(0.0);
            hits.push(IndexHit {
                rowid: row.get::<i64>(0).map_err(storage_err)?,
                text: row.get::<String>(1).map_err(storage_err)?,
                source_uri: row.get::<String>(2).map_err(storage_err)?,
                score: -rank,
            });
        }
        Ok(hits)
    }

    /// Vector and text search fused with reciprocal rank fusion.
    #[instrument(skip_all, fields(dataset_id = %dataset_id, limit))]
    pub async fn hybrid_search(
        &self,
        dataset_id: DatasetId,
        query_text: &str,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<IndexHit>> {
        let candidates = (limit * CANDIDATES_PER_HIT).max(MIN_CANDIDATES);
        let by_vector = self.vector_search(dataset_id, query_vector, candidates).await?;
        let by_text = self.fts_search(dataset_id, query_text, candidates).await?;
        debug!(
            vector = by_vector.len(),
            text = by_text.len(),
            "hybrid candidates"
        );
        Ok(reciprocal_rank_fusion(&[by_vector, by_text], limit))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fuse rankings: each hit scores `1 / (k + rank)` per list it appears in,
/// with 1-based ranks.
pub(crate) fn reciprocal_rank_fusion(rankings: &[Vec<IndexHit>], limit: usize) -> Vec<IndexHit> {
    let mut fused: HashMap<i64, IndexHit> = HashMap::new();
    for ranking in rankings {
        for (position, hit) in ranking.iter().enumerate() {
            let contribution = 1.0 / (RRF_K + (position + 1) as f64);
            fused
                .entry(hit.rowid)
                .and_modify(|existing| existing.score += contribution)
                .or_insert_with(|| IndexHit {
                    score: contribution,
                    ..hit.clone()
                });
        }
    }

    let mut hits: Vec<IndexHit> = fused.into_values().collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.rowid.cmp(&b.rowid)));
    hits.truncate(limit);
    hits
}

/// Quote every word so user text never reaches the FTS5 query grammar.
fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(CellforgeError::Storage(format!(
            "embedding blob has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_storage;

    fn row(uri: &str, text: &str, embedding: [f32; 3]) -> IndexRow {
        IndexRow {
            source_uri: uri.into(),
            text: text.into(),
            embedding: embedding.to_vec(),
        }
    }

    fn hit(rowid: i64) -> IndexHit {
        IndexHit {
            rowid,
            text: format!("row {rowid}"),
            source_uri: "https://example.com".into(),
            score: 0.0,
        }
    }

    #[test]
    fn vectors_survive_encoding() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
        assert!(decode_vector(&[1, 2, 3]).is_err());
    }

    #[test]
    fn cosine_handles_zero_vectors() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn match_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("green tea: \"steep\" AND-time?").as_deref(),
            Some("\"green\" OR \"tea\" OR \"steep\" OR \"AND\" OR \"time\"")
        );
        assert_eq!(fts_match_expression("  ?! "), None);
    }

    #[test]
    fn rrf_rewards_agreement() {
        let fused = reciprocal_rank_fusion(&[vec![hit(1), hit(2)], vec![hit(2), hit(3)]], 3);
        let order: Vec<i64> = fused.iter().map(|h| h.rowid).collect();
        assert_eq!(order, vec![2, 1, 3]);
        let expected = 1.0 / (RRF_K + 2.0) + 1.0 / (RRF_K + 1.0);
        assert!((fused[0].score - expected).abs() < 1e-12);

        assert_eq!(reciprocal_rank_fusion(&[vec![hit(1), hit(2)]], 1).len(), 1);
    }

    #[tokio::test]
    async fn insert_count_and_delete_per_source() {
        let storage = test_storage().await;
        let dataset = DatasetId::new();
        let other = DatasetId::new();

        let inserted = storage
            .insert_embeddings(
                dataset,
                &[
                    row("https://a.example", "first chunk", [1.0, 0.0, 0.0]),
                    row("https://a.example", "second chunk", [0.0, 1.0, 0.0]),
                    row("https://b.example", "other source", [0.0, 0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 3);
        storage
            .insert_embeddings(other, &[row("https://a.example", "elsewhere", [1.0, 0.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(storage.count_source_rows(dataset, "https://a.example").await.unwrap(), 2);
        assert_eq!(storage.count_dataset_rows(dataset).await.unwrap(), 3);
        assert_eq!(storage.count_dataset_rows(other).await.unwrap(), 1);

        assert_eq!(storage.delete_source_rows(dataset, "https://a.example").await.unwrap(), 2);
        assert_eq!(storage.count_source_rows(dataset, "https://a.example").await.unwrap(), 0);
        assert_eq!(storage.count_source_rows(other, "https://a.example").await.unwrap(), 1);
        assert!(storage.fts_search(dataset, "first", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vector_search_ranks_by_similarity() {
        let storage = test_storage().await;
        let dataset = DatasetId::new();
        storage
            .insert_embeddings(
                dataset,
                &[
                    row("u1", "north", [0.0, 1.0, 0.0]),
                    row("u2", "east", [1.0, 0.0, 0.0]),
                    row("u3", "north east", [0.7, 0.7, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = storage.vector_search(dataset, &[1.0, 0.1, 0.0], 2).await.unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["east", "north east"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn fts_search_is_scoped_to_dataset() {
        let storage = test_storage().await;
        let dataset = DatasetId::new();
        let other = DatasetId::new();
        storage
            .insert_embeddings(
                dataset,
                &[
                    row("tea", "Green tea is steeped at low temperature", [1.0, 0.0, 0.0]),
                    row("coffee", "Espresso uses finely ground coffee", [0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        storage
            .insert_embeddings(other, &[row("tea2", "Black tea is steeped hot", [1.0, 0.0, 0.0])])
            .await
            .unwrap();

        let hits = storage.fts_search(dataset, "steeped tea", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_uri, "tea");
    }

    #[tokio::test]
    async fn hybrid_prefers_rows_found_by_both() {
        let storage = test_storage().await;
        let dataset = DatasetId::new();
        storage
            .insert_embeddings(
                dataset,
                &[
                    row("a", "Paris is the capital of France", [1.0, 0.0, 0.0]),
                    row("b", "Berlin is the capital of Germany", [0.9, 0.1, 0.0]),
                    row("c", "Bananas are rich in potassium", [0.0, 0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = storage
            .hybrid_search(dataset, "capital of France", &[1.0, 0.0, 0.0], 3)
            .await
            .unwrap();
        assert_eq!(hits[0].source_uri, "a");
        assert!(hits.len() <= 3);

        let empty = storage
            .hybrid_search(DatasetId::new(), "capital", &[1.0, 0.0, 0.0], 3)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
