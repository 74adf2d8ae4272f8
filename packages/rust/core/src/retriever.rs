//! Passage retrieval over a dataset's hybrid index.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use cellforge_shared::{DatasetId, Result, RetrievedPassage};
use cellforge_storage::Storage;

use crate::embedding::Embedder;

/// Passages returned per query.
pub const PASSAGES_PER_QUERY: usize = 3;

#[derive(Clone)]
pub struct Retriever {
    storage: Arc<Storage>,
    embedder: Arc<dyn Embedder>,
}

impl Retriever {
    pub fn new(storage: Arc<Storage>, embedder: Arc<dyn Embedder>) -> Self {
        Self { storage, embedder }
    }

    /// Top passages for `query`, fused from vector and full-text ranking.
    /// Returns nothing when the dataset has no index rows.
    #[instrument(skip_all, fields(dataset_id = %dataset_id))]
    pub async fn query_dataset_sources(
        &self,
        dataset_id: DatasetId,
        query: &str,
    ) -> Result<Vec<RetrievedPassage>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.storage.count_dataset_rows(dataset_id).await? == 0 {
            warn!("no indexed sources for dataset");
            return Ok(Vec::new());
        }

        let vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let hits = self
            .storage
            .hybrid_search(dataset_id, query, &vector, PASSAGES_PER_QUERY)
            .await?;
        debug!(count = hits.len(), "retrieved passages");

        Ok(hits
            .into_iter()
            .map(|hit| RetrievedPassage {
                text: hit.text,
                source_uri: hit.source_uri,
                score: Some(hit.score as f32),
            })
            .collect())
    }
}
