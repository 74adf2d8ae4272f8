//! Web grounding for a dataset: derive queries, search, scrape, index, and
//! retrieve.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use cellforge_scrape::Scraper;
use cellforge_shared::{AppConfig, DatasetId, Process, Result, RetrievedPassage, WebSource};

use crate::cancel::CancelSignal;
use crate::indexer::{IndexSource, Indexer};
use crate::inference::ModelClient;
use crate::prompt::{parse_search_queries, search_queries_prompt};
use crate::retriever::Retriever;
use crate::search::{SearchOutcome, WebSearch, search_queries_to_sources};

#[derive(Debug, Clone)]
pub struct SourceLimits {
    pub max_queries: usize,
    pub max_sources: usize,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SourceLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_queries: config.search.max_queries.max(1),
            max_sources: config.search.max_sources,
        }
    }
}

pub struct SourcePipeline {
    model: Arc<dyn ModelClient>,
    search: Arc<dyn WebSearch>,
    scraper: Scraper,
    indexer: Indexer,
    retriever: Retriever,
    limits: SourceLimits,
}

impl SourcePipeline {
    pub fn new(
        model: Arc<dyn ModelClient>,
        search: Arc<dyn WebSearch>,
        scraper: Scraper,
        indexer: Indexer,
        retriever: Retriever,
        limits: SourceLimits,
    ) -> Self {
        Self {
            model,
            search,
            scraper,
            indexer,
            retriever,
            limits,
        }
    }

    /// Ask the column's model for search queries matching its instruction.
    pub async fn derive_queries(&self, process: &Process, cancel: &CancelSignal) -> Result<Vec<String>> {
        let prompt = search_queries_prompt(&process.instruction, self.limits.max_queries);
        let text = self
            .model
            .complete(&process.model_id, &process.provider_id, &prompt, cancel)
            .await?;
        let queries = parse_search_queries(&text, self.limits.max_queries);
        debug!(?queries, "derived search queries");
        Ok(queries)
    }

    /// Search every query, keeping at most `max_sources` distinct hits.
    pub async fn search(&self, queries: &[String], max_sources: usize) -> SearchOutcome {
        search_queries_to_sources(self.search.as_ref(), queries, max_sources).await
    }

    /// Scrape the hits not yet indexed for the dataset. `on_page` is called
    /// once per hit as it completes; already indexed hits report `ok` without
    /// being fetched again.
    #[instrument(skip_all, fields(dataset_id = %dataset_id, sources = sources.len()))]
    pub async fn scrape(
        &self,
        dataset_id: DatasetId,
        sources: &[WebSource],
        mut on_page: impl FnMut(&str, bool),
    ) -> Result<Vec<IndexSource>> {
        let mut pending: Vec<String> = Vec::new();
        for source in sources {
            if self.indexer.is_indexed(dataset_id, &source.url).await? {
                debug!(url = %source.url, "source already indexed");
                on_page(&source.url, true);
            } else {
                pending.push(source.url.clone());
            }
        }

        let hits: HashMap<&str, &WebSource> =
            sources.iter().map(|s| (s.url.as_str(), s)).collect();
        let mut scraped = Vec::new();
        let mut pages = pin!(self.scraper.scrape_urls(pending));
        while let Some((url, page)) = pages.next().await {
            on_page(&url, page.is_some());
            let Some(page) = page else {
                continue;
            };
            let hit = hits.get(url.as_str());
            scraped.push(IndexSource {
                title: hit
                    .map(|h| h.title.clone())
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or(page.title),
                snippet: hit.map(|h| h.snippet.clone()).filter(|s| !s.is_empty()),
                url,
                tree: page.tree,
            });
        }
        Ok(scraped)
    }

    pub async fn index(&self, dataset_id: DatasetId, sources: &[IndexSource]) -> Result<usize> {
        self.indexer.index_dataset_sources(dataset_id, sources).await
    }

    /// Derive queries for the column, then search, scrape, and index. Returns
    /// the number of rows indexed.
    #[instrument(skip_all, fields(dataset_id = %dataset_id))]
    pub async fn prepare(
        &self,
        dataset_id: DatasetId,
        process: &Process,
        cancel: &CancelSignal,
    ) -> Result<usize> {
        let queries = self.derive_queries(process, cancel).await?;
        if queries.is_empty() {
            warn!("model returned no search queries");
            return Ok(0);
        }
        let outcome = self.search(&queries, self.limits.max_sources).await;
        let scraped = self.scrape(dataset_id, &outcome.sources, |_, _| {}).await?;
        let indexed = self.index(dataset_id, &scraped).await?;
        info!(
            queries = queries.len(),
            sources = outcome.sources.len(),
            indexed,
            "prepared sources"
        );
        Ok(indexed)
    }

    pub async fn retrieve(&self, dataset_id: DatasetId, query: &str) -> Result<Vec<RetrievedPassage>> {
        self.retriever.query_dataset_sources(dataset_id, query).await
    }
}
