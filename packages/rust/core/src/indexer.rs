//! Turn scraped sources into embedded index rows.
//!
//! Each source tree becomes one or more documents:
//! - a tree without subsections is one document, skipped when short;
//! - otherwise each top-level section contributes its lead text, and each
//!   subsection a document prefixed with its section heading.
//!
//! Documents are embedded in batches with bounded concurrency and written to
//! the dataset's hybrid index.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use cellforge_markdown::{MarkdownTree, ROOT};
use cellforge_shared::{AppConfig, DatasetId, Result};
use cellforge_storage::{IndexRow, Storage};

use crate::embedding::Embedder;

/// Whole-tree documents at or under this many characters are not indexed.
pub const MIN_DOCUMENT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_chunks: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for IndexerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.embedding.concurrency.max(1),
            max_chunks: config.embedding.max_chunks,
        }
    }
}

/// A scraped page ready for indexing.
#[derive(Debug, Clone)]
pub struct IndexSource {
    pub url: String,
    pub title: String,
    pub snippet: Option<String>,
    pub tree: MarkdownTree,
}

/// Documents for one source, each already carrying the metadata prefix.
pub fn build_documents(source: &IndexSource) -> Vec<String> {
    let tree = &source.tree;
    let prefix = metadata_prefix(&source.title, source.snippet.as_deref());

    let sections: Vec<usize> = tree
        .children(ROOT)
        .iter()
        .copied()
        .filter(|&id| is_header(tree, id))
        .collect();
    let has_subsections = sections
        .iter()
        .any(|&s| tree.children(s).iter().any(|&c| is_header(tree, c)));

    if !has_subsections {
        let text = tree.stringify();
        if text.chars().count() <= MIN_DOCUMENT_CHARS {
            debug!(url = %source.url, "source too short, skipping");
            return Vec::new();
        }
        return vec![format!("{prefix}{text}")];
    }

    let mut documents = Vec::new();

    // Content placed before the first section.
    let lead = tree.render_section_lead(ROOT);
    if lead.trim() != format!("# {}", tree.title()).trim() {
        documents.push(format!("{prefix}{lead}"));
    }

    for &section in &sections {
        let heading = header_line(tree, section);
        let section_lead = tree.render_section_lead(section);
        if section_lead.trim() != heading.trim() {
            documents.push(format!("{prefix}{section_lead}"));
        }
        for &sub in tree.children(section) {
            if is_header(tree, sub) {
                documents.push(format!("{prefix}{heading}\n\n{}", tree.render_subtree(sub)));
            }
        }
    }
    documents
}

fn is_header(tree: &MarkdownTree, id: usize) -> bool {
    tree.get(id).is_some_and(|n| n.element.kind.is_header())
}

fn header_line(tree: &MarkdownTree, id: usize) -> String {
    tree.render_section_lead(id)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

fn metadata_prefix(title: &str, snippet: Option<&str>) -> String {
    let mut prefix = String::new();
    if !title.trim().is_empty() {
        prefix.push_str(&format!("# {}\n", title.trim()));
    }
    if let Some(snippet) = snippet.map(str::trim).filter(|s| !s.is_empty()) {
        prefix.push_str(&format!("> {snippet}\n"));
    }
    if !prefix.is_empty() {
        prefix.push('\n');
    }
    prefix
}

/// Writes sources into a dataset's hybrid index.
#[derive(Clone)]
pub struct Indexer {
    storage: Arc<Storage>,
    embedder: Arc<dyn Embedder>,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(storage: Arc<Storage>, embedder: Arc<dyn Embedder>, config: IndexerConfig) -> Self {
        Self {
            storage,
            embedder,
            config,
        }
    }

    /// Whether `url` already has rows in the dataset.
    pub async fn is_indexed(&self, dataset_id: DatasetId, url: &str) -> Result<bool> {
        Ok(self.storage.count_source_rows(dataset_id, url).await? > 0)
    }

    /// Index sources not yet present in the dataset. Returns the number of rows
    /// written.
    #[instrument(skip_all, fields(dataset_id = %dataset_id, sources = sources.len()))]
    pub async fn index_dataset_sources(
        &self,
        dataset_id: DatasetId,
        sources: &[IndexSource],
    ) -> Result<usize> {
        let mut fresh = Vec::with_capacity(sources.len());
        for source in sources {
            if self.is_indexed(dataset_id, &source.url).await? {
                debug!(url = %source.url, "already indexed, skipping");
                continue;
            }
            fresh.push(source);
        }
        self.embed_and_store(dataset_id, &fresh).await
    }

    /// Replace a source's rows with freshly embedded ones. The previous rows
    /// are kept when nothing could be embedded.
    #[instrument(skip_all, fields(dataset_id = %dataset_id, url = %source.url))]
    pub async fn reindex_source(&self, dataset_id: DatasetId, source: &IndexSource) -> Result<usize> {
        let rows = self.embed_rows(&[source]).await;
        if rows.is_empty() {
            warn!("no rows embedded, keeping previous rows");
            return Ok(0);
        }
        let removed = self.storage.delete_source_rows(dataset_id, &source.url).await?;
        debug!(removed, "cleared previous rows");
        self.store(dataset_id, &rows).await
    }

    async fn embed_and_store(&self, dataset_id: DatasetId, sources: &[&IndexSource]) -> Result<usize> {
        let rows = self.embed_rows(sources).await;
        if rows.is_empty() {
            return Ok(0);
        }
        self.store(dataset_id, &rows).await
    }

    async fn store(&self, dataset_id: DatasetId, rows: &[IndexRow]) -> Result<usize> {
        let count = self.storage.insert_embeddings(dataset_id, rows).await?;
        info!(dataset_id = %dataset_id, count, "indexed sources");
        Ok(count)
    }

    /// Embed the sources' documents. Failed batches are dropped.
    async fn embed_rows(&self, sources: &[&IndexSource]) -> Vec<IndexRow> {
        let mut documents: Vec<(String, String)> = sources
            .iter()
            .flat_map(|source| {
                build_documents(source)
                    .into_iter()
                    .map(|text| (source.url.clone(), text))
            })
            .collect();
        if documents.len() > self.config.max_chunks {
            warn!(
                documents = documents.len(),
                max = self.config.max_chunks,
                "too many documents, truncating"
            );
            documents.truncate(self.config.max_chunks);
        }
        if documents.is_empty() {
            return Vec::new();
        }

        let batches: Vec<Vec<(String, String)>> = documents
            .chunks(self.config.batch_size.max(1))
            .map(<[_]>::to_vec)
            .collect();
        debug!(batches = batches.len(), "embedding documents");

        let embedded: Vec<Vec<IndexRow>> = stream::iter(batches)
            .map(|batch| async move {
                let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
                match self.embedder.embed(&texts).await {
                    Ok(vectors) => batch
                        .into_iter()
                        .zip(vectors)
                        .filter(|(_, vector)| !vector.is_empty())
                        .map(|((source_uri, text), embedding)| IndexRow {
                            source_uri,
                            text,
                            embedding,
                        })
                        .collect(),
                    Err(e) => {
                        warn!(error = %e, size = batch.len(), "embedding batch failed, skipping");
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        embedded.into_iter().flatten().collect()
    }
}
