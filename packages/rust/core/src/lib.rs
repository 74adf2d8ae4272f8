//! Cell generation pipeline for Cellforge.
//!
//! This crate ties scraping, indexing, retrieval, and model inference into
//! end-to-end workflows:
//! - [`orchestrator`] — generate a column's cells from scratch or from other columns
//! - [`sources`] — ground a dataset in web search results
//! - [`autodataset`] — design, create, and populate a dataset from one request

pub mod autodataset;
pub mod cancel;
pub mod embedding;
pub mod indexer;
pub mod inference;
pub mod orchestrator;
pub mod prompt;
pub mod retriever;
pub mod search;
pub mod sources;
pub mod store;

#[cfg(test)]
mod testing;

pub use autodataset::{
    AutoDatasetParams, AutoDatasetRunner, PipelineData, PipelineEvent, PipelineStep,
};
pub use cancel::CancelSignal;
pub use embedding::{Embedder, HttpEmbedder};
pub use indexer::{IndexSource, Indexer, IndexerConfig};
pub use inference::{CompletionDelta, ModelClient, OpenAiCompatClient};
pub use orchestrator::{ExecutorConfig, GenerationEvent, Orchestrator, RowRange, RunState};
pub use retriever::Retriever;
pub use search::{SearchOutcome, SerperSearch, WebSearch};
pub use sources::{SourceLimits, SourcePipeline};
pub use store::CellStore;
