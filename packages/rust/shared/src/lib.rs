//! Shared types, error model, and configuration for Cellforge.
//!
//! This crate is the foundation depended on by all other Cellforge crates.
//! It provides:
//! - [`CellforgeError`] — the unified error type
//! - Domain types ([`Column`], [`Cell`], [`Process`], [`SerializedElement`], ...)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, EmbeddingConfig, InferenceConfig, MAX_INFERENCE_CONCURRENCY, ScrapeConfig,
    SearchConfig, StorageConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_key,
};
pub use error::{CellforgeError, Result};
pub use types::{
    Cell, CellId, Column, ColumnId, ColumnKind, Dataset, DatasetId, Example, GenerationRequest,
    PageMetadata, Process, ProcessId, RetrievedPassage, RowValue, SerializedElement,
    SerializedNode, WebSource,
};
