//! Structured Markdown for extracted page content.
//!
//! Turns serialized DOM elements into a hierarchical Markdown tree:
//! 1. Convert elements into a flat list of Markdown elements
//! 2. Merge adjacent paragraphs
//! 3. Re-split elements longer than the configured limit
//! 4. Fold the list into sections under a synthetic title header

mod chunk;
mod cleanup;
mod convert;
mod tree;
mod types;

use tracing::{debug, instrument};
use url::Url;

use cellforge_shared::SerializedElement;

pub use chunk::{chunk_elements, split_sentences};
pub use convert::{convert_elements, merge_adjacent};
pub use tree::{MarkdownTree, TreeNode, parse_markdown};
pub use types::{ElementKind, MarkdownElement, NodeId, ROOT};

/// Options for [`build_tree`].
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    /// Elements longer than this are re-split. Zero or less disables splitting.
    pub max_chars_per_element: i64,
    /// Page URL used to resolve relative links and image sources.
    pub base_url: Option<Url>,
}

/// Build the Markdown tree for one page.
#[instrument(skip_all, fields(title = %title, elements = elements.len()))]
pub fn build_tree(title: &str, elements: &[SerializedElement], opts: &TreeOptions) -> MarkdownTree {
    let flat = convert_elements(elements, opts.base_url.as_ref());
    let merged = merge_adjacent(flat);
    let chunked = chunk_elements(merged, opts.max_chars_per_element);

    debug!(markdown_elements = chunked.len(), "folding markdown tree");
    MarkdownTree::fold(title, chunked)
}
