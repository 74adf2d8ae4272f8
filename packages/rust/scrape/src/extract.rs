//! Main-content extraction.
//!
//! Visible text blocks are located with a [`LayoutEngine`], grouped spatially,
//! and the groups carrying most of the page's text are serialized.

use std::sync::Arc;

use tracing::{debug, instrument};

use cellforge_shared::{PageMetadata, SerializedElement, SerializedNode};

use crate::cluster::{self, Block, ClusterThresholds};
use crate::dom::{Dom, DomId, DomNodeKind};
use crate::layout::{FlowLayout, Layout, LayoutEngine, Viewport};

/// Text under these tags is page chrome, not content.
const IGNORED_TAGS: &[&str] = &[
    "footer", "nav", "aside", "script", "style", "noscript", "form", "button",
];

/// Inline wrappers climbed past when looking for a text node's block.
const INLINE_TAGS: &[&str] = &[
    "a", "abbr", "span", "address", "time", "acronym", "strong", "b", "br", "sub", "sup", "tt",
    "var", "em", "i",
];

/// Containers that stop the inline climb.
const SECTIONING_TAGS: &[&str] = &["div", "section", "article", "main", "body"];

const ALLOWED_ATTRIBUTES: &[&str] = &["href", "src", "alt", "title", "class", "id"];

const MIN_TEXT_CHARS: usize = 10;
const MIN_BOX_SIDE: f64 = 4.0;

/// Serialized main content of a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub elements: Vec<SerializedElement>,
    pub metadata: PageMetadata,
    pub cluster_count: usize,
}

#[derive(Clone)]
pub struct Extractor {
    layout: Arc<dyn LayoutEngine>,
    viewport: Viewport,
    thresholds: ClusterThresholds,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(Arc::new(FlowLayout::default()))
    }
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("viewport", &self.viewport)
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}

impl Extractor {
    pub fn new(layout: Arc<dyn LayoutEngine>) -> Self {
        Self {
            layout,
            viewport: Viewport::default(),
            thresholds: ClusterThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ClusterThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = viewport;
        self
    }

    /// Extract the main content, or `None` when no cluster dominates the page.
    #[instrument(skip_all, fields(nodes = dom.len()))]
    pub fn extract(&self, dom: &Dom) -> Option<Extracted> {
        let layout = self.layout.layout(dom, self.viewport);

        let mut ancestors: Vec<DomId> = candidate_text_nodes(dom, &layout)
            .into_iter()
            .filter_map(|text| dom.parent(text))
            .map(|parent| highest_stable_ancestor(dom, parent))
            .collect();
        ancestors.sort_unstable();
        ancestors.dedup();

        let (nodes, blocks): (Vec<DomId>, Vec<Block>) = ancestors
            .into_iter()
            .filter_map(|id| {
                let rect = layout.rect(id)?;
                Some((
                    id,
                    Block {
                        rect,
                        text_len: text_weight(&dom.text_content(id)),
                    },
                ))
            })
            .unzip();

        let clusters = cluster::build_clusters(&blocks, &self.thresholds);
        let critical = cluster::critical_clusters(&clusters, self.viewport.width, &self.thresholds);
        debug!(
            blocks = blocks.len(),
            clusters = clusters.len(),
            critical = critical.len(),
            "clustered text blocks"
        );
        if critical.is_empty() {
            return None;
        }

        let mut selected: Vec<DomId> = critical
            .iter()
            .flat_map(|c| c.members.iter().map(|&m| nodes[m]))
            .collect();
        selected.sort_unstable();
        selected.dedup();

        let elements: Vec<SerializedElement> = selected
            .iter()
            .filter(|&&id| !selected.iter().any(|&other| dom.is_ancestor_of(other, id)))
            .filter_map(|&id| serialize_element(dom, id))
            .collect();
        if elements.is_empty() {
            return None;
        }

        Some(Extracted {
            elements,
            metadata: page_metadata(dom),
            cluster_count: critical.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Candidate selection
// ---------------------------------------------------------------------------

/// Text nodes worth clustering, in document order.
fn candidate_text_nodes(dom: &Dom, layout: &Layout) -> Vec<DomId> {
    let Some(body) = dom.body() else {
        return Vec::new();
    };

    dom.descendants(body)
        .into_iter()
        .filter(|&id| {
            let Some(text) = dom.text(id) else {
                return false;
            };
            if text.trim().chars().count() < MIN_TEXT_CHARS {
                return false;
            }
            let Some(parent) = dom.parent(id) else {
                return false;
            };
            if is_ignored(dom, parent)
                || dom.ancestors(parent).any(|a| is_ignored(dom, a))
                || !layout.is_visible(parent)
            {
                return false;
            }
            layout
                .rect(parent)
                .is_some_and(|r| r.width >= MIN_BOX_SIDE && r.height >= MIN_BOX_SIDE)
        })
        .collect()
}

fn is_ignored(dom: &Dom, id: DomId) -> bool {
    dom.tag(id).is_some_and(|t| IGNORED_TAGS.contains(&t))
}

/// The block-level element that owns a text node's parent.
pub(crate) fn highest_stable_ancestor(dom: &Dom, start: DomId) -> DomId {
    let tag_of = |id: DomId| dom.tag(id).unwrap_or_default();
    let mut node = start;

    while INLINE_TAGS.contains(&tag_of(node)) {
        match dom.parent(node) {
            Some(parent) if !SECTIONING_TAGS.contains(&tag_of(parent)) => node = parent,
            _ => break,
        }
    }

    while let Some(parent) = dom.parent(node) {
        if tag_of(node) == "body" || matches!(tag_of(parent), "body" | "html") {
            break;
        }
        if dom.element_children(parent).count() != 1 {
            break;
        }
        node = parent;
    }

    let rehome: &[&str] = match tag_of(node) {
        "span" | "code" | "div" => &["pre", "p"],
        "li" => &["ul", "ol"],
        "td" | "th" | "tr" => &["table"],
        _ => &[],
    };
    if !rehome.is_empty() {
        if let Some(container) = dom.closest(node, rehome) {
            node = container;
        }
    }
    node
}

/// Text length with line breaks and doubled spaces removed.
fn text_weight(text: &str) -> usize {
    text.replace('\n', "").replace("  ", "").chars().count()
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

fn serialize_element(dom: &Dom, id: DomId) -> Option<SerializedElement> {
    let mut stack = vec![(open_element(dom, id)?, dom.children(id).iter())];

    loop {
        let next = stack.last_mut()?.1.next().copied();
        let Some(child) = next else {
            let (done, _) = stack.pop()?;
            match stack.last_mut() {
                Some((parent, _)) => parent.content.push(SerializedNode::Element(done)),
                None => return Some(done),
            }
            continue;
        };

        match dom.node(child).map(|n| &n.kind) {
            Some(DomNodeKind::Text(text)) => {
                if let Some((parent, _)) = stack.last_mut() {
                    parent.content.push(SerializedNode::Text(text.clone()));
                }
            }
            Some(DomNodeKind::Element { tag, .. })
                if matches!(tag.as_str(), "script" | "style" | "noscript") => {}
            Some(DomNodeKind::Element { .. }) => {
                if let Some(element) = open_element(dom, child) {
                    stack.push((element, dom.children(child).iter()));
                }
            }
            None => {}
        }
    }
}

/// An element with its allowed attributes and no content yet.
fn open_element(dom: &Dom, id: DomId) -> Option<SerializedElement> {
    let DomNodeKind::Element { tag, attrs } = &dom.node(id)?.kind else {
        return None;
    };

    let mut element = SerializedElement::new(tag.as_str());
    for (name, value) in attrs {
        if ALLOWED_ATTRIBUTES.contains(&name.as_str()) {
            element.attributes.insert(name.clone(), value.clone());
        }
    }
    Some(element)
}

/// Metadata from the document's `<title>` and meta tags.
pub fn page_metadata(dom: &Dom) -> PageMetadata {
    let meta = |key: &str| dom.meta_content(key).map(str::to_string);

    PageMetadata {
        title: dom
            .title()
            .or_else(|| meta("og:title"))
            .unwrap_or_default(),
        site_name: meta("og:site_name"),
        author: meta("author"),
        description: meta("description").or_else(|| meta("og:description")),
        created_at: meta("article:published_time").or_else(|| meta("date")),
        updated_at: meta("article:modified_time"),
    }
}
