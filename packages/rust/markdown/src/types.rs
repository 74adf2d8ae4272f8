//! Markdown element model.

/// Index of a node inside a [`MarkdownTree`](crate::MarkdownTree) arena.
pub type NodeId = usize;

/// The synthetic title header is always the first node of the arena.
pub const ROOT: NodeId = 0;

/// Element variants. Only the variants that need extra data carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Header { level: u8 },
    Paragraph,
    UnorderedListItem { depth: u8 },
    OrderedListItem { depth: u8 },
    BlockQuote { depth: u8 },
    CodeBlock,
    Code,
    Link { href: String },
    Image { src: String, alt: String },
    Table,
}

impl ElementKind {
    pub fn header_level(&self) -> Option<u8> {
        match self {
            Self::Header { level } => Some(*level),
            _ => None,
        }
    }

    pub fn is_header(&self) -> bool {
        matches!(self, Self::Header { .. })
    }

    pub fn is_list_item(&self) -> bool {
        matches!(
            self,
            Self::UnorderedListItem { .. } | Self::OrderedListItem { .. }
        )
    }

    /// List items and block quotes are never re-split by the chunker.
    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            Self::UnorderedListItem { .. } | Self::OrderedListItem { .. } | Self::BlockQuote { .. }
        )
    }
}

/// A single Markdown element.
///
/// `parent` is a read-only back reference into the owning tree's arena; the
/// tree owns its nodes through `children` lists. Elements that have not been
/// folded into a tree yet point at [`ROOT`].
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownElement {
    pub kind: ElementKind,
    pub content: String,
    pub parent: Option<NodeId>,
}

impl MarkdownElement {
    pub fn new(kind: ElementKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            parent: Some(ROOT),
        }
    }

    /// Same kind and parent, different content.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            kind: self.kind.clone(),
            content: content.into(),
            parent: self.parent,
        }
    }
}
