//! Index-based DOM arena built from a parsed HTML document.
//!
//! Node ids are assigned in document (preorder) order, so comparing ids
//! compares document positions.

use std::collections::BTreeMap;

use scraper::{Html, Node};

pub type DomId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum DomNodeKind {
    Element {
        tag: String,
        attrs: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomNode {
    pub kind: DomNodeKind,
    pub parent: Option<DomId>,
    pub children: Vec<DomId>,
}

/// A rendered page's DOM, owned and detached from the parser.
#[derive(Debug, Clone, Default)]
pub struct Dom {
    nodes: Vec<DomNode>,
}

/// Elements nested deeper than this are unwrapped into the ancestor at the
/// limit, as browsers cap parser tree depth. Their text is kept.
pub const MAX_DEPTH: usize = 512;

impl Dom {
    pub fn parse(html: &str) -> Self {
        let doc = Html::parse_document(html);
        let mut dom = Self::default();

        // (node, parent id, element depth of that parent)
        let mut stack = vec![(*doc.root_element(), None, 0usize)];
        while let Some((node, parent, depth)) = stack.pop() {
            let (parent, depth) = match node.value() {
                Node::Text(text) => {
                    if parent.is_some() {
                        dom.push(DomNodeKind::Text(String::from(&**text)), parent);
                    }
                    continue;
                }
                Node::Element(element) if depth < MAX_DEPTH => {
                    let attrs = element
                        .attrs()
                        .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
                        .collect();
                    let kind = DomNodeKind::Element {
                        tag: element.name().to_ascii_lowercase(),
                        attrs,
                    };
                    (Some(dom.push(kind, parent)), depth + 1)
                }
                Node::Element(_) => (parent, depth),
                _ => continue,
            };

            // Reversed so siblings pop in document order and ids stay preorder.
            let children: Vec<_> = node.children().collect();
            stack.extend(children.into_iter().rev().map(|child| (child, parent, depth)));
        }
        dom
    }

    fn push(&mut self, kind: DomNodeKind, parent: Option<DomId>) -> DomId {
        let id = self.nodes.len();
        self.nodes.push(DomNode {
            kind,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(id);
        }
        id
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: DomId) -> Option<&DomNode> {
        self.nodes.get(id)
    }

    /// Lowercase tag name, `None` for text nodes.
    pub fn tag(&self, id: DomId) -> Option<&str> {
        match &self.nodes.get(id)?.kind {
            DomNodeKind::Element { tag, .. } => Some(tag.as_str()),
            DomNodeKind::Text(_) => None,
        }
    }

    pub fn attr(&self, id: DomId, name: &str) -> Option<&str> {
        match &self.nodes.get(id)?.kind {
            DomNodeKind::Element { attrs, .. } => attrs.get(name).map(String::as_str),
            DomNodeKind::Text(_) => None,
        }
    }

    pub fn attrs(&self, id: DomId) -> Option<&BTreeMap<String, String>> {
        match &self.nodes.get(id)?.kind {
            DomNodeKind::Element { attrs, .. } => Some(attrs),
            DomNodeKind::Text(_) => None,
        }
    }

    pub fn text(&self, id: DomId) -> Option<&str> {
        match &self.nodes.get(id)?.kind {
            DomNodeKind::Text(t) => Some(t.as_str()),
            DomNodeKind::Element { .. } => None,
        }
    }

    pub fn parent(&self, id: DomId) -> Option<DomId> {
        self.nodes.get(id)?.parent
    }

    pub fn children(&self, id: DomId) -> &[DomId] {
        self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn element_children(&self, id: DomId) -> impl Iterator<Item = DomId> + '_ {
        self.children(id)
            .iter()
            .copied()
            .filter(|&c| self.tag(c).is_some())
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(&self, id: DomId) -> impl Iterator<Item = DomId> + '_ {
        std::iter::successors(self.parent(id), move |&p| self.parent(p))
    }

    /// Nearest strict ancestor whose tag is in `tags`.
    pub fn closest(&self, id: DomId, tags: &[&str]) -> Option<DomId> {
        self.ancestors(id)
            .find(|&a| self.tag(a).is_some_and(|t| tags.contains(&t)))
    }

    pub fn is_ancestor_of(&self, ancestor: DomId, id: DomId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    /// Preorder walk of `id` and its descendants.
    pub fn descendants(&self, id: DomId) -> Vec<DomId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if current >= self.nodes.len() {
                continue;
            }
            out.push(current);
            stack.extend(self.nodes[current].children.iter().rev());
        }
        out
    }

    /// First element with the given tag, in document order.
    pub fn find_tag(&self, tag: &str) -> Option<DomId> {
        (0..self.nodes.len()).find(|&id| self.tag(id) == Some(tag))
    }

    pub fn body(&self) -> Option<DomId> {
        self.find_tag("body")
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: DomId) -> String {
        self.descendants(id)
            .into_iter()
            .filter_map(|d| self.text(d))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Document metadata
    // -----------------------------------------------------------------------

    /// Content of the first `<title>` element, trimmed.
    pub fn title(&self) -> Option<String> {
        let id = self.find_tag("title")?;
        let title = self.text_content(id).trim().to_string();
        (!title.is_empty()).then_some(title)
    }

    /// `content` of the first `<meta>` whose `name` or `property` equals `key`.
    pub fn meta_content(&self, key: &str) -> Option<&str> {
        (0..self.nodes.len())
            .filter(|&id| self.tag(id) == Some("meta"))
            .find(|&id| {
                self.attr(id, "name").is_some_and(|n| n.eq_ignore_ascii_case(key))
                    || self
                        .attr(id, "property")
                        .is_some_and(|p| p.eq_ignore_ascii_case(key))
            })
            .and_then(|id| self.attr(id, "content"))
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}
