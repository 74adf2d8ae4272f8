//! Hierarchical Markdown tree: folding, rendering, and reading back.
//!
//! Nodes live in a flat arena owned by [`MarkdownTree`]. Each node keeps a
//! list of child indices and each element a `parent` index, so the tree can
//! be walked in both directions without shared ownership.

use std::sync::LazyLock;

use regex::Regex;

use crate::cleanup;
use crate::types::{ElementKind, MarkdownElement, NodeId, ROOT};

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub element: MarkdownElement,
    pub children: Vec<NodeId>,
}

/// A page rendered as nested sections under a synthetic title header.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkdownTree {
    nodes: Vec<TreeNode>,
}

impl MarkdownTree {
    /// A tree holding only the level-1 title header.
    pub fn new(title: impl Into<String>) -> Self {
        let root = MarkdownElement {
            kind: ElementKind::Header { level: 1 },
            content: title.into(),
            parent: None,
        };
        Self {
            nodes: vec![TreeNode {
                element: root,
                children: Vec::new(),
            }],
        }
    }

    /// Fold a flat element sequence into sections.
    ///
    /// Headers close every open section at the same or a deeper level and open
    /// a new one; other elements attach to the innermost open section.
    pub fn fold(title: impl Into<String>, elements: impl IntoIterator<Item = MarkdownElement>) -> Self {
        let mut tree = Self::new(title);
        let mut current = ROOT;

        for element in elements {
            match element.kind.header_level() {
                Some(level) => {
                    while current != ROOT && tree.level_of(current) >= level {
                        current = tree.parent(current).unwrap_or(ROOT);
                    }
                    current = tree.attach(current, element);
                }
                None => {
                    tree.attach(current, element);
                }
            }
        }
        tree
    }

    /// Append `element` as the last child of `parent` and return its id.
    pub fn attach(&mut self, parent: NodeId, mut element: MarkdownElement) -> NodeId {
        element.parent = Some(parent);
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            element,
            children: Vec::new(),
        });
        self.nodes[parent].children.push(id);
        id
    }

    pub fn title(&self) -> &str {
        &self.nodes[ROOT].element.content
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[ROOT]
    }

    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    /// Children of `id`, empty for unknown ids.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.element.parent)
    }

    /// Number of nodes, including the title.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether anything besides the title was extracted.
    pub fn has_content(&self) -> bool {
        self.nodes.len() > 1
    }

    fn level_of(&self, id: NodeId) -> u8 {
        self.nodes[id].element.kind.header_level().unwrap_or(1)
    }

    /// Preorder walk starting at the root, root included.
    pub fn flatten(&self) -> Vec<&MarkdownElement> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            out.push(&node.element);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Render the whole tree as a Markdown document.
    pub fn stringify(&self) -> String {
        self.render_subtree(ROOT)
    }

    /// Render one node and all of its descendants.
    pub fn render_subtree(&self, id: NodeId) -> String {
        if id >= self.nodes.len() {
            return String::new();
        }
        let mut out = String::new();
        self.render_node(id, &mut out);
        cleanup::tidy(&out)
    }

    /// Render a node followed by its non-header children, leaving nested
    /// sections out.
    pub fn render_section_lead(&self, id: NodeId) -> String {
        let Some(node) = self.nodes.get(id) else {
            return String::new();
        };
        let mut out = String::new();
        render_element(&node.element, &mut out);
        for &child in &node.children {
            if !self.nodes[child].element.kind.is_header() {
                self.render_node(child, &mut out);
            }
        }
        cleanup::tidy(&out)
    }

    fn render_node(&self, id: NodeId, out: &mut String) {
        let node = &self.nodes[id];
        render_element(&node.element, out);
        for &child in &node.children {
            self.render_node(child, out);
        }
    }
}

fn render_element(element: &MarkdownElement, out: &mut String) {
    let content = element.content.as_str();

    if !element.kind.is_list_item() && !out.is_empty() && !out.ends_with("\n\n") {
        out.push('\n');
    }

    match &element.kind {
        ElementKind::Header { level } => {
            out.push_str(&"#".repeat(usize::from(*level)));
            out.push(' ');
            out.push_str(content);
            out.push_str("\n\n");
        }
        ElementKind::Paragraph | ElementKind::Table => {
            out.push_str(content);
            out.push_str("\n\n");
        }
        ElementKind::UnorderedListItem { depth } | ElementKind::OrderedListItem { depth } => {
            let marker = if matches!(element.kind, ElementKind::OrderedListItem { .. }) {
                "1. "
            } else {
                "- "
            };
            out.push_str(&"  ".repeat(usize::from(depth.saturating_sub(1))));
            out.push_str(marker);
            out.push_str(content);
            out.push('\n');
        }
        ElementKind::BlockQuote { depth } => {
            let prefix = "> ".repeat(usize::from((*depth).max(1)));
            for line in content.lines() {
                out.push_str(&prefix);
                out.push_str(line);
                out.push('\n');
            }
            out.push('\n');
        }
        ElementKind::CodeBlock => {
            out.push_str("```\n");
            out.push_str(content);
            out.push_str("\n```\n\n");
        }
        ElementKind::Code => {
            out.push('`');
            out.push_str(content);
            out.push_str("`\n\n");
        }
        ElementKind::Link { href } => {
            out.push_str(&format!("[{content}]({href})\n\n"));
        }
        ElementKind::Image { src, alt } => {
            out.push_str(&format!("![{alt}]({src})\n\n"));
        }
    }
}

// ---------------------------------------------------------------------------
// Reading Markdown back
// ---------------------------------------------------------------------------

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,7}) (.*)$").expect("valid regex"));
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^( *)(- |\d+\. )(.*)$").expect("valid regex"));
static QUOTE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((?:> ?)+)(.*)$").expect("valid regex"));
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^!\[([^\]]*)\]\(([^)]*)\)$").expect("valid regex"));
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]*)\]\(([^)]*)\)$").expect("valid regex"));
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^`([^`]+)`$").expect("valid regex"));

/// Read a document produced by [`MarkdownTree::stringify`] back into a tree.
///
/// The first level-1 header becomes the title. Only the constructs the
/// renderer emits are recognized; anything else is read as paragraph text.
pub fn parse_markdown(md: &str) -> MarkdownTree {
    let lines: Vec<&str> = md.lines().collect();
    let mut title = String::new();
    let mut elements = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut i = 0;

    let flush = |paragraph: &mut Vec<&str>, elements: &mut Vec<MarkdownElement>| {
        if !paragraph.is_empty() {
            elements.push(MarkdownElement::new(ElementKind::Paragraph, paragraph.join(" ")));
            paragraph.clear();
        }
    };

    while i < lines.len() {
        let line = lines[i];
        i += 1;

        if line.trim().is_empty() {
            flush(&mut paragraph, &mut elements);
            continue;
        }

        if line.starts_with("```") {
            flush(&mut paragraph, &mut elements);
            let mut code = Vec::new();
            while i < lines.len() && !lines[i].starts_with("```") {
                code.push(lines[i]);
                i += 1;
            }
            i += 1;
            elements.push(MarkdownElement::new(ElementKind::CodeBlock, code.join("\n")));
            continue;
        }

        if let Some(caps) = HEADER_RE.captures(line) {
            flush(&mut paragraph, &mut elements);
            let level = caps[1].len() as u8;
            let text = caps[2].trim().to_string();
            if level == 1 && title.is_empty() && elements.is_empty() {
                title = text;
            } else {
                elements.push(MarkdownElement::new(ElementKind::Header { level }, text));
            }
            continue;
        }

        if let Some(caps) = LIST_ITEM_RE.captures(line) {
            flush(&mut paragraph, &mut elements);
            let depth = (caps[1].len() / 2 + 1) as u8;
            let kind = if caps[2].starts_with('-') {
                ElementKind::UnorderedListItem { depth }
            } else {
                ElementKind::OrderedListItem { depth }
            };
            elements.push(MarkdownElement::new(kind, &caps[3]));
            continue;
        }

        if let Some(caps) = QUOTE_PREFIX_RE.captures(line) {
            flush(&mut paragraph, &mut elements);
            let prefix = caps[1].to_string();
            let depth = prefix.matches('>').count() as u8;
            let mut quoted = vec![caps[2].to_string()];
            while i < lines.len() && lines[i].starts_with(prefix.as_str()) {
                quoted.push(lines[i][prefix.len()..].to_string());
                i += 1;
            }
            elements.push(MarkdownElement::new(
                ElementKind::BlockQuote { depth },
                quoted.join("\n"),
            ));
            continue;
        }

        if line.starts_with('|') {
            flush(&mut paragraph, &mut elements);
            let mut rows = vec![line];
            while i < lines.len() && lines[i].starts_with('|') {
                rows.push(lines[i]);
                i += 1;
            }
            elements.push(MarkdownElement::new(ElementKind::Table, rows.join("\n")));
            continue;
        }

        if paragraph.is_empty() {
            if let Some(caps) = IMAGE_RE.captures(line) {
                elements.push(MarkdownElement::new(
                    ElementKind::Image {
                        src: caps[2].to_string(),
                        alt: caps[1].to_string(),
                    },
                    &caps[1],
                ));
                continue;
            }
            if let Some(caps) = LINK_RE.captures(line) {
                elements.push(MarkdownElement::new(
                    ElementKind::Link {
                        href: caps[2].to_string(),
                    },
                    &caps[1],
                ));
                continue;
            }
            if let Some(caps) = CODE_RE.captures(line) {
                elements.push(MarkdownElement::new(ElementKind::Code, &caps[1]));
                continue;
            }
        }

        paragraph.push(line.trim());
    }
    flush(&mut paragraph, &mut elements);

    MarkdownTree::fold(title, elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(level: u8, text: &str) -> MarkdownElement {
        MarkdownElement::new(ElementKind::Header { level }, text)
    }

    fn para(text: &str) -> MarkdownElement {
        MarkdownElement::new(ElementKind::Paragraph, text)
    }

    #[test]
    fn fold_nests_by_header_level() {
        let tree = MarkdownTree::fold(
            "Page",
            vec![
                para("intro"),
                header(2, "A"),
                para("a body"),
                header(3, "A.1"),
                para("a1 body"),
                header(2, "B"),
                para("b body"),
            ],
        );

        let root_children = tree.children(ROOT);
        assert_eq!(root_children.len(), 3);
        assert_eq!(tree.get(root_children[0]).unwrap().element.content, "intro");

        let a = root_children[1];
        let a_children = tree.children(a);
        assert_eq!(a_children.len(), 2);
        let a1 = a_children[1];
        assert_eq!(tree.get(a1).unwrap().element.content, "A.1");
        assert_eq!(tree.parent(a1), Some(a));
        assert_eq!(tree.children(a1).len(), 1);

        let b = root_children[2];
        assert_eq!(tree.get(b).unwrap().element.content, "B");
        assert_eq!(tree.parent(b), Some(ROOT));
    }

    #[test]
    fn headers_never_climb_above_root() {
        let tree = MarkdownTree::fold("Page", vec![header(1, "Also one"), para("text")]);
        let children = tree.children(ROOT);
        assert_eq!(children.len(), 1);
        assert_eq!(tree.children(children[0]).len(), 1);
    }

    #[test]
    fn flatten_is_preorder_with_root() {
        let tree = MarkdownTree::fold(
            "Page",
            vec![header(2, "A"), para("a"), header(3, "A.1"), para("a1"), header(2, "B")],
        );
        let contents: Vec<&str> = tree.flatten().iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["Page", "A", "a", "A.1", "a1", "B"]);
    }

    #[test]
    fn stringify_renders_each_kind() {
        let tree = MarkdownTree::fold(
            "Page",
            vec![
                para("Intro text."),
                MarkdownElement::new(ElementKind::UnorderedListItem { depth: 1 }, "one"),
                MarkdownElement::new(ElementKind::UnorderedListItem { depth: 2 }, "nested"),
                MarkdownElement::new(ElementKind::OrderedListItem { depth: 1 }, "first"),
                header(2, "Code"),
                MarkdownElement::new(ElementKind::CodeBlock, "let x = 1;"),
                MarkdownElement::new(ElementKind::BlockQuote { depth: 2 }, "quoted"),
                MarkdownElement::new(
                    ElementKind::Link {
                        href: "https://example.com".into(),
                    },
                    "Example",
                ),
            ],
        );

        let md = tree.stringify();
        assert_eq!(
            md,
            "# Page\n\nIntro text.\n\n- one\n  - nested\n1. first\n\n## Code\n\n```\nlet x = 1;\n```\n\n> > quoted\n\n[Example](https://example.com)"
        );
    }

    #[test]
    fn render_subtree_covers_descendants_only() {
        let tree = MarkdownTree::fold(
            "Page",
            vec![header(2, "A"), para("a"), header(3, "A.1"), para("a1"), header(2, "B")],
        );
        let a = tree.children(ROOT)[0];
        assert_eq!(tree.render_subtree(a), "## A\n\na\n\n### A.1\n\na1");
        assert_eq!(tree.render_subtree(999), "");
    }

    #[test]
    fn section_lead_skips_nested_sections() {
        let tree = MarkdownTree::fold(
            "Page",
            vec![header(2, "A"), para("a"), header(3, "A.1"), para("a1"), para("tail")],
        );
        let a = tree.children(ROOT)[0];
        assert_eq!(tree.render_section_lead(a), "## A\n\na");
        assert_eq!(tree.render_section_lead(ROOT), "# Page");
    }

    #[test]
    fn parse_reads_back_rendered_tree() {
        let original = MarkdownTree::fold(
            "Guide",
            vec![
                para("Opening words."),
                header(2, "Setup"),
                para("Install it."),
                MarkdownElement::new(ElementKind::OrderedListItem { depth: 1 }, "Download"),
                MarkdownElement::new(ElementKind::UnorderedListItem { depth: 2 }, "Mirror"),
                MarkdownElement::new(ElementKind::CodeBlock, "cargo install\n  --locked"),
                header(3, "Notes"),
                MarkdownElement::new(ElementKind::BlockQuote { depth: 1 }, "Be careful"),
                MarkdownElement::new(ElementKind::Table, "| a | b |\n| --- | --- |\n| 1 | 2 |"),
                MarkdownElement::new(
                    ElementKind::Image {
                        src: "https://example.com/x.png".into(),
                        alt: "diagram".into(),
                    },
                    "diagram",
                ),
                header(2, "Usage"),
                MarkdownElement::new(ElementKind::Code, "run()"),
            ],
        );

        let reparsed = parse_markdown(&original.stringify());
        assert_eq!(reparsed, original);
    }
}
