//! Serialized DOM elements to a flat list of Markdown elements.

use url::Url;

use cellforge_shared::{SerializedElement, SerializedNode};

use crate::cleanup;
use crate::types::{ElementKind, MarkdownElement};

/// The kind that bare text takes in the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Paragraph,
    UnorderedItem,
    OrderedItem,
    Quote,
}

#[derive(Debug, Clone, Copy)]
struct ConversionState {
    text_kind: TextKind,
    list_depth: u8,
    quote_depth: u8,
}

impl Default for ConversionState {
    fn default() -> Self {
        Self {
            text_kind: TextKind::Paragraph,
            list_depth: 0,
            quote_depth: 0,
        }
    }
}

impl ConversionState {
    fn text_element(&self, content: String) -> MarkdownElement {
        let kind = match self.text_kind {
            TextKind::Paragraph => ElementKind::Paragraph,
            TextKind::UnorderedItem => ElementKind::UnorderedListItem {
                depth: self.list_depth,
            },
            TextKind::OrderedItem => ElementKind::OrderedListItem {
                depth: self.list_depth,
            },
            TextKind::Quote => ElementKind::BlockQuote {
                depth: self.quote_depth,
            },
        };
        MarkdownElement::new(kind, content)
    }

    fn in_list(&self) -> bool {
        matches!(self.text_kind, TextKind::UnorderedItem | TextKind::OrderedItem)
    }
}

/// Convert extracted elements into Markdown elements, in document order.
pub fn convert_elements(
    elements: &[SerializedElement],
    base_url: Option<&Url>,
) -> Vec<MarkdownElement> {
    let mut out = Vec::new();
    for element in elements {
        convert_element(element, ConversionState::default(), base_url, &mut out);
    }
    out
}

/// Merge adjacent paragraphs into one, separated by a single space.
pub fn merge_adjacent(elements: Vec<MarkdownElement>) -> Vec<MarkdownElement> {
    let mut merged: Vec<MarkdownElement> = Vec::with_capacity(elements.len());
    for element in elements {
        if let Some(last) = merged.last_mut() {
            if last.kind == ElementKind::Paragraph && element.kind == ElementKind::Paragraph {
                last.content.push(' ');
                last.content.push_str(&element.content);
                continue;
            }
        }
        merged.push(element);
    }
    merged
}

fn convert_node(
    node: &SerializedNode,
    state: ConversionState,
    base_url: Option<&Url>,
    out: &mut Vec<MarkdownElement>,
) {
    match node {
        SerializedNode::Text(text) => {
            let text = cleanup::collapse_whitespace(text);
            let text = text.trim();
            if !text.is_empty() {
                out.push(state.text_element(text.to_string()));
            }
        }
        SerializedNode::Element(element) => convert_element(element, state, base_url, out),
    }
}

fn convert_element(
    element: &SerializedElement,
    state: ConversionState,
    base_url: Option<&Url>,
    out: &mut Vec<MarkdownElement>,
) {
    let tag = element.tag_name.as_str();
    match tag {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let source_level: u8 = tag[1..].parse().unwrap_or(1);
            let text = inline_text(element);
            if !text.is_empty() {
                out.push(MarkdownElement::new(
                    ElementKind::Header {
                        level: source_level + 1,
                    },
                    text,
                ));
            }
        }
        "p" => {
            let text = inline_text(element);
            if !text.is_empty() {
                out.push(state.text_element(text));
            }
        }
        "ul" | "ol" => {
            let mut nested = state;
            nested.list_depth = nested.list_depth.saturating_add(1);
            nested.text_kind = if tag == "ul" {
                TextKind::UnorderedItem
            } else {
                TextKind::OrderedItem
            };
            for child in &element.content {
                convert_node(child, nested, base_url, out);
            }
        }
        "li" => convert_list_item(element, state, base_url, out),
        "blockquote" => {
            let mut nested = state;
            nested.quote_depth = nested.quote_depth.saturating_add(1);
            nested.text_kind = TextKind::Quote;
            for child in &element.content {
                convert_node(child, nested, base_url, out);
            }
        }
        "pre" => {
            let code = element.text();
            let code = code.trim_matches('\n');
            if !code.trim().is_empty() {
                out.push(MarkdownElement::new(ElementKind::CodeBlock, code));
            }
        }
        "code" => {
            let code = inline_text(element);
            if !code.is_empty() {
                out.push(MarkdownElement::new(ElementKind::Code, code));
            }
        }
        "a" => {
            let text = inline_text(element);
            if text.is_empty() {
                return;
            }
            match element.attr("href") {
                Some(href) if !href.trim().is_empty() && !state.in_list() => {
                    let href = cleanup::resolve_href(href, base_url);
                    out.push(MarkdownElement::new(ElementKind::Link { href }, text));
                }
                _ => out.push(state.text_element(text)),
            }
        }
        "img" => {
            let Some(src) = element.attr("src").filter(|s| !s.trim().is_empty()) else {
                return;
            };
            let alt = element.attr("alt").unwrap_or_default().trim().to_string();
            out.push(MarkdownElement::new(
                ElementKind::Image {
                    src: cleanup::resolve_href(src, base_url),
                    alt: alt.clone(),
                },
                alt,
            ));
        }
        "table" => {
            let table = table_to_markdown(element);
            if !table.is_empty() {
                out.push(MarkdownElement::new(ElementKind::Table, table));
            }
        }
        "script" | "style" | "noscript" | "br" | "hr" => {}
        _ => {
            for child in &element.content {
                convert_node(child, state, base_url, out);
            }
        }
    }
}

/// A list item flattens its inline content into one string; nested lists
/// follow it as deeper items.
fn convert_list_item(
    element: &SerializedElement,
    state: ConversionState,
    base_url: Option<&Url>,
    out: &mut Vec<MarkdownElement>,
) {
    let item_state = if state.in_list() {
        state
    } else {
        ConversionState {
            text_kind: TextKind::UnorderedItem,
            list_depth: state.list_depth.max(1),
            quote_depth: state.quote_depth,
        }
    };

    let mut inline = String::new();
    let mut nested_lists = Vec::new();
    for child in &element.content {
        match child {
            SerializedNode::Element(e) if e.tag_name == "ul" || e.tag_name == "ol" => {
                nested_lists.push(e)
            }
            SerializedNode::Element(e) if is_skipped(&e.tag_name) => {}
            SerializedNode::Element(e) if e.tag_name == "br" => inline.push(' '),
            SerializedNode::Element(e) if is_block(&e.tag_name) => {
                inline.push(' ');
                push_visible_text(e, &mut inline);
                inline.push(' ');
            }
            SerializedNode::Element(e) => push_visible_text(e, &mut inline),
            SerializedNode::Text(t) => inline.push_str(t),
        }
    }

    let text = cleanup::collapse_whitespace(&inline);
    let text = text.trim();
    if !text.is_empty() {
        out.push(item_state.text_element(text.to_string()));
    }

    for list in nested_lists {
        convert_element(list, item_state, base_url, out);
    }
}

/// Plain text of an element with whitespace collapsed.
fn inline_text(element: &SerializedElement) -> String {
    let mut raw = String::new();
    push_visible_text(element, &mut raw);
    cleanup::collapse_whitespace(&raw).trim().to_string()
}

fn push_visible_text(element: &SerializedElement, out: &mut String) {
    for node in &element.content {
        match node {
            SerializedNode::Text(t) => out.push_str(t),
            SerializedNode::Element(e) if is_skipped(&e.tag_name) => {}
            SerializedNode::Element(e) if e.tag_name == "br" => out.push(' '),
            SerializedNode::Element(e) => push_visible_text(e, out),
        }
    }
}

fn is_skipped(tag: &str) -> bool {
    matches!(tag, "script" | "style" | "noscript")
}

/// Block containers whose text stays separated from its neighbours.
fn is_block(tag: &str) -> bool {
    matches!(
        tag,
        "p" | "div"
            | "section"
            | "article"
            | "blockquote"
            | "pre"
            | "table"
            | "dl"
            | "dt"
            | "dd"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
    )
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Convert a serialized `<table>` to a Markdown pipe table.
fn table_to_markdown(table: &SerializedElement) -> String {
    let mut trs = Vec::new();
    collect_by_tag(table, "tr", &mut trs);

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut has_header = false;

    for tr in trs {
        let mut cells = Vec::new();
        let mut header_row = true;
        for node in &tr.content {
            if let SerializedNode::Element(cell) = node {
                match cell.tag_name.as_str() {
                    "th" => cells.push(inline_text(cell).replace('|', "\\|")),
                    "td" => {
                        header_row = false;
                        cells.push(inline_text(cell).replace('|', "\\|"));
                    }
                    _ => {}
                }
            }
        }
        if cells.is_empty() {
            continue;
        }
        if header_row && rows.is_empty() {
            has_header = true;
        }
        rows.push(cells);
    }

    let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    if col_count == 0 {
        return String::new();
    }

    for row in &mut rows {
        row.resize(col_count, String::new());
    }

    let render_row = |row: &[String]| format!("| {} |", row.join(" | "));
    let separator = render_row(&vec!["---".to_string(); col_count]);

    let mut lines = Vec::with_capacity(rows.len() + 1);
    if has_header {
        lines.push(render_row(&rows[0]));
        lines.push(separator);
        lines.extend(rows[1..].iter().map(|r| render_row(r)));
    } else {
        lines.push(render_row(&vec![String::new(); col_count]));
        lines.push(separator);
        lines.extend(rows.iter().map(|r| render_row(r)));
    }
    lines.join("\n")
}

fn collect_by_tag<'a>(element: &'a SerializedElement, tag: &str, out: &mut Vec<&'a SerializedElement>) {
    for node in &element.content {
        if let SerializedNode::Element(child) = node {
            if child.tag_name == tag {
                out.push(child);
            } else if child.tag_name != "table" {
                collect_by_tag(child, tag, out);
            }
        }
    }
}
