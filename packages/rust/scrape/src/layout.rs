//! Box geometry for DOM nodes.
//!
//! Extraction only needs approximate positions: which text blocks sit next to
//! each other and how large they are. [`FlowLayout`] computes them with a simple
//! block-flow model; any other [`LayoutEngine`] (for example one reporting real
//! browser geometry) can be swapped in.

use crate::dom::{Dom, DomId, DomNodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Rect::new(
            x,
            y,
            self.right().max(other.right()) - x,
            self.bottom().max(other.bottom()) - y,
        )
    }

    /// Euclidean gap between the two rectangles. Axes on which they overlap
    /// contribute nothing.
    pub fn gap(&self, other: &Rect) -> f64 {
        let dx = (other.x - self.right()).max(self.x - other.right()).max(0.0);
        let dy = (other.y - self.bottom()).max(self.y - other.bottom()).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 720.0,
        }
    }
}

/// Rendered boxes, indexed by node id. Nodes without a box are not rendered.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    rects: Vec<Option<Rect>>,
}

impl Layout {
    pub fn new(node_count: usize) -> Self {
        Self {
            rects: vec![None; node_count],
        }
    }

    pub fn set(&mut self, id: DomId, rect: Rect) {
        if id >= self.rects.len() {
            self.rects.resize(id + 1, None);
        }
        self.rects[id] = Some(rect);
    }

    pub fn rect(&self, id: DomId) -> Option<Rect> {
        self.rects.get(id).copied().flatten()
    }

    pub fn is_visible(&self, id: DomId) -> bool {
        self.rect(id).is_some()
    }
}

pub trait LayoutEngine: Send + Sync {
    fn layout(&self, dom: &Dom, viewport: Viewport) -> Layout;
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// Tags that never produce a box.
const NON_RENDERED_TAGS: &[&str] = &[
    "head", "script", "style", "noscript", "template", "meta", "link", "title",
];

/// Tags laid out inline, flowing inside their containing block.
const FLOW_INLINE_TAGS: &[&str] = &[
    "a", "abbr", "acronym", "b", "bdi", "bdo", "br", "cite", "code", "data", "del", "dfn", "em",
    "i", "img", "ins", "kbd", "label", "mark", "q", "s", "samp", "small", "span", "strong", "sub",
    "sup", "time", "tt", "u", "var",
];

/// Whether the element is hidden by its tag, attributes, or inline style.
pub fn is_hidden(dom: &Dom, id: DomId) -> bool {
    let Some(tag) = dom.tag(id) else {
        return false;
    };
    if NON_RENDERED_TAGS.contains(&tag) || dom.attr(id, "hidden").is_some() {
        return true;
    }
    if dom
        .attr(id, "aria-hidden")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
    {
        return true;
    }
    dom.attr(id, "style").is_some_and(style_hides)
}

fn style_hides(style: &str) -> bool {
    style.split(';').any(|decl| {
        let Some((prop, value)) = decl.split_once(':') else {
            return false;
        };
        let prop = prop.trim().to_ascii_lowercase();
        let value = value
            .trim()
            .trim_end_matches("!important")
            .trim()
            .to_ascii_lowercase();
        match prop.as_str() {
            "display" => value == "none",
            "visibility" => value == "hidden" || value == "collapse",
            "opacity" => value.parse::<f64>().is_ok_and(|o| o <= 0.0),
            _ => false,
        }
    })
}

// ---------------------------------------------------------------------------
// FlowLayout
// ---------------------------------------------------------------------------

const BODY_MARGIN: f64 = 8.0;
const LIST_INDENT: f64 = 40.0;

/// Block-flow layout with fixed-width glyphs.
#[derive(Debug, Clone, Copy)]
pub struct FlowLayout {
    pub char_width: f64,
    pub line_height: f64,
}

impl Default for FlowLayout {
    fn default() -> Self {
        Self {
            char_width: 8.0,
            line_height: 24.0,
        }
    }
}

impl LayoutEngine for FlowLayout {
    fn layout(&self, dom: &Dom, viewport: Viewport) -> Layout {
        let mut layout = Layout::new(dom.len());
        let Some(body) = dom.body() else {
            return layout;
        };
        if is_hidden(dom, body) {
            return layout;
        }

        let width = (viewport.width - 2.0 * BODY_MARGIN).max(self.char_width);
        self.layout_block(dom, body, BODY_MARGIN, BODY_MARGIN, width, &mut layout);
        layout
    }
}

impl FlowLayout {
    /// Lay out a block box and its content. Returns the box height.
    fn layout_block(
        &self,
        dom: &Dom,
        id: DomId,
        x: f64,
        y: f64,
        width: f64,
        layout: &mut Layout,
    ) -> f64 {
        if dom.tag(id) == Some("tr") {
            return self.layout_row(dom, id, x, y, width, layout);
        }

        let indent = match dom.tag(id) {
            Some("ul" | "ol" | "blockquote" | "dd") => LIST_INDENT,
            _ => 0.0,
        };
        let content_x = x + indent;
        let content_width = (width - indent).max(self.char_width);

        // Adjacent vertical margins collapse into the larger one.
        let mut cursor = y;
        let mut pending_margin: f64 = 0.0;
        let mut run: Vec<DomId> = Vec::new();

        let flush_run = |run: &mut Vec<DomId>,
                         cursor: &mut f64,
                         pending: &mut f64,
                         layout: &mut Layout| {
            let top = *cursor + *pending;
            let height = self.layout_inline_run(dom, run, content_x, top, content_width, layout);
            if height > 0.0 {
                *cursor += *pending + height;
                *pending = 0.0;
            }
            run.clear();
        };

        for &child in dom.children(id) {
            let inline = match dom.tag(child) {
                None => true,
                Some(tag) => FLOW_INLINE_TAGS.contains(&tag),
            };
            if dom.tag(child).is_some() && is_hidden(dom, child) {
                continue;
            }
            if inline {
                run.push(child);
                continue;
            }

            flush_run(&mut run, &mut cursor, &mut pending_margin, layout);

            let margin = block_margin(dom.tag(child).unwrap_or_default());
            cursor += pending_margin.max(margin);
            cursor += self.layout_block(dom, child, content_x, cursor, content_width, layout);
            pending_margin = margin;
        }
        flush_run(&mut run, &mut cursor, &mut pending_margin, layout);
        cursor += pending_margin;

        let height = cursor - y;
        layout.set(id, Rect::new(x, y, width, height));
        height
    }

    /// Table cells share the row width evenly.
    fn layout_row(
        &self,
        dom: &Dom,
        id: DomId,
        x: f64,
        y: f64,
        width: f64,
        layout: &mut Layout,
    ) -> f64 {
        let cells: Vec<DomId> = dom
            .element_children(id)
            .filter(|&c| matches!(dom.tag(c), Some("td" | "th")) && !is_hidden(dom, c))
            .collect();

        let mut height: f64 = 0.0;
        if !cells.is_empty() {
            let cell_width = width / cells.len() as f64;
            for (i, &cell) in cells.iter().enumerate() {
                let cell_x = x + i as f64 * cell_width;
                height = height.max(self.layout_block(dom, cell, cell_x, y, cell_width, layout));
            }
        }
        layout.set(id, Rect::new(x, y, width, height));
        height
    }

    /// Lay out consecutive inline nodes as wrapped lines. Returns their height.
    fn layout_inline_run(
        &self,
        dom: &Dom,
        run: &[DomId],
        x: f64,
        y: f64,
        width: f64,
        layout: &mut Layout,
    ) -> f64 {
        if run.is_empty() {
            return 0.0;
        }
        let per_line = ((width / self.char_width).floor() as usize).max(1);
        let mut offset = 0usize;
        for &node in run {
            self.place_inline(dom, node, x, y, per_line, &mut offset, layout);
        }
        let lines = offset.div_ceil(per_line);
        lines as f64 * self.line_height
    }

    #[allow(clippy::too_many_arguments)]
    fn place_inline(
        &self,
        dom: &Dom,
        id: DomId,
        x: f64,
        y: f64,
        per_line: usize,
        offset: &mut usize,
        layout: &mut Layout,
    ) {
        let Some(node) = dom.node(id) else {
            return;
        };
        match &node.kind {
            DomNodeKind::Text(text) => {
                *offset += measured_len(text, *offset == 0);
            }
            DomNodeKind::Element { tag, .. } => {
                if is_hidden(dom, id) {
                    return;
                }
                if tag == "br" {
                    *offset = offset.div_ceil(per_line) * per_line;
                    return;
                }
                let start = *offset;
                for &child in dom.children(id) {
                    self.place_inline(dom, child, x, y, per_line, offset, layout);
                }
                layout.set(id, self.span_rect(start, *offset, x, y, per_line));
            }
        }
    }

    /// Box covering characters `start..end` of a wrapped run.
    fn span_rect(&self, start: usize, end: usize, x: f64, y: f64, per_line: usize) -> Rect {
        let first_line = start / per_line;
        let last_line = if end > start {
            (end - 1) / per_line
        } else {
            first_line
        };
        let top = y + first_line as f64 * self.line_height;

        if first_line == last_line {
            Rect::new(
                x + (start % per_line) as f64 * self.char_width,
                top,
                (end - start) as f64 * self.char_width,
                self.line_height,
            )
        } else {
            Rect::new(
                x,
                top,
                per_line as f64 * self.char_width,
                (last_line - first_line + 1) as f64 * self.line_height,
            )
        }
    }
}

/// Rendered length of a text node after whitespace collapsing.
fn measured_len(text: &str, at_line_start: bool) -> usize {
    let mut len = 0;
    let mut in_space = at_line_start;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                len += 1;
                in_space = true;
            }
        } else {
            len += 1;
            in_space = false;
        }
    }
    len
}

/// Default vertical margin above and below a block.
fn block_margin(tag: &str) -> f64 {
    match tag {
        "h1" => 21.0,
        "h2" => 20.0,
        "h3" => 18.0,
        "h4" => 21.0,
        "h5" | "h6" => 22.0,
        "p" | "ul" | "ol" | "blockquote" | "pre" | "figure" | "dl" => 16.0,
        "hr" => 8.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lay(html: &str) -> (Dom, Layout) {
        let dom = Dom::parse(html);
        let layout = FlowLayout::default().layout(&dom, Viewport::default());
        (dom, layout)
    }

    #[test]
    fn gap_is_zero_when_overlapping() {
        let a = Rect::new(0.0, 0.0, 100.0, 20.0);
        let b = Rect::new(50.0, 10.0, 100.0, 20.0);
        assert_eq!(a.gap(&b), 0.0);
        assert_eq!(b.gap(&a), 0.0);
    }

    #[test]
    fn gap_combines_both_axes() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(13.0, 14.0, 10.0, 10.0);
        assert!((a.gap(&b) - 5.0).abs() < 1e-9);
        assert!((b.gap(&a) - 5.0).abs() < 1e-9);

        let below = Rect::new(5.0, 30.0, 10.0, 10.0);
        assert!((a.gap(&below) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn union_covers_both() {
        let u = Rect::new(0.0, 0.0, 10.0, 10.0).union(&Rect::new(20.0, 5.0, 5.0, 20.0));
        assert_eq!(u, Rect::new(0.0, 0.0, 25.0, 25.0));
    }

    #[test]
    fn blocks_stack_vertically() {
        let (dom, layout) = lay("<html><body><p>First paragraph</p><p>Second paragraph</p></body></html>");
        let body = dom.body().unwrap();
        let ps: Vec<DomId> = dom.element_children(body).collect();
        let first = layout.rect(ps[0]).unwrap();
        let second = layout.rect(ps[1]).unwrap();

        assert_eq!(first.x, BODY_MARGIN);
        assert_eq!(first.height, 24.0);
        assert_eq!(second.y, first.bottom() + 16.0);
        assert!((first.gap(&second) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn long_text_wraps() {
        let text = "x".repeat(400);
        let (dom, layout) = lay(&format!("<html><body><p>{text}</p></body></html>"));
        let p = dom.find_tag("p").unwrap();
        // 1264px / 8px = 158 chars per line
        assert_eq!(layout.rect(p).unwrap().height, 72.0);
    }

    #[test]
    fn inline_spans_get_line_boxes() {
        let (dom, layout) = lay("<html><body><p>Hello <b>bold</b> words</p></body></html>");
        let b = dom.find_tag("b").unwrap();
        let rect = layout.rect(b).unwrap();
        assert_eq!(rect.x, BODY_MARGIN + 6.0 * 8.0);
        assert_eq!(rect.width, 32.0);
        assert_eq!(rect.height, 24.0);
    }

    #[test]
    fn hidden_elements_have_no_box() {
        let (dom, layout) = lay(
            r#"<html><body>
            <div style="display: none"><p>gone</p></div>
            <div hidden>also gone</div>
            <span aria-hidden="true">icon</span>
            <div style="opacity:0">faded</div>
            <p>shown</p>
            </body></html>"#,
        );
        let ps: Vec<DomId> = (0..dom.len()).filter(|&i| dom.tag(i) == Some("p")).collect();
        assert!(!layout.is_visible(ps[0]));
        assert!(layout.is_visible(ps[1]));
        let span = dom.find_tag("span").unwrap();
        assert!(!layout.is_visible(span));
        assert!(dom.find_tag("script").is_none_or(|s| !layout.is_visible(s)));
    }

    #[test]
    fn table_cells_share_row() {
        let (dom, layout) = lay(
            "<html><body><table><tr><td>Left cell</td><td>Right cell</td></tr></table></body></html>",
        );
        let cells: Vec<DomId> = (0..dom.len()).filter(|&i| dom.tag(i) == Some("td")).collect();
        let left = layout.rect(cells[0]).unwrap();
        let right = layout.rect(cells[1]).unwrap();
        assert_eq!(left.y, right.y);
        assert!(right.x > left.x);
    }
}
