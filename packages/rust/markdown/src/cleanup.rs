//! Text normalization passes shared by conversion and rendering.
//!
//! Each pass is a function `&str -> String`, applied in sequence by [`tidy`].

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Run the post-render passes on a Markdown document.
pub(crate) fn tidy(md: &str) -> String {
    let mut result = md.to_string();

    result = strip_invisible_chars(&result);
    result = normalize_whitespace(&result);
    result = clean_blank_lines(&result);

    result.trim().to_string()
}

// ---------------------------------------------------------------------------
// Inline text
// ---------------------------------------------------------------------------

/// Collapse runs of whitespace (including newlines) into single spaces.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

    WS_RE.replace_all(text, " ").to_string()
}

/// Resolve a link target against the page URL.
///
/// Absolute URLs, anchors, and `mailto:` links are returned unchanged.
pub(crate) fn resolve_href(href: &str, base_url: Option<&Url>) -> String {
    let href = href.trim();
    if href.starts_with("http://")
        || href.starts_with("https://")
        || href.starts_with('#')
        || href.starts_with("mailto:")
    {
        return href.to_string();
    }

    match base_url.map(|base| base.join(href)) {
        Some(Ok(resolved)) => resolved.to_string(),
        _ => href.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Document passes
// ---------------------------------------------------------------------------

/// Remove zero-width and BOM characters left over from page markup.
fn strip_invisible_chars(md: &str) -> String {
    md.chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}'))
        .collect()
}

/// Strip trailing whitespace on every line.
fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse 3+ consecutive newlines into a single blank line.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").to_string()
}
