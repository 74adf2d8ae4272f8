//! Size-bounded re-splitting of Markdown elements.
//!
//! Lengths are measured in characters, not bytes.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::MarkdownElement;

/// Words that end in a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "inc", "ltd",
    "no", "fig", "approx",
];

static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!?]+["'\u{201D}\u{2019})\]]*\s+"#).expect("valid regex")
});

/// Split every element longer than `max_chars` into several elements.
///
/// A `max_chars` of zero or less disables splitting. List items and block
/// quotes are kept whole, headers are truncated, everything else is split
/// on sentence boundaries with a whitespace fallback for oversized sentences.
/// Pieces keep the kind and parent of the element they came from.
pub fn chunk_elements(elements: Vec<MarkdownElement>, max_chars: i64) -> Vec<MarkdownElement> {
    if max_chars <= 0 {
        return elements;
    }
    let max = usize::try_from(max_chars).unwrap_or(usize::MAX);

    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        if element.kind.is_atomic() || char_len(&element.content) <= max {
            out.push(element);
            continue;
        }

        if element.kind.is_header() {
            let truncated = truncate_chars(&element.content, max).to_string();
            out.push(element.with_content(truncated));
            continue;
        }

        for piece in split_to_fit(&element.content, max) {
            out.push(element.with_content(piece));
        }
    }
    out
}

/// Greedily pack sentences into pieces of at most `max` characters.
fn split_to_fit(text: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut buf = String::new();

    for sentence in split_sentences(text) {
        let sentence_len = char_len(sentence);
        if sentence_len > max {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
            }
            pieces.extend(split_on_whitespace(sentence, max));
            continue;
        }

        let joined_len = if buf.is_empty() {
            sentence_len
        } else {
            char_len(&buf) + 1 + sentence_len
        };

        if joined_len > max {
            pieces.push(std::mem::replace(&mut buf, sentence.to_string()));
        } else {
            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(sentence);
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

/// Split text into trimmed sentences, leaving common abbreviations intact.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for m in SENTENCE_END_RE.find_iter(text) {
        if m.as_str().starts_with('.') && is_abbreviation(&text[start..m.start()]) {
            continue;
        }
        let end = m.start() + m.as_str().trim_end().len();
        let sentence = text[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        start = m.end();
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn is_abbreviation(before: &str) -> bool {
    let word = before
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or_default()
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();

    let is_initial = word.chars().count() == 1 && word.chars().all(char::is_alphabetic);
    is_initial || ABBREVIATIONS.contains(&word.as_str())
}

/// Cut text at the last whitespace that keeps each piece within `max`,
/// hard-cutting words longer than `max`.
fn split_on_whitespace(text: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = text.trim();

    while char_len(rest) > max {
        let limit = byte_offset(rest, max);
        let head = &rest[..limit];
        let cut = match head.rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => limit,
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }

    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`th character, or the string length.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> &str {
    &s[..byte_offset(s, max)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementKind, MarkdownElement};

    fn para(text: &str) -> MarkdownElement {
        MarkdownElement::new(ElementKind::Paragraph, text)
    }

    #[test]
    fn non_positive_limit_is_identity() {
        let input = vec![para(&"x".repeat(5000))];
        assert_eq!(chunk_elements(input.clone(), 0), input);
        assert_eq!(chunk_elements(input.clone(), -1), input);
    }

    #[test]
    fn list_items_and_quotes_are_never_split() {
        let long = "word ".repeat(100);
        let input = vec![
            MarkdownElement::new(ElementKind::UnorderedListItem { depth: 1 }, long.clone()),
            MarkdownElement::new(ElementKind::BlockQuote { depth: 1 }, long.clone()),
        ];
        let out = chunk_elements(input.clone(), 20);
        assert_eq!(out, input);
    }

    #[test]
    fn headers_are_truncated() {
        let out = chunk_elements(
            vec![MarkdownElement::new(
                ElementKind::Header { level: 2 },
                "A very long heading",
            )],
            6,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "A very");
    }

    #[test]
    fn paragraphs_split_on_sentences() {
        let text = "First sentence here. Second one is here! Third? Fourth sentence closes.";
        let out = chunk_elements(vec![para(text)], 45);

        assert!(out.len() > 1);
        for piece in &out {
            assert!(piece.content.chars().count() <= 45, "{:?}", piece.content);
            assert_eq!(piece.kind, ElementKind::Paragraph);
        }
        let rejoined: Vec<&str> = out.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(rejoined.join(" "), text);
        assert_eq!(out[0].content, "First sentence here. Second one is here!");
    }

    #[test]
    fn oversized_sentence_falls_back_to_whitespace() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let out = chunk_elements(vec![para(text)], 12);
        for piece in &out {
            assert!(piece.content.chars().count() <= 12);
        }
        assert_eq!(out[0].content, "alpha beta");
        let rejoined: Vec<&str> = out.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(rejoined.join(" "), text);
    }

    #[test]
    fn unbroken_words_are_hard_cut() {
        let out = chunk_elements(vec![para("abcdefghij")], 4);
        let pieces: Vec<&str> = out.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(pieces, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn abbreviations_do_not_end_sentences() {
        let sentences = split_sentences("Dr. Smith met Mr. Jones, e.g. at noon. Then J. R. left.");
        assert_eq!(
            sentences,
            vec!["Dr. Smith met Mr. Jones, e.g. at noon.", "Then J. R. left."]
        );
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let out = chunk_elements(vec![para("ééééé ééééé")], 5);
        let pieces: Vec<&str> = out.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(pieces, vec!["ééééé", "ééééé"]);
    }
}
