//! Prompt templates for cell generation and search-query derivation.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use cellforge_shared::{Example, GenerationRequest, RetrievedPassage};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid regex"));
static BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+)$").expect("valid regex"));
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^["'“](.+?)["'”]$"#).expect("valid regex"));

const PREAMBLE: &str = "Generate a new response based on the following instruction. \
Be clear and concise in the response and do not generate any introductory text. \
Only the response is required.";

const AVOID_EXAMPLES: &str =
    "Find a way to generate the new response that is not similar to the examples below.";

/// Render the prompt for one row.
///
/// Rows with data use the from-data template; rows without use the
/// from-scratch template.
pub fn render_generation_prompt(request: &GenerationRequest) -> String {
    if request.data.is_empty() {
        from_scratch(request)
    } else {
        from_data(request)
    }
}

fn from_scratch(request: &GenerationRequest) -> String {
    let mut out = format!("{PREAMBLE}\n\n## Instruction:\n{}\n\n", request.instruction.trim());
    push_sources(&mut out, request.sources_context.as_deref());

    let outputs: Vec<&str> = request
        .examples
        .iter()
        .map(|e| e.output.trim())
        .filter(|o| !o.is_empty())
        .collect();
    if !outputs.is_empty() {
        out.push_str(AVOID_EXAMPLES);
        out.push_str("\n## Examples:\n");
        for output in outputs {
            let _ = writeln!(out, "- {output}");
        }
        out.push('\n');
    }

    out.push_str("## Response:\n");
    out
}

fn from_data(request: &GenerationRequest) -> String {
    let instruction = render_instruction(&request.instruction, &request.data);
    let mut out = format!("{PREAMBLE}\n\n## Instruction:\n{}\n\n", instruction.trim());
    push_sources(&mut out, request.sources_context.as_deref());

    let examples: Vec<&Example> = request
        .examples
        .iter()
        .filter(|e| !e.output.trim().is_empty())
        .collect();
    if !examples.is_empty() {
        out.push_str("## Examples:\n");
        for example in examples {
            if !example.inputs.is_empty() {
                let inputs: Vec<String> = example
                    .inputs
                    .iter()
                    .map(|(name, value)| format!("{name}: {value}"))
                    .collect();
                let _ = writeln!(out, "Input: {}", inputs.join("; "));
            }
            let _ = writeln!(out, "Output: {}\n", example.output.trim());
        }
    }

    out.push_str("## Response:\n");
    out
}

fn push_sources(out: &mut String, sources: Option<&[RetrievedPassage]>) {
    let Some(sources) = sources.filter(|s| !s.is_empty()) else {
        return;
    };
    out.push_str("## Sources:\nUse the following sources to ground the response.\n\n");
    for (i, passage) in sources.iter().enumerate() {
        let _ = writeln!(out, "[{}] {}\n{}\n", i + 1, passage.source_uri, passage.text.trim());
    }
}

/// Substitute `{{name}}` placeholders from `data`. Unknown names render empty.
pub fn render_instruction(instruction: &str, data: &BTreeMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(instruction, |caps: &regex::Captures<'_>| {
            data.get(caps[1].trim()).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Placeholder names in order of first appearance.
pub fn placeholders(instruction: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER_RE.captures_iter(instruction) {
        let name = caps[1].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

// ---------------------------------------------------------------------------
// Search-query derivation
// ---------------------------------------------------------------------------

/// Ask the model for up to `max_queries` web search queries.
pub fn search_queries_prompt(instruction: &str, max_queries: usize) -> String {
    format!(
        "Given this instruction:\n\n{}\n\n\
Create exactly {max_queries} specific web search queries that will help gather \
information to follow it. Don't use adjectives (e.g., \"best\") unless they are \
included in the instruction. Make each query as simple and effective as possible.\n\n\
Your response must follow this exact format:\n\n\
SEARCH QUERIES:\n\
- \"specific search query 1\"\n\
- \"specific search query 2\"\n",
        instruction.trim()
    )
}

/// Read queries from bulleted, optionally quoted, lines. Duplicates are
/// dropped and at most `max_queries` are kept.
pub fn parse_search_queries(text: &str, max_queries: usize) -> Vec<String> {
    let mut queries: Vec<String> = Vec::new();
    for line in text.lines() {
        if queries.len() >= max_queries {
            break;
        }
        let Some(item) = bullet_item(line) else {
            continue;
        };
        let query = unquote(item);
        if !query.is_empty() && !queries.iter().any(|q| q == query) {
            queries.push(query.to_string());
        }
    }
    queries
}

/// The text after a `- `, `* `, or `1. ` marker.
pub(crate) fn bullet_item(line: &str) -> Option<&str> {
    BULLET_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
}

pub(crate) fn unquote(item: &str) -> &str {
    QUOTED_RE
        .captures(item)
        .and_then(|caps| caps.get(1))
        .map_or(item, |m| m.as_str())
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(instruction: &str) -> GenerationRequest {
        GenerationRequest {
            model_id: "m".into(),
            provider_id: "p".into(),
            instruction: instruction.into(),
            data: BTreeMap::new(),
            examples: Vec::new(),
            sources_context: None,
            row_index: 0,
        }
    }

    fn example(output: &str) -> Example {
        Example {
            output: output.into(),
            inputs: BTreeMap::new(),
            validated: false,
        }
    }

    #[test]
    fn from_scratch_without_examples() {
        let prompt = render_generation_prompt(&request("Name a fruit"));
        assert!(prompt.starts_with(PREAMBLE));
        assert!(prompt.contains("## Instruction:\nName a fruit\n\n## Response:\n"));
        assert!(!prompt.contains("## Examples:"));
        assert!(!prompt.contains("## Sources:"));
    }

    #[test]
    fn from_scratch_lists_examples_to_avoid() {
        let mut req = request("Name a fruit");
        req.examples = vec![example("apple"), example("  "), example("pear")];
        let prompt = render_generation_prompt(&req);
        assert!(prompt.contains(&format!("{AVOID_EXAMPLES}\n## Examples:\n- apple\n- pear\n")));
        assert!(prompt.ends_with("## Response:\n"));
    }

    #[test]
    fn from_data_substitutes_columns() {
        let mut req = request("Capital of {{ country }}? {{missing}}");
        req.data.insert("country".into(), "France".into());
        let prompt = render_generation_prompt(&req);
        assert!(prompt.contains("## Instruction:\nCapital of France?\n\n"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn from_data_examples_carry_inputs() {
        let mut req = request("Capital of {{country}}?");
        req.data.insert("country".into(), "Spain".into());
        let mut validated = example("Paris");
        validated.inputs.insert("country".into(), "France".into());
        validated.validated = true;
        req.examples = vec![validated];

        let prompt = render_generation_prompt(&req);
        assert!(prompt.contains("## Examples:\nInput: country: France\nOutput: Paris\n"));
    }

    #[test]
    fn sources_are_numbered_with_uris() {
        let mut req = request("Summarize");
        req.sources_context = Some(vec![
            RetrievedPassage {
                text: "First passage.".into(),
                source_uri: "https://a.example".into(),
                score: Some(0.5),
            },
            RetrievedPassage {
                text: "Second passage.".into(),
                source_uri: "https://b.example".into(),
                score: None,
            },
        ]);
        let prompt = render_generation_prompt(&req);
        assert!(prompt.contains("[1] https://a.example\nFirst passage.\n"));
        assert!(prompt.contains("[2] https://b.example\nSecond passage.\n"));
        let sources_at = prompt.find("## Sources:").unwrap();
        assert!(sources_at < prompt.find("## Response:").unwrap());
    }

    #[test]
    fn placeholders_are_unique_and_ordered() {
        assert_eq!(
            placeholders("{{b}} then {{ a }} and {{b}} again"),
            vec!["b".to_string(), "a".to_string()]
        );
        assert!(placeholders("plain").is_empty());
    }

    #[test]
    fn parses_quoted_and_bulleted_queries() {
        let text = "SEARCH QUERIES:\n- \"tallest buildings\"\n* 'bridges of europe'\n1. rivers\nnot a bullet\n- \"tallest buildings\"\n- extra";
        assert_eq!(
            parse_search_queries(text, 3),
            vec!["tallest buildings", "bridges of europe", "rivers"]
        );
        assert_eq!(parse_search_queries(text, 1), vec!["tallest buildings"]);
        assert!(parse_search_queries("nothing here", 5).is_empty());
    }

    #[test]
    fn query_prompt_mentions_count() {
        let prompt = search_queries_prompt("List rivers", 2);
        assert!(prompt.contains("exactly 2"));
        assert!(prompt.contains("List rivers"));
    }
}
