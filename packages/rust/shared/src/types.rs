//! Core domain types shared by extraction, indexing, and generation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Declares a UUID v7 newtype (time-sortable) with the usual conversions.
macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a dataset (the unit of index scoping).
    DatasetId
);
uuid_id!(
    /// Identifier of a column within a dataset.
    ColumnId
);
uuid_id!(
    /// Identifier of a single cell.
    CellId
);
uuid_id!(
    /// Identifier of a column's generation process.
    ProcessId
);

// ---------------------------------------------------------------------------
// Dataset / Column / Process
// ---------------------------------------------------------------------------

/// A tabular dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Whether a column holds user data or model-generated values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Static,
    Dynamic,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

impl std::str::FromStr for ColumnKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(format!("unknown column kind: {other}")),
        }
    }
}

/// Execution metadata of a dynamic column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    /// Prompt template; may reference other columns as `{{name}}`.
    pub instruction: String,
    pub model_id: String,
    pub provider_id: String,
    /// Columns whose row values feed this column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns_references: Vec<ColumnId>,
    pub row_offset: u32,
    pub row_limit: u32,
    #[serde(default)]
    pub search_enabled: bool,
    /// Referenced cells older than this are stale.
    pub updated_at: DateTime<Utc>,
}

impl Process {
    /// True when the column is generated from other columns' values.
    pub fn is_dependent(&self) -> bool {
        !self.columns_references.is_empty()
    }

    /// Refresh `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A dataset column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub dataset_id: DatasetId,
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

/// A single cell of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub column_id: ColumnId,
    pub row_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub generating: bool,
    #[serde(default)]
    pub validated: bool,
    pub updated_at: DateTime<Utc>,
}

impl Cell {
    /// A fresh, empty cell.
    pub fn new(column_id: ColumnId, row_index: u32) -> Self {
        Self {
            id: CellId::new(),
            column_id,
            row_index,
            value: None,
            error: None,
            generating: false,
            validated: false,
            updated_at: Utc::now(),
        }
    }

    /// The cell's value, if it is non-empty.
    pub fn non_empty_value(&self) -> Option<&str> {
        self.value.as_deref().filter(|v| !v.trim().is_empty())
    }

    /// Put the cell in its terminal state.
    pub fn finish(&mut self) {
        self.generating = false;
        self.updated_at = Utc::now();
    }
}

/// A referenced column's value for one row, as read from persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowValue {
    pub column_id: ColumnId,
    pub column_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RowValue {
    /// The value, provided it is non-empty and was written after `since`.
    pub fn fresh_value(&self, since: DateTime<Utc>) -> Option<&str> {
        let value = self.value.as_deref().filter(|v| !v.trim().is_empty())?;
        match self.updated_at {
            Some(at) if at > since => Some(value),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// A prior output shown to the model as a few-shot example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub output: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub validated: bool,
}

/// A passage returned from the hybrid index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub text: String,
    pub source_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Everything the model-call collaborator needs for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model_id: String,
    pub provider_id: String,
    pub instruction: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub examples: Vec<Example>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources_context: Option<Vec<RetrievedPassage>>,
    pub row_index: u32,
}

// ---------------------------------------------------------------------------
// Web content
// ---------------------------------------------------------------------------

/// A web search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSource {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Page-level metadata scraped from `<title>` and meta tags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// A node of a serialized element's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedNode {
    Text(String),
    Element(SerializedElement),
}

/// A DOM element reduced to its tag, allow-listed attributes, and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedElement {
    pub tag_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub content: Vec<SerializedNode>,
}

impl SerializedElement {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            attributes: BTreeMap::new(),
            content: Vec::new(),
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content.push(SerializedNode::Text(text.into()));
        self
    }

    pub fn with_child(mut self, child: SerializedElement) -> Self {
        self.content.push(SerializedNode::Element(child));
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Concatenated text of all descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn collect_text(element: &SerializedElement, out: &mut String) {
    for node in &element.content {
        match node {
            SerializedNode::Text(t) => out.push_str(t),
            SerializedNode::Element(e) => collect_text(e, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn dataset_id_roundtrip() {
        let id = DatasetId::new();
        let parsed: DatasetId = id.to_string().parse().expect("parse DatasetId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn column_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ColumnKind::Dynamic).expect("serialize");
        assert_eq!(json, "\"dynamic\"");
        assert_eq!("static".parse::<ColumnKind>(), Ok(ColumnKind::Static));
        assert!("other".parse::<ColumnKind>().is_err());
    }

    #[test]
    fn stale_row_values_are_missing() {
        let process_time = Utc::now();
        let mut value = RowValue {
            column_id: ColumnId::new(),
            column_name: "country".into(),
            value: Some("France".into()),
            updated_at: Some(process_time + Duration::seconds(5)),
        };
        assert_eq!(value.fresh_value(process_time), Some("France"));

        value.updated_at = Some(process_time - Duration::seconds(5));
        assert_eq!(value.fresh_value(process_time), None);

        value.updated_at = Some(process_time + Duration::seconds(5));
        value.value = Some("   ".into());
        assert_eq!(value.fresh_value(process_time), None);
    }

    #[test]
    fn serialized_element_untagged_json() {
        let el = SerializedElement::new("p")
            .with_attr("class", "lead")
            .with_text("Hello ")
            .with_child(SerializedElement::new("b").with_text("world"));

        let json = serde_json::to_string(&el).expect("serialize");
        assert!(json.contains(r#""content":["Hello ",{"tag_name":"b""#));

        let parsed: SerializedElement = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.text(), "Hello world");
        assert_eq!(parsed.attr("class"), Some("lead"));
    }

    #[test]
    fn cell_finish_clears_generating() {
        let mut cell = Cell::new(ColumnId::new(), 3);
        cell.generating = true;
        cell.value = Some("4".into());
        cell.finish();
        assert!(!cell.generating);
        assert_eq!(cell.non_empty_value(), Some("4"));
    }
}
