//! Build a dataset from a one-line request.
//!
//! The model proposes a dataset name, columns with prompts, and optionally
//! search queries. The runner creates the dataset, grounds it in web sources
//! when asked to, and fills the first rows of every column. Progress is
//! reported as [`PipelineEvent`]s.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use cellforge_shared::{
    AppConfig, CellforgeError, Column, ColumnKind, Dataset, DatasetId, Process, ProcessId,
    Result,
};

use crate::cancel::CancelSignal;
use crate::inference::ModelClient;
use crate::orchestrator::{Orchestrator, RowRange, RunState};
use crate::prompt::{bullet_item, placeholders, unquote};
use crate::sources::SourcePipeline;
use crate::store::CellStore;

pub const DEFAULT_DATASET_NAME: &str = "Auto-generated Dataset";

/// Rows generated per column when populating.
pub const POPULATE_ROWS: u32 = 5;

const NO_COLUMNS: &str = "No structured data found in the assistant response";
const NO_CHUNKS: &str = "No chunks indexed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStep {
    #[serde(rename = "dataset.config")]
    DatasetConfig,
    #[serde(rename = "dataset.config.error")]
    DatasetConfigError,
    #[serde(rename = "dataset.create")]
    DatasetCreate,
    #[serde(rename = "dataset.search")]
    DatasetSearch,
    #[serde(rename = "dataset.search.success")]
    DatasetSearchSuccess,
    #[serde(rename = "sources.process")]
    SourcesProcess,
    #[serde(rename = "source.process.completed")]
    SourceProcessCompleted,
    #[serde(rename = "sources.index")]
    SourcesIndex,
    #[serde(rename = "sources.index.success")]
    SourcesIndexSuccess,
    #[serde(rename = "sources.index.error")]
    SourcesIndexError,
    #[serde(rename = "dataset.populate")]
    DatasetPopulate,
    #[serde(rename = "dataset.populate.success")]
    DatasetPopulateSuccess,
    #[serde(rename = "generic.error")]
    GenericError,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatasetConfig => "dataset.config",
            Self::DatasetConfigError => "dataset.config.error",
            Self::DatasetCreate => "dataset.create",
            Self::DatasetSearch => "dataset.search",
            Self::DatasetSearchSuccess => "dataset.search.success",
            Self::SourcesProcess => "sources.process",
            Self::SourceProcessCompleted => "source.process.completed",
            Self::SourcesIndex => "sources.index",
            Self::SourcesIndexSuccess => "sources.index.success",
            Self::SourcesIndexError => "sources.index.error",
            Self::DatasetPopulate => "dataset.populate",
            Self::DatasetPopulateSuccess => "dataset.populate.success",
            Self::GenericError => "generic.error",
        }
    }

    /// Whether the step ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DatasetConfigError | Self::DatasetPopulateSuccess | Self::GenericError
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<Dataset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    pub step: PipelineStep,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PipelineData>,
}

impl PipelineEvent {
    fn step(step: PipelineStep) -> Self {
        Self {
            step,
            error: None,
            data: None,
        }
    }

    fn with_data(step: PipelineStep, data: PipelineData) -> Self {
        Self {
            step,
            error: None,
            data: Some(data),
        }
    }

    fn failed(step: PipelineStep, error: impl Into<String>) -> Self {
        Self {
            step,
            error: Some(error.into()),
            data: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Dataset configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub queries: Vec<String>,
}

const FORMAT_WITH_SEARCH: &str = "\
Your response must follow this exact format:

DATASET NAME:
Short Descriptive Name

COLUMNS:
- column_name1 : prompt1 (this first column is always the main object and the only one not referencing other columns). This column should generate a single value. For listing items avoid using words like Describe, Generate, etc. and instead use: Identify one, Extract one, Name one etc.
- column_name2 : prompt2 (referencing {{column_name}} if needed)
- column_name3 : prompt3...

SEARCH QUERIES:
- \"specific search query 1\"
- \"specific search query 2\"
";

const FORMAT_WITHOUT_SEARCH: &str = "\
Your response must follow this exact format:

DATASET NAME:
Short Descriptive Name

COLUMNS:
- column_name1 : prompt1 (this first column is always the main object and the only one not referencing other columns)
- column_name2 : prompt2 (referencing {{column_name}} if needed)
- column_name3 : prompt3...
";

const COLUMN_RULES: &str = "\
Only include columns that are directly relevant to the request.

Avoid adding columns with typical database things, like tweet_id, id, timestamp, etc.

Limit the number of columns to maximum 3 unless it's strictly required or the user specifies the columns themselves.
";

const EXAMPLE_WITH_SEARCH: &str = "\
ALWAYS include a prompt for each column.

Here is a high-quality example of dataset configurations:

USER REQUEST:
recent movie reviews by genre

DATASET NAME:
Recent Movie Reviews Collection

COLUMNS:
- movie_title : Identify one movie title from the provided sources.
- reviews : Summarize the movie review for {{movie_title}} based on the provided sources.
- genre : Identify the movie genre of {{movie_title}} based on the provided sources.

SEARCH QUERIES:
- \"recent movie releases\"
";

const EXAMPLE_WITHOUT_SEARCH: &str = "\
Here are some high-quality examples of dataset configurations:

DATASET NAME:
Modern Movie Reviews Collection

COLUMNS:
- movie_title : Generate a movie title in the style of recent releases
- review : Write a detailed movie review for {{movie_title}}
- rating : Rate {{movie_title}} from 1-5 stars based on {{review}}
- genre : Identify the movie genre based on {{review}}
";

/// The prompt asking the model to design a dataset for `instruction`.
pub fn config_prompt(instruction: &str, search_enabled: bool, max_queries: usize) -> String {
    let mut prompt = format!(
        "Given this request:\n\n{}\n\n\
First, provide a short, descriptive name for this dataset (2-5 words).\n\n\
Then, identify the main columns needed for this dataset.\n\n",
        instruction.trim()
    );
    if search_enabled {
        prompt.push_str(
            "Second, identify the prompts that would be needed to generate each cell in the \
column. For example, if the column is tweet, and the tweet is about a specific topic, event, \
or action, write: Tweet about X. If a column is related to another column, reference it using \
{{column_name}} in the prompt.\n\n\
Then, create specific search queries that will help gather information for the entire \
dataset.\n\n",
        );
        prompt.push_str(FORMAT_WITH_SEARCH);
        prompt.push('\n');
        prompt.push_str(&format!(
            "Create exactly {max_queries} specific search queries that will help gather initial \
information, especially for the first column of the dataset. Don't use adjectives for the \
search query (e.g., \"best\") unless they are included in the user instruction. Make the query \
as simple and effective as possible.\n\n"
        ));
        prompt.push_str(COLUMN_RULES);
        prompt.push('\n');
        prompt.push_str(EXAMPLE_WITH_SEARCH);
    } else {
        prompt.push_str(FORMAT_WITHOUT_SEARCH);
        prompt.push('\n');
        prompt.push_str(COLUMN_RULES);
        prompt.push('\n');
        prompt.push_str(EXAMPLE_WITHOUT_SEARCH);
    }
    prompt
}

#[derive(Clone, Copy)]
enum Section {
    Name,
    Columns,
    Queries,
}

/// Read the model's answer to [`config_prompt`].
///
/// Section headers are matched case-insensitively on their own line. The name
/// is the first line after its header. Columns are `- name : prompt` bullets;
/// entries without a colon or a name are skipped, and so are repeated names.
/// Queries are read only when search is enabled, and at most `max_queries`
/// are kept.
pub fn parse_dataset_config(text: &str, search_enabled: bool, max_queries: usize) -> DatasetConfig {
    let mut config = DatasetConfig {
        name: DEFAULT_DATASET_NAME.to_string(),
        columns: Vec::new(),
        queries: Vec::new(),
    };
    let mut named = false;
    let mut section = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let upper = line.to_ascii_uppercase();
        match upper.as_str() {
            "DATASET NAME:" => {
                section = Some(Section::Name);
                continue;
            }
            "COLUMNS:" => {
                section = Some(Section::Columns);
                continue;
            }
            "SEARCH QUERIES:" if search_enabled => {
                section = Some(Section::Queries);
                continue;
            }
            _ => {}
        }

        match section {
            None => {}
            Some(Section::Name) => {
                if !named {
                    config.name = line.to_string();
                    named = true;
                }
            }
            Some(Section::Columns) => {
                let Some((name, prompt)) = bullet_item(line).and_then(|item| item.split_once(':'))
                else {
                    continue;
                };
                let name = name.trim();
                if name.is_empty() || config.columns.iter().any(|c| c.name == name) {
                    continue;
                }
                config.columns.push(ColumnSpec {
                    name: name.to_string(),
                    prompt: prompt.trim().to_string(),
                });
            }
            Some(Section::Queries) => {
                if config.queries.len() >= max_queries {
                    continue;
                }
                let Some(item) = bullet_item(line) else {
                    continue;
                };
                let query = unquote(item);
                if !query.is_empty() {
                    config.queries.push(query.to_string());
                }
            }
        }
    }
    config
}

/// Placeholders of `prompt` naming one of `columns`, in order of appearance.
pub fn column_references(prompt: &str, columns: &[String]) -> Vec<String> {
    placeholders(prompt)
        .into_iter()
        .filter(|name| columns.contains(name))
        .collect()
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AutoDatasetParams {
    pub instruction: String,
    pub model_id: String,
    pub provider_id: String,
    pub search_enabled: bool,
    pub max_search_queries: usize,
    pub max_sources: usize,
}

impl AutoDatasetParams {
    /// Defaults for model and search limits taken from `config`.
    pub fn new(instruction: impl Into<String>, config: &AppConfig) -> Self {
        Self {
            instruction: instruction.into(),
            model_id: config.inference.default_model.clone(),
            provider_id: config.inference.default_provider.clone(),
            search_enabled: false,
            max_search_queries: config.search.max_queries.max(1),
            max_sources: config.search.max_sources,
        }
    }
}

pub struct AutoDatasetRunner {
    store: Arc<dyn CellStore>,
    model: Arc<dyn ModelClient>,
    orchestrator: Arc<Orchestrator>,
    sources: Option<Arc<SourcePipeline>>,
}

impl AutoDatasetRunner {
    pub fn new(
        store: Arc<dyn CellStore>,
        model: Arc<dyn ModelClient>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            store,
            model,
            orchestrator,
            sources: None,
        }
    }

    /// Search, scrape, and index through `sources` when the model proposes
    /// queries.
    pub fn with_sources(mut self, sources: Arc<SourcePipeline>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Run the whole pipeline, reporting each step to `events`. Returns the
    /// created dataset, or `None` when the run stopped early. Failures are
    /// reported as events, never returned.
    #[instrument(skip_all, fields(search = params.search_enabled))]
    pub async fn run_autodataset(
        &self,
        params: &AutoDatasetParams,
        cancel: &CancelSignal,
        events: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Option<Dataset> {
        match self.try_run(params, cancel, events).await {
            Ok(dataset) => dataset,
            Err(e) => {
                warn!(error = %e, "auto-dataset run failed");
                emit(events, PipelineEvent::failed(PipelineStep::GenericError, e.to_string()));
                None
            }
        }
    }

    async fn try_run(
        &self,
        params: &AutoDatasetParams,
        cancel: &CancelSignal,
        events: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<Option<Dataset>> {
        emit(events, PipelineEvent::step(PipelineStep::DatasetConfig));
        let prompt = config_prompt(
            &params.instruction,
            params.search_enabled,
            params.max_search_queries,
        );
        let text = self
            .model
            .complete(&params.model_id, &params.provider_id, &prompt, cancel)
            .await?;
        let config = parse_dataset_config(&text, params.search_enabled, params.max_search_queries);
        if config.columns.is_empty() {
            emit(events, PipelineEvent::failed(PipelineStep::DatasetConfigError, NO_COLUMNS));
            return Ok(None);
        }
        debug!(name = %config.name, columns = config.columns.len(), "dataset configured");

        emit(
            events,
            PipelineEvent::with_data(
                PipelineStep::DatasetCreate,
                PipelineData {
                    name: Some(config.name.clone()),
                    ..Default::default()
                },
            ),
        );
        let dataset = self.create_dataset(&config, params).await?;

        if !config.queries.is_empty() {
            match &self.sources {
                Some(sources) => {
                    self.ground(sources, dataset.id, &config.queries, params.max_sources, events)
                        .await?;
                }
                None => warn!("search queries proposed but no source pipeline configured"),
            }
        }

        emit(
            events,
            PipelineEvent::with_data(
                PipelineStep::DatasetPopulate,
                PipelineData {
                    dataset: Some(dataset.clone()),
                    ..Default::default()
                },
            ),
        );
        self.populate(dataset.id, cancel).await?;
        emit(
            events,
            PipelineEvent::with_data(
                PipelineStep::DatasetPopulateSuccess,
                PipelineData {
                    dataset: Some(dataset.clone()),
                    ..Default::default()
                },
            ),
        );
        info!(dataset_id = %dataset.id, name = %dataset.name, "auto-dataset ready");
        Ok(Some(dataset))
    }

    /// Create the dataset and one dynamic column per spec. References are
    /// resolved once every column exists.
    async fn create_dataset(&self, config: &DatasetConfig, params: &AutoDatasetParams) -> Result<Dataset> {
        let dataset = self.store.create_dataset(&config.name).await?;
        let mut columns: Vec<Column> = Vec::with_capacity(config.columns.len());
        for spec in &config.columns {
            let column = self
                .store
                .create_column(dataset.id, &spec.name, ColumnKind::Dynamic, None)
                .await?;
            columns.push(column);
        }

        let names: Vec<String> = config.columns.iter().map(|c| c.name.clone()).collect();
        for (spec, column) in config.columns.iter().zip(&columns) {
            let references = column_references(&spec.prompt, &names)
                .iter()
                .filter_map(|name| columns.iter().find(|c| &c.name == name).map(|c| c.id))
                .collect();
            let process = Process {
                id: ProcessId::new(),
                instruction: spec.prompt.clone(),
                model_id: params.model_id.clone(),
                provider_id: params.provider_id.clone(),
                columns_references: references,
                row_offset: 0,
                row_limit: POPULATE_ROWS,
                search_enabled: params.search_enabled,
                updated_at: Utc::now(),
            };
            self.store.update_process(column.id, &process).await?;
        }
        info!(dataset_id = %dataset.id, columns = columns.len(), "dataset created");
        Ok(dataset)
    }

    async fn ground(
        &self,
        sources: &SourcePipeline,
        dataset_id: DatasetId,
        queries: &[String],
        max_sources: usize,
        events: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<()> {
        emit(
            events,
            PipelineEvent::with_data(
                PipelineStep::DatasetSearch,
                PipelineData {
                    queries: Some(queries.to_vec()),
                    ..Default::default()
                },
            ),
        );
        let outcome = sources.search(queries, max_sources).await;
        let urls: Vec<String> = outcome.sources.iter().map(|s| s.url.clone()).collect();
        emit(
            events,
            PipelineEvent::with_data(
                PipelineStep::DatasetSearchSuccess,
                PipelineData {
                    urls: Some(urls.clone()),
                    errors: Some(outcome.errors.clone()),
                    ..Default::default()
                },
            ),
        );

        emit(
            events,
            PipelineEvent::with_data(
                PipelineStep::SourcesProcess,
                PipelineData {
                    urls: Some(urls),
                    ..Default::default()
                },
            ),
        );
        let scraped = sources
            .scrape(dataset_id, &outcome.sources, |url, ok| {
                emit(
                    events,
                    PipelineEvent::with_data(
                        PipelineStep::SourceProcessCompleted,
                        PipelineData {
                            url: Some(url.to_string()),
                            ok: Some(ok),
                            ..Default::default()
                        },
                    ),
                );
            })
            .await?;

        emit(
            events,
            PipelineEvent::with_data(
                PipelineStep::SourcesIndex,
                PipelineData {
                    urls: Some(scraped.iter().map(|s| s.url.clone()).collect()),
                    ..Default::default()
                },
            ),
        );
        let count = sources.index(dataset_id, &scraped).await?;
        if count == 0 {
            emit(events, PipelineEvent::failed(PipelineStep::SourcesIndexError, NO_CHUNKS));
        } else {
            emit(
                events,
                PipelineEvent::with_data(
                    PipelineStep::SourcesIndexSuccess,
                    PipelineData {
                        count: Some(count),
                        ..Default::default()
                    },
                ),
            );
        }
        Ok(())
    }

    /// Generate the first rows of every column with a process, in column order.
    async fn populate(&self, dataset_id: DatasetId, cancel: &CancelSignal) -> Result<()> {
        let columns = self.store.list_columns(dataset_id).await?;
        for column in columns.iter().filter(|c| c.process.is_some()) {
            let (tx, mut rx) = mpsc::channel(64);
            let generate = async move {
                self.orchestrator
                    .generate_cells(column.id, RowRange::new(0, POPULATE_ROWS), cancel, &tx)
                    .await
            };
            let drain = async {
                let mut updates = 0usize;
                while rx.recv().await.is_some() {
                    updates += 1;
                }
                updates
            };
            let (state, updates) = tokio::join!(generate, drain);
            let state = state?;
            debug!(column = %column.name, ?state, updates, "column populated");
            if state == RunState::Cancelled {
                return Err(CellforgeError::validation("generation cancelled"));
            }
        }
        Ok(())
    }
}

fn emit(events: &mpsc::UnboundedSender<PipelineEvent>, event: PipelineEvent) {
    debug!(step = event.step.as_str(), "pipeline event");
    if events.send(event).is_err() {
        debug!("pipeline event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::Indexer;
    use crate::orchestrator::ExecutorConfig;
    use crate::retriever::Retriever;
    use crate::sources::SourceLimits;
    use crate::testing::{
        FakeEmbedder, FakeModel, FakeSearch, MemoryStore, scraper_for, serve_status, serve_text,
        temp_storage,
    };
    use wiremock::MockServer;

    const CAPITALS: &str = "\
DATASET NAME:
Capital Cities

COLUMNS:
- country : Name one country
- capital : What is the capital of {{country}}?

SEARCH QUERIES:
- \"list of countries\"
";

    #[test]
    fn parses_name_columns_and_queries() {
        let config = parse_dataset_config(CAPITALS, true, 3);
        assert_eq!(config.name, "Capital Cities");
        assert_eq!(
            config.columns,
            vec![
                ColumnSpec {
                    name: "country".into(),
                    prompt: "Name one country".into(),
                },
                ColumnSpec {
                    name: "capital".into(),
                    prompt: "What is the capital of {{country}}?".into(),
                },
            ]
        );
        assert_eq!(config.queries, vec!["list of countries"]);
    }

    #[test]
    fn queries_ignored_without_search() {
        let config = parse_dataset_config(CAPITALS, false, 3);
        assert!(config.queries.is_empty());
        assert_eq!(config.columns.len(), 2);
    }

    #[test]
    fn headers_are_case_insensitive_and_name_defaults() {
        let config = parse_dataset_config("columns:\n- a : one\n", false, 1);
        assert_eq!(config.name, DEFAULT_DATASET_NAME);
        assert_eq!(config.columns.len(), 1);
    }

    #[test]
    fn malformed_and_repeated_columns_are_skipped() {
        let text = "COLUMNS:\n- no colon here\n- : missing name\n- a : first\n- a : again\nplain line";
        let config = parse_dataset_config(text, false, 1);
        assert_eq!(
            config.columns,
            vec![ColumnSpec {
                name: "a".into(),
                prompt: "first".into(),
            }]
        );
    }

    #[test]
    fn queries_are_capped() {
        let text = "SEARCH QUERIES:\n- \"one\"\n- 'two'\n- three\n";
        let config = parse_dataset_config(text, true, 2);
        assert_eq!(config.queries, vec!["one", "two"]);
    }

    #[test]
    fn references_keep_known_columns_only() {
        let names = vec!["title".to_string(), "review".to_string()];
        assert_eq!(
            column_references("Rate {{ title }} from {{review}} and {{unknown}}", &names),
            vec!["title", "review"]
        );
    }

    #[test]
    fn prompt_variants() {
        let with = config_prompt("capital cities", true, 4);
        assert!(with.contains("SEARCH QUERIES:"));
        assert!(with.contains("Create exactly 4 specific search queries"));
        let without = config_prompt("capital cities", false, 4);
        assert!(!without.contains("SEARCH QUERIES:"));
        assert!(without.starts_with("Given this request:\n\ncapital cities"));
    }

    #[test]
    fn events_serialize_with_dotted_steps() {
        let event = PipelineEvent::with_data(
            PipelineStep::SourceProcessCompleted,
            PipelineData {
                url: Some("https://a.example".into()),
                ok: Some(false),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "step": "source.process.completed",
                "data": { "url": "https://a.example", "ok": false }
            })
        );
    }

    fn capitals_model(config: &str) -> FakeModel {
        FakeModel::with(|request| match request.data.get("country") {
            Some(country) => Ok(format!("Capital of {country}")),
            None => Ok("France".to_string()),
        })
        .completing(config)
    }

    fn runner(store: Arc<MemoryStore>, model: FakeModel) -> AutoDatasetRunner {
        let model: Arc<FakeModel> = Arc::new(model);
        let orchestrator = Orchestrator::new(
            store.clone(),
            model.clone(),
            ExecutorConfig { max_concurrency: 5 },
        );
        AutoDatasetRunner::new(store, model, Arc::new(orchestrator))
    }

    fn params(search_enabled: bool) -> AutoDatasetParams {
        AutoDatasetParams {
            search_enabled,
            model_id: "test-model".into(),
            provider_id: "test-provider".into(),
            ..AutoDatasetParams::new("capital cities", &AppConfig::default())
        }
    }

    async fn collect(
        runner: &AutoDatasetRunner,
        params: &AutoDatasetParams,
        cancel: &CancelSignal,
    ) -> (Option<Dataset>, Vec<PipelineEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dataset = runner.run_autodataset(params, cancel, &tx).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (dataset, events)
    }

    fn steps(events: &[PipelineEvent]) -> Vec<PipelineStep> {
        events.iter().map(|e| e.step).collect()
    }

    #[tokio::test]
    async fn builds_and_populates_without_search() {
        let store = Arc::new(MemoryStore::default());
        let runner = runner(store.clone(), capitals_model(CAPITALS));

        let (dataset, events) = collect(&runner, &params(false), &CancelSignal::new()).await;
        let dataset = dataset.expect("dataset created");
        assert_eq!(dataset.name, "Capital Cities");
        assert_eq!(
            steps(&events),
            vec![
                PipelineStep::DatasetConfig,
                PipelineStep::DatasetCreate,
                PipelineStep::DatasetPopulate,
                PipelineStep::DatasetPopulateSuccess,
            ]
        );

        let columns = store.list_columns(dataset.id).await.unwrap();
        assert_eq!(columns.len(), 2);
        let country = &columns[0];
        let capital = &columns[1];
        assert_eq!(
            capital.process.as_ref().unwrap().columns_references,
            vec![country.id]
        );
        assert!(country.process.as_ref().unwrap().columns_references.is_empty());

        let countries = store.list_cells(country.id).await.unwrap();
        let capitals = store.list_cells(capital.id).await.unwrap();
        assert_eq!(countries.len(), POPULATE_ROWS as usize);
        assert_eq!(capitals.len(), POPULATE_ROWS as usize);
        assert!(capitals.iter().all(|c| c.value.as_deref() == Some("Capital of France")));
        assert!(capitals.iter().chain(&countries).all(|c| !c.generating));
    }

    #[tokio::test]
    async fn answer_without_columns_is_a_config_error() {
        let store = Arc::new(MemoryStore::default());
        let runner = runner(store, FakeModel::answering("I'd rather not."));

        let (dataset, events) = collect(&runner, &params(false), &CancelSignal::new()).await;
        assert!(dataset.is_none());
        assert_eq!(
            steps(&events),
            vec![PipelineStep::DatasetConfig, PipelineStep::DatasetConfigError]
        );
        assert_eq!(events[1].error.as_deref(), Some(NO_COLUMNS));
    }

    #[tokio::test]
    async fn failures_become_generic_errors() {
        let store = Arc::new(MemoryStore::default());
        let runner = runner(store, capitals_model(CAPITALS));
        let cancel = CancelSignal::new();
        cancel.cancel();

        let (dataset, events) = collect(&runner, &params(false), &cancel).await;
        assert!(dataset.is_none());
        assert_eq!(
            steps(&events),
            vec![PipelineStep::DatasetConfig, PipelineStep::GenericError]
        );
        assert!(events[1].error.is_some());
    }

    #[tokio::test]
    async fn grounds_dataset_in_search_results() {
        let server = MockServer::start().await;
        let good = serve_text(&server, "/countries", &"France is a country in Europe. ".repeat(20)).await;
        let bad = serve_status(&server, "/gone", 404).await;

        let storage = Arc::new(temp_storage().await);
        let embedder = Arc::new(FakeEmbedder::default());
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(capitals_model(CAPITALS));
        let sources = SourcePipeline::new(
            model.clone(),
            Arc::new(
                FakeSearch::new().with_results("list of countries", vec![good.clone(), bad.clone()]),
            ),
            scraper_for(),
            Indexer::new(storage.clone(), embedder.clone(), Default::default()),
            Retriever::new(storage.clone(), embedder),
            SourceLimits::default(),
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            model.clone(),
            ExecutorConfig { max_concurrency: 5 },
        );
        let runner = AutoDatasetRunner::new(store.clone(), model, Arc::new(orchestrator))
            .with_sources(Arc::new(sources));

        let (dataset, events) = collect(&runner, &params(true), &CancelSignal::new()).await;
        let dataset = dataset.expect("dataset created");

        let observed = steps(&events);
        assert_eq!(
            observed,
            vec![
                PipelineStep::DatasetConfig,
                PipelineStep::DatasetCreate,
                PipelineStep::DatasetSearch,
                PipelineStep::DatasetSearchSuccess,
                PipelineStep::SourcesProcess,
                PipelineStep::SourceProcessCompleted,
                PipelineStep::SourceProcessCompleted,
                PipelineStep::SourcesIndex,
                PipelineStep::SourcesIndexSuccess,
                PipelineStep::DatasetPopulate,
                PipelineStep::DatasetPopulateSuccess,
            ]
        );

        let search = events[2].data.as_ref().unwrap();
        assert_eq!(search.queries.as_deref(), Some(&["list of countries".to_string()][..]));

        let completed: Vec<(String, bool)> = events
            .iter()
            .filter(|e| e.step == PipelineStep::SourceProcessCompleted)
            .filter_map(|e| e.data.as_ref())
            .map(|d| (d.url.clone().unwrap_or_default(), d.ok.unwrap_or_default()))
            .collect();
        assert!(completed.contains(&(good.url.clone(), true)));
        assert!(completed.contains(&(bad.url.clone(), false)));

        let index = events[7].data.as_ref().unwrap();
        assert_eq!(index.urls.as_deref(), Some(&[good.url.clone()][..]));
        assert_eq!(storage.count_dataset_rows(dataset.id).await.unwrap(), 1);
    }
}
