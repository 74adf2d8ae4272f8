//! In-memory collaborators for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cellforge_scrape::{BrowserPool, ScrapeOptions, Scraper};
use cellforge_shared::{
    Cell, CellforgeError, Column, ColumnId, ColumnKind, Dataset, DatasetId, GenerationRequest,
    Process, ProcessId, Result, RowValue, WebSource,
};
use cellforge_storage::Storage;

use crate::cancel::CancelSignal;
use crate::embedding::Embedder;
use crate::inference::{CompletionDelta, ModelClient};
use crate::search::WebSearch;
use crate::store::CellStore;

pub(crate) async fn temp_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("cellforge_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

/// A process last touched a minute ago, rows `0..5`.
pub(crate) fn process(instruction: &str, references: Vec<ColumnId>) -> Process {
    Process {
        id: ProcessId::new(),
        instruction: instruction.into(),
        model_id: "test-model".into(),
        provider_id: "test-provider".into(),
        columns_references: references,
        row_offset: 0,
        row_limit: 5,
        search_enabled: false,
        updated_at: Utc::now() - Duration::minutes(1),
    }
}

// ---------------------------------------------------------------------------
// Cell store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    datasets: Vec<Dataset>,
    columns: Vec<Column>,
    cells: BTreeMap<(ColumnId, u32), Cell>,
    process_updates: usize,
}

impl MemoryStore {
    pub(crate) fn process_updates(&self) -> usize {
        self.inner.lock().unwrap().process_updates
    }
}

#[async_trait]
impl CellStore for MemoryStore {
    async fn create_cell(&self, column_id: ColumnId, row_index: u32) -> Result<Cell> {
        let cell = Cell::new(column_id, row_index);
        self.inner
            .lock()
            .unwrap()
            .cells
            .insert((column_id, row_index), cell.clone());
        Ok(cell)
    }

    async fn get_cell_by_row_index(
        &self,
        column_id: ColumnId,
        row_index: u32,
    ) -> Result<Option<Cell>> {
        Ok(self.inner.lock().unwrap().cells.get(&(column_id, row_index)).cloned())
    }

    async fn update_cell(&self, cell: &Cell) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .cells
            .insert((cell.column_id, cell.row_index), cell.clone());
        Ok(())
    }

    async fn get_row_values(
        &self,
        column_ids: &[ColumnId],
        row_index: u32,
    ) -> Result<Vec<RowValue>> {
        let tables = self.inner.lock().unwrap();
        column_ids
            .iter()
            .map(|id| {
                let column = tables
                    .columns
                    .iter()
                    .find(|c| c.id == *id)
                    .ok_or_else(|| CellforgeError::not_found(format!("column {id}")))?;
                let cell = tables.cells.get(&(*id, row_index));
                Ok(RowValue {
                    column_id: *id,
                    column_name: column.name.clone(),
                    value: cell.and_then(|c| c.value.clone()),
                    updated_at: cell.map(|c| c.updated_at),
                })
            })
            .collect()
    }

    async fn update_process(&self, column_id: ColumnId, process: &Process) -> Result<()> {
        let mut tables = self.inner.lock().unwrap();
        tables.process_updates += 1;
        let column = tables
            .columns
            .iter_mut()
            .find(|c| c.id == column_id)
            .ok_or_else(|| CellforgeError::not_found(format!("column {column_id}")))?;
        column.process = Some(process.clone());
        Ok(())
    }

    async fn list_cells(&self, column_id: ColumnId) -> Result<Vec<Cell>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .cells
            .values()
            .filter(|c| c.column_id == column_id)
            .cloned()
            .collect())
    }

    async fn get_column(&self, column_id: ColumnId) -> Result<Option<Column>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .columns
            .iter()
            .find(|c| c.id == column_id)
            .cloned())
    }

    async fn create_dataset(&self, name: &str) -> Result<Dataset> {
        let dataset = Dataset {
            id: DatasetId::new(),
            name: name.into(),
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().datasets.push(dataset.clone());
        Ok(dataset)
    }

    async fn create_column(
        &self,
        dataset_id: DatasetId,
        name: &str,
        kind: ColumnKind,
        process: Option<Process>,
    ) -> Result<Column> {
        let column = Column {
            id: ColumnId::new(),
            dataset_id,
            name: name.into(),
            kind,
            process,
        };
        self.inner.lock().unwrap().columns.push(column.clone());
        Ok(column)
    }

    async fn list_columns(&self, dataset_id: DatasetId) -> Result<Vec<Column>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .columns
            .iter()
            .filter(|c| c.dataset_id == dataset_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

type Answer = dyn Fn(&GenerationRequest) -> std::result::Result<String, String> + Send + Sync;

/// Streams the first character of its answer, then the whole answer.
pub(crate) struct FakeModel {
    answer: Box<Answer>,
    completion: String,
    hang_on_row: Option<u32>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeModel {
    /// Every call, streamed or not, answers `text`.
    pub(crate) fn answering(text: &str) -> Self {
        let owned = text.to_string();
        let mut model = Self::with(move |_| Ok(owned.clone()));
        model.completion = text.to_string();
        model
    }

    pub(crate) fn with(
        answer: impl Fn(&GenerationRequest) -> std::result::Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            answer: Box::new(answer),
            completion: String::new(),
            hang_on_row: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers completions with `text`, leaving streamed answers unchanged.
    pub(crate) fn completing(mut self, text: &str) -> Self {
        self.completion = text.to_string();
        self
    }

    /// Stall after the first partial update for `row` until cancelled.
    pub(crate) fn hanging_on(mut self, row: u32) -> Self {
        self.hang_on_row = Some(row);
        self
    }

    pub(crate) fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    fn stream_completion(
        &self,
        request: &GenerationRequest,
        cancel: &CancelSignal,
    ) -> BoxStream<'static, CompletionDelta> {
        self.requests.lock().unwrap().push(request.clone());
        let answer = (self.answer)(request);
        let hang = self.hang_on_row == Some(request.row_index);
        let cancel = cancel.clone();

        let (tx, rx) = mpsc::unbounded();
        tokio::spawn(async move {
            match answer {
                Ok(value) => {
                    let first: String = value.chars().take(1).collect();
                    let _ = tx.unbounded_send(CompletionDelta::partial(first));
                    if hang {
                        cancel.cancelled().await;
                        return;
                    }
                    let _ = tx.unbounded_send(CompletionDelta::finished(value));
                }
                Err(error) => {
                    let _ = tx.unbounded_send(CompletionDelta::failed(error));
                }
            }
        });
        rx.boxed()
    }

    async fn complete(
        &self,
        _model_id: &str,
        _provider_id: &str,
        _prompt: &str,
        cancel: &CancelSignal,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(CellforgeError::Inference("completion cancelled".into()));
        }
        Ok(self.completion.clone())
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

const DIMENSIONS: usize = 64;

/// Hashed bag-of-words vectors, so texts sharing words score as similar.
#[derive(Default)]
pub(crate) struct FakeEmbedder {
    fail_on: Option<String>,
}

impl FakeEmbedder {
    /// Fail any batch containing a text with `needle`.
    pub(crate) fn failing_on(needle: &str) -> Self {
        Self {
            fail_on: Some(needle.to_string()),
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMENSIONS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0xcbf29ce484222325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x100000001b3));
            v[(hash % DIMENSIONS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(needle) = &self.fail_on {
            if inputs.iter().any(|t| t.contains(needle.as_str())) {
                return Err(CellforgeError::Embedding("batch rejected".into()));
            }
        }
        Ok(inputs.iter().map(|t| Self::vector(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// Search and pages
// ---------------------------------------------------------------------------

/// Canned results per query. Unknown queries fail.
#[derive(Default)]
pub(crate) struct FakeSearch {
    results: HashMap<String, Vec<WebSource>>,
}

impl FakeSearch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_results(mut self, query: &str, results: Vec<WebSource>) -> Self {
        self.results.insert(query.to_string(), results);
        self
    }
}

#[async_trait]
impl WebSearch for FakeSearch {
    async fn search(&self, query: &str) -> Result<Vec<WebSource>> {
        self.results
            .get(query)
            .cloned()
            .ok_or_else(|| CellforgeError::Search(format!("no results for {query}")))
    }
}

/// A scraper allowed to reach the local mock server.
pub(crate) fn scraper_for() -> Scraper {
    Scraper::new(
        Arc::new(BrowserPool::new().allow_private_hosts()),
        ScrapeOptions::default(),
    )
}

/// Serve `body` as plain text at `route` and describe it as a search hit.
pub(crate) async fn serve_text(server: &MockServer, route: &str, body: &str) -> WebSource {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/plain; charset=utf-8")
                .set_body_string(body),
        )
        .mount(server)
        .await;
    WebSource {
        title: format!("Page {route}"),
        url: format!("{}{route}", server.uri()),
        snippet: format!("Snippet for {route}"),
    }
}

/// Answer `route` with `status` and describe it as a search hit.
pub(crate) async fn serve_status(server: &MockServer, route: &str, status: u16) -> WebSource {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
    WebSource {
        title: format!("Page {route}"),
        url: format!("{}{route}", server.uri()),
        snippet: String::new(),
    }
}
