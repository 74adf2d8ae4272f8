//! Cell generation for one column.
//!
//! A column without references is generated from scratch, one row at a time,
//! with each answer added to the few-shot examples of the next. A column that
//! references other columns is generated from each row's values, with the
//! model calls for all rows running concurrently.
//!
//! Every cell update is sent as a [`GenerationEvent`]. A run always ends with
//! no cell left generating, and with the column's process touched once.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use cellforge_shared::{
    AppConfig, Cell, CellforgeError, Column, ColumnId, DatasetId, Example, GenerationRequest,
    Process, Result, RetrievedPassage,
};

use crate::cancel::CancelSignal;
use crate::inference::{CompletionDelta, ModelClient};
use crate::prompt::render_instruction;
use crate::sources::SourcePipeline;
use crate::store::CellStore;

/// Error recorded on a row whose referenced values are all empty or stale.
pub const NO_INPUT_DATA: &str = "No input data found";

const STREAM_ENDED: &str = "generation ended without a result";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Preparing,
    Generating,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Cell(Cell),
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Model calls in flight for a column with references.
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ExecutorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrency: config.inference.effective_concurrency(),
        }
    }
}

/// Rows to generate. Unset bounds fall back to the column's process.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowRange {
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl RowRange {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset: Some(offset),
            limit: Some(limit),
        }
    }

    fn resolve(&self, process: &Process) -> Range<u32> {
        let offset = self.offset.unwrap_or(process.row_offset);
        let limit = self.limit.unwrap_or(process.row_limit);
        offset..offset.saturating_add(limit)
    }
}

pub struct Orchestrator {
    store: Arc<dyn CellStore>,
    model: Arc<dyn ModelClient>,
    sources: Option<Arc<SourcePipeline>>,
    config: ExecutorConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn CellStore>, model: Arc<dyn ModelClient>, config: ExecutorConfig) -> Self {
        Self {
            store,
            model,
            sources: None,
            config,
        }
    }

    /// Ground columns with `search_enabled` through `sources`.
    pub fn with_sources(mut self, sources: Arc<SourcePipeline>) -> Self {
        self.sources = Some(sources);
        self
    }

    /// Generate the cells of `column_id` over `range`, sending every update to
    /// `events`.
    ///
    /// Only a missing column or process is an error. Row failures are recorded
    /// on their cells and cancellation ends the run as [`RunState::Cancelled`].
    #[instrument(skip_all, fields(column_id = %column_id))]
    pub async fn generate_cells(
        &self,
        column_id: ColumnId,
        range: RowRange,
        cancel: &CancelSignal,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<RunState> {
        let column = self
            .store
            .get_column(column_id)
            .await?
            .ok_or_else(|| CellforgeError::not_found(format!("column {column_id}")))?;
        let Some(mut process) = column.process.clone() else {
            return Err(CellforgeError::config(format!(
                "column '{}' has no generation process",
                column.name
            )));
        };
        let rows = range.resolve(&process);

        let mut run = Run::new(self.store.as_ref(), events);
        run.transition(RunState::Preparing);
        let result = if process.is_dependent() {
            self.from_references(&column, &process, rows, cancel, &mut run).await
        } else {
            self.from_scratch(&column, &process, rows, cancel, &mut run).await
        };

        let outcome = match result {
            Ok(state) => {
                run.finalize_remaining(None).await;
                Ok(state)
            }
            Err(e) => {
                run.finalize_remaining(Some(&e.to_string())).await;
                if e.is_fatal() {
                    Err(e)
                } else {
                    error!(error = %e, "generation failed");
                    Ok(RunState::Failed)
                }
            }
        };
        if let Ok(state) = &outcome {
            run.transition(*state);
        }

        process.touch();
        self.store.update_process(column_id, &process).await?;
        info!(state = ?run.state, finished = run.finished, "generation run ended");
        outcome
    }

    async fn from_scratch(
        &self,
        column: &Column,
        process: &Process,
        rows: Range<u32>,
        cancel: &CancelSignal,
        run: &mut Run<'_>,
    ) -> Result<RunState> {
        let existing = self.store.list_cells(column.id).await?;
        let validated: HashSet<u32> = existing
            .iter()
            .filter(|c| c.validated)
            .map(|c| c.row_index)
            .collect();
        let mut examples: Vec<Example> = existing
            .iter()
            .filter_map(|cell| {
                cell.non_empty_value().map(|value| Example {
                    output: value.to_string(),
                    inputs: BTreeMap::new(),
                    validated: cell.validated,
                })
            })
            .collect();

        let sources_context = match self.prepare_sources(column.dataset_id, process, cancel).await? {
            Some(sources) => retrieve(sources, column.dataset_id, &process.instruction).await,
            None => None,
        };

        run.transition(RunState::Generating);
        for row in rows {
            if cancel.is_cancelled() {
                return Ok(RunState::Cancelled);
            }
            if validated.contains(&row) {
                debug!(row, "validated cell, skipping");
                continue;
            }

            let cell = self.fetch_or_create(column.id, row).await?;
            run.start(cell).await;

            let request = GenerationRequest {
                model_id: process.model_id.clone(),
                provider_id: process.provider_id.clone(),
                instruction: process.instruction.clone(),
                data: BTreeMap::new(),
                examples: examples.clone(),
                sources_context: sources_context.clone(),
                row_index: row,
            };
            let mut deltas = self.model.stream_completion(&request, cancel);
            let mut finished = None;
            while let Some(delta) = deltas.next().await {
                if let Some(cell) = run.apply(row, delta).await? {
                    finished = Some(cell);
                    break;
                }
            }

            let Some(cell) = finished else {
                if cancel.is_cancelled() {
                    return Ok(RunState::Cancelled);
                }
                run.finalize_remaining(Some(STREAM_ENDED)).await;
                continue;
            };
            if let (None, Some(value)) = (&cell.error, cell.non_empty_value()) {
                examples.push(Example {
                    output: value.to_string(),
                    inputs: BTreeMap::new(),
                    validated: false,
                });
            }
        }
        Ok(RunState::Completed)
    }

    async fn from_references(
        &self,
        column: &Column,
        process: &Process,
        rows: Range<u32>,
        cancel: &CancelSignal,
        run: &mut Run<'_>,
    ) -> Result<RunState> {
        let references = &process.columns_references;
        let existing = self.store.list_cells(column.id).await?;
        let validated: HashSet<u32> = existing
            .iter()
            .filter(|c| c.validated)
            .map(|c| c.row_index)
            .collect();
        let examples = self.validated_examples(&existing, references).await?;
        let sources = self.prepare_sources(column.dataset_id, process, cancel).await?;

        run.transition(RunState::Generating);
        let mut requests = Vec::new();
        for row in rows {
            if cancel.is_cancelled() {
                return Ok(RunState::Cancelled);
            }
            if validated.contains(&row) {
                debug!(row, "validated cell, skipping");
                continue;
            }

            let values = self.store.get_row_values(references, row).await?;
            let data: BTreeMap<String, String> = values
                .iter()
                .filter_map(|v| {
                    v.fresh_value(process.updated_at)
                        .map(|value| (v.column_name.clone(), value.to_string()))
                })
                .collect();

            let mut cell = self.fetch_or_create(column.id, row).await?;
            if data.is_empty() {
                cell.value = None;
                cell.error = Some(NO_INPUT_DATA.to_string());
                cell.finish();
                self.store.update_cell(&cell).await?;
                run.emit(&cell).await;
                continue;
            }

            let sources_context = match sources {
                Some(sources) => {
                    let query = render_instruction(&process.instruction, &data);
                    retrieve(sources, column.dataset_id, &query).await
                }
                None => None,
            };
            requests.push(GenerationRequest {
                model_id: process.model_id.clone(),
                provider_id: process.provider_id.clone(),
                instruction: process.instruction.clone(),
                data,
                examples: examples.clone(),
                sources_context,
                row_index: row,
            });
            run.start(cell).await;
        }

        let mut deltas = pin!(
            stream::iter(requests)
                .map(|request| {
                    let row = request.row_index;
                    self.model
                        .stream_completion(&request, cancel)
                        .map(move |delta| (row, delta))
                })
                .flatten_unordered(self.config.max_concurrency.max(1))
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RunState::Cancelled),
                next = deltas.next() => match next {
                    Some((row, delta)) => {
                        run.apply(row, delta).await?;
                    }
                    None => break,
                },
            }
        }

        run.finalize_remaining(Some(STREAM_ENDED)).await;
        Ok(RunState::Completed)
    }

    /// Examples from validated cells, with the row's referenced values as inputs.
    async fn validated_examples(&self, cells: &[Cell], references: &[ColumnId]) -> Result<Vec<Example>> {
        let mut examples = Vec::new();
        for cell in cells.iter().filter(|c| c.validated) {
            let Some(output) = cell.non_empty_value() else {
                continue;
            };
            let inputs = self
                .store
                .get_row_values(references, cell.row_index)
                .await?
                .into_iter()
                .filter(|v| !v.column_name.is_empty())
                .filter_map(|v| {
                    let value = v.value.filter(|value| !value.trim().is_empty())?;
                    Some((v.column_name, value))
                })
                .collect();
            examples.push(Example {
                output: output.to_string(),
                inputs,
                validated: true,
            });
        }
        Ok(examples)
    }

    async fn fetch_or_create(&self, column_id: ColumnId, row: u32) -> Result<Cell> {
        match self.store.get_cell_by_row_index(column_id, row).await? {
            Some(cell) => Ok(cell),
            None => self.store.create_cell(column_id, row).await,
        }
    }

    /// Gather sources for a search-enabled column. Failures other than
    /// configuration errors leave the run ungrounded.
    async fn prepare_sources(
        &self,
        dataset_id: DatasetId,
        process: &Process,
        cancel: &CancelSignal,
    ) -> Result<Option<&SourcePipeline>> {
        if !process.search_enabled {
            return Ok(None);
        }
        let Some(sources) = self.sources.as_deref() else {
            warn!("search enabled but no source pipeline configured");
            return Ok(None);
        };
        match sources.prepare(dataset_id, process, cancel).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "source preparation failed, continuing without new sources"),
        }
        Ok(Some(sources))
    }
}

async fn retrieve(
    sources: &SourcePipeline,
    dataset_id: DatasetId,
    query: &str,
) -> Option<Vec<RetrievedPassage>> {
    match sources.retrieve(dataset_id, query).await {
        Ok(passages) if !passages.is_empty() => Some(passages),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "retrieval failed, skipping");
            None
        }
    }
}

/// Cells of one run that are still generating, and the event sink.
struct Run<'a> {
    store: &'a dyn CellStore,
    events: &'a mpsc::Sender<GenerationEvent>,
    active: BTreeMap<u32, Cell>,
    state: RunState,
    finished: usize,
}

impl<'a> Run<'a> {
    fn new(store: &'a dyn CellStore, events: &'a mpsc::Sender<GenerationEvent>) -> Self {
        Self {
            store,
            events,
            active: BTreeMap::new(),
            state: RunState::Idle,
            finished: 0,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
    }

    async fn emit(&self, cell: &Cell) {
        if self.events.send(GenerationEvent::Cell(cell.clone())).await.is_err() {
            debug!(row = cell.row_index, "event receiver dropped");
        }
    }

    /// Clear the cell and mark it generating.
    async fn start(&mut self, mut cell: Cell) {
        cell.value = None;
        cell.error = None;
        cell.generating = true;
        self.emit(&cell).await;
        self.active.insert(cell.row_index, cell);
    }

    /// Apply a model update to a generating cell. On the final update the cell
    /// is persisted and returned.
    async fn apply(&mut self, row: u32, delta: CompletionDelta) -> Result<Option<Cell>> {
        let Some(cell) = self.active.get_mut(&row) else {
            return Ok(None);
        };
        if let Some(value) = delta.value {
            cell.value = Some(value);
        }
        if let Some(error) = delta.error {
            cell.error = Some(error);
        }
        if !delta.done {
            let snapshot = cell.clone();
            self.emit(&snapshot).await;
            return Ok(None);
        }

        let Some(mut cell) = self.active.remove(&row) else {
            return Ok(None);
        };
        cell.finish();
        self.store.update_cell(&cell).await?;
        self.emit(&cell).await;
        self.finished += 1;
        Ok(Some(cell))
    }

    /// Finish and persist every cell still generating. `reason` is recorded on
    /// cells that have neither a value nor an error.
    async fn finalize_remaining(&mut self, reason: Option<&str>) {
        for (row, mut cell) in std::mem::take(&mut self.active) {
            if cell.value.is_none() && cell.error.is_none() {
                cell.error = reason.map(str::to_string);
            }
            cell.finish();
            if let Err(e) = self.store.update_cell(&cell).await {
                warn!(row, error = %e, "failed to persist cell, skipping");
            }
            self.emit(&cell).await;
        }
    }
}
