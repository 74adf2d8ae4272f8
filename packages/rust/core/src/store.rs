//! The persistence contract used by generation and the auto-dataset runner.

use async_trait::async_trait;

use cellforge_shared::{
    Cell, Column, ColumnId, ColumnKind, Dataset, DatasetId, Process, Result, RowValue,
};
use cellforge_storage::Storage;

/// Read/write access to datasets, columns, and cells. Writes are
/// last-writer-wins.
#[async_trait]
pub trait CellStore: Send + Sync {
    async fn create_cell(&self, column_id: ColumnId, row_index: u32) -> Result<Cell>;

    async fn get_cell_by_row_index(
        &self,
        column_id: ColumnId,
        row_index: u32,
    ) -> Result<Option<Cell>>;

    async fn update_cell(&self, cell: &Cell) -> Result<()>;

    /// Values of `column_ids` at `row_index`, in the given order.
    async fn get_row_values(
        &self,
        column_ids: &[ColumnId],
        row_index: u32,
    ) -> Result<Vec<RowValue>>;

    async fn update_process(&self, column_id: ColumnId, process: &Process) -> Result<()>;

    async fn list_cells(&self, column_id: ColumnId) -> Result<Vec<Cell>>;

    async fn get_column(&self, column_id: ColumnId) -> Result<Option<Column>>;

    async fn create_dataset(&self, name: &str) -> Result<Dataset>;

    async fn create_column(
        &self,
        dataset_id: DatasetId,
        name: &str,
        kind: ColumnKind,
        process: Option<Process>,
    ) -> Result<Column>;

    async fn list_columns(&self, dataset_id: DatasetId) -> Result<Vec<Column>>;
}

#[async_trait]
impl CellStore for Storage {
    async fn create_cell(&self, column_id: ColumnId, row_index: u32) -> Result<Cell> {
        Storage::create_cell(self, column_id, row_index).await
    }

    async fn get_cell_by_row_index(
        &self,
        column_id: ColumnId,
        row_index: u32,
    ) -> Result<Option<Cell>> {
        Storage::get_cell_by_row_index(self, column_id, row_index).await
    }

    async fn update_cell(&self, cell: &Cell) -> Result<()> {
        Storage::update_cell(self, cell).await
    }

    async fn get_row_values(
        &self,
        column_ids: &[ColumnId],
        row_index: u32,
    ) -> Result<Vec<RowValue>> {
        Storage::get_row_values(self, column_ids, row_index).await
    }

    async fn update_process(&self, column_id: ColumnId, process: &Process) -> Result<()> {
        Storage::update_process(self, column_id, process).await
    }

    async fn list_cells(&self, column_id: ColumnId) -> Result<Vec<Cell>> {
        Storage::list_cells(self, column_id).await
    }

    async fn get_column(&self, column_id: ColumnId) -> Result<Option<Column>> {
        Storage::get_column(self, column_id).await
    }

    async fn create_dataset(&self, name: &str) -> Result<Dataset> {
        Storage::create_dataset(self, name).await
    }

    async fn create_column(
        &self,
        dataset_id: DatasetId,
        name: &str,
        kind: ColumnKind,
        process: Option<Process>,
    ) -> Result<Column> {
        Storage::create_column(self, dataset_id, name, kind, process).await
    }

    async fn list_columns(&self, dataset_id: DatasetId) -> Result<Vec<Column>> {
        Storage::list_columns(self, dataset_id).await
    }
}
