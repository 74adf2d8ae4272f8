//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding datasets, columns,
//! their generation processes, cells, and the per-dataset hybrid index
//! (see [`index`]).
//!
//! **Access rules:**
//! - Generation and indexing: read-write via [`Storage::open`]
//! - Ad-hoc queries: read-only via [`Storage::open_readonly`]

pub mod index;
mod migrations;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use cellforge_shared::{
    Cell, CellId, CellforgeError, Column, ColumnId, ColumnKind, Dataset, DatasetId, Process,
    ProcessId, Result, RowValue,
};
use libsql::{Connection, Database, params};
use tracing::{debug, info};

pub use index::{IndexHit, IndexRow, RRF_K};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CellforgeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CellforgeError::not_found(format!(
                "database {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CellforgeError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CellforgeError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Datasets
    // -----------------------------------------------------------------------

    pub async fn create_dataset(&self, name: &str) -> Result<Dataset> {
        self.check_writable()?;
        let dataset = Dataset {
            id: DatasetId::new(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.conn
            .execute(
                "INSERT INTO datasets (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![
                    dataset.id.to_string(),
                    dataset.name.as_str(),
                    timestamp(&dataset.created_at)
                ],
            )
            .await
            .map_err(storage_err)?;
        debug!(dataset_id = %dataset.id, name, "dataset created");
        Ok(dataset)
    }

    pub async fn get_dataset(&self, id: DatasetId) -> Result<Option<Dataset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, created_at FROM datasets WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_dataset(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// All datasets, newest first.
    pub async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, created_at FROM datasets ORDER BY created_at DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_dataset(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Columns and processes
    // -----------------------------------------------------------------------

    /// Add a column to a dataset, persisting its process when present.
    pub async fn create_column(
        &self,
        dataset_id: DatasetId,
        name: &str,
        kind: ColumnKind,
        process: Option<Process>,
    ) -> Result<Column> {
        self.check_writable()?;
        let column = Column {
            id: ColumnId::new(),
            dataset_id,
            name: name.to_string(),
            kind,
            process,
        };
        self.conn
            .execute(
                "INSERT INTO columns (id, dataset_id, name, kind, position)
                 VALUES (?1, ?2, ?3, ?4,
                         (SELECT COUNT(*) FROM columns WHERE dataset_id = ?2))",
                params![
                    column.id.to_string(),
                    dataset_id.to_string(),
                    column.name.as_str(),
                    kind.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;

        if let Some(process) = &column.process {
            self.update_process(column.id, process).await?;
        }
        Ok(column)
    }

    pub async fn get_column(&self, id: ColumnId) -> Result<Option<Column>> {
        let sql = format!("{COLUMN_SELECT} WHERE c.id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![id.to_string()])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_column(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Columns of a dataset in creation order.
    pub async fn list_columns(&self, dataset_id: DatasetId) -> Result<Vec<Column>> {
        let sql = format!("{COLUMN_SELECT} WHERE c.dataset_id = ?1 ORDER BY c.position");
        let mut rows = self
            .conn
            .query(&sql, params![dataset_id.to_string()])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_column(&row)?);
        }
        Ok(results)
    }

    /// Insert or replace the process attached to `column_id`.
    pub async fn update_process(&self, column_id: ColumnId, process: &Process) -> Result<()> {
        self.check_writable()?;
        let references = serde_json::to_string(&process.columns_references)
            .map_err(|e| CellforgeError::Storage(format!("encode references: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO processes (id, column_id, instruction, model_id, provider_id,
                                        columns_references, row_offset, row_limit,
                                        search_enabled, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(column_id) DO UPDATE SET
                    instruction = excluded.instruction,
                    model_id = excluded.model_id,
                    provider_id = excluded.provider_id,
                    columns_references = excluded.columns_references,
                    row_offset = excluded.row_offset,
                    row_limit = excluded.row_limit,
                    search_enabled = excluded.search_enabled,
                    updated_at = excluded.updated_at",
                params![
                    process.id.to_string(),
                    column_id.to_string(),
                    process.instruction.as_str(),
                    process.model_id.as_str(),
                    process.provider_id.as_str(),
                    references,
                    process.row_offset,
                    process.row_limit,
                    i64::from(process.search_enabled),
                    timestamp(&process.updated_at)
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cells
    // -----------------------------------------------------------------------

    /// Create an empty cell at `row_index`.
    pub async fn create_cell(&self, column_id: ColumnId, row_index: u32) -> Result<Cell> {
        let cell = Cell::new(column_id, row_index);
        self.update_cell(&cell).await?;
        Ok(cell)
    }

    pub async fn get_cell_by_row_index(
        &self,
        column_id: ColumnId,
        row_index: u32,
    ) -> Result<Option<Cell>> {
        let sql = format!("{CELL_SELECT} WHERE column_id = ?1 AND row_index = ?2");
        let mut rows = self
            .conn
            .query(&sql, params![column_id.to_string(), row_index])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_cell(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Persist a cell. The `(column_id, row_index)` slot is upserted; last
    /// writer wins.
    pub async fn update_cell(&self, cell: &Cell) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO cells (id, column_id, row_index, value, error, generating,
                                    validated, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(column_id, row_index) DO UPDATE SET
                    value = excluded.value,
                    error = excluded.error,
                    generating = excluded.generating,
                    validated = excluded.validated,
                    updated_at = excluded.updated_at",
                params![
                    cell.id.to_string(),
                    cell.column_id.to_string(),
                    cell.row_index,
                    cell.value.as_deref(),
                    cell.error.as_deref(),
                    i64::from(cell.generating),
                    i64::from(cell.validated),
                    timestamp(&cell.updated_at)
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Cells of a column ordered by row.
    pub async fn list_cells(&self, column_id: ColumnId) -> Result<Vec<Cell>> {
        let sql = format!("{CELL_SELECT} WHERE column_id = ?1 ORDER BY row_index");
        let mut rows = self
            .conn
            .query(&sql, params![column_id.to_string()])
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_cell(&row)?);
        }
        Ok(results)
    }

    /// The values of `column_ids` at `row_index`, in the given order. Columns
    /// without a cell at that row yield an empty [`RowValue`].
    pub async fn get_row_values(
        &self,
        column_ids: &[ColumnId],
        row_index: u32,
    ) -> Result<Vec<RowValue>> {
        let mut values = Vec::with_capacity(column_ids.len());
        for column_id in column_ids {
            let mut rows = self
                .conn
                .query(
                    "SELECT c.name, cell.value, cell.updated_at
                     FROM columns c
                     LEFT JOIN cells cell
                       ON cell.column_id = c.id AND cell.row_index = ?2
                     WHERE c.id = ?1",
                    params![column_id.to_string(), row_index],
                )
                .await
                .map_err(storage_err)?;

            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => {
                    return Err(CellforgeError::not_found(format!("column {column_id}")));
                }
                Err(e) => return Err(storage_err(e)),
            };

            let updated_at = match row.get::<String>(2).ok() {
                Some(s) => Some(parse_timestamp(&s)?),
                None => None,
            };
            values.push(RowValue {
                column_id: *column_id,
                column_name: row.get::<String>(0).map_err(storage_err)?,
                value: row.get::<String>(1).ok(),
                updated_at,
            });
        }
        Ok(values)
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

const COLUMN_SELECT: &str = "SELECT c.id, c.dataset_id, c.name, c.kind,
        p.id, p.instruction, p.model_id, p.provider_id, p.columns_references,
        p.row_offset, p.row_limit, p.search_enabled, p.updated_at
     FROM columns c
     LEFT JOIN processes p ON p.column_id = c.id";

const CELL_SELECT: &str = "SELECT id, column_id, row_index, value, error, generating,
        validated, updated_at
     FROM cells";

pub(crate) fn storage_err(e: libsql::Error) -> CellforgeError {
    CellforgeError::Storage(e.to_string())
}

/// RFC 3339 with nanoseconds, so freshness comparisons survive a round trip.
pub(crate) fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CellforgeError::Storage(format!("invalid date: {e}")))
}

fn parse_id<T>(s: &str) -> Result<T>
where
    T: FromStr<Err = uuid::Error>,
{
    s.parse()
        .map_err(|e| CellforgeError::Storage(format!("invalid id {s}: {e}")))
}

fn row_to_dataset(row: &libsql::Row) -> Result<Dataset> {
    Ok(Dataset {
        id: parse_id(&row.get::<String>(0).map_err(storage_err)?)?,
        name: row.get::<String>(1).map_err(storage_err)?,
        created_at: parse_timestamp(&row.get::<String>(2).map_err(storage_err)?)?,
    })
}

fn row_to_column(row: &libsql::Row) -> Result<Column> {
    let kind: String = row.get(3).map_err(storage_err)?;
    let kind = ColumnKind::from_str(&kind).map_err(CellforgeError::Storage)?;

    let process = match row.get::<String>(4).ok() {
        Some(process_id) => {
            let references: String = row.get(8).map_err(storage_err)?;
            let columns_references: Vec<ColumnId> = serde_json::from_str(&references)
                .map_err(|e| CellforgeError::Storage(format!("decode references: {e}")))?;
            Some(Process {
                id: parse_id::<ProcessId>(&process_id)?,
                instruction: row.get::<String>(5).map_err(storage_err)?,
                model_id: row.get::<String>(6).map_err(storage_err)?,
                provider_id: row.get::<String>(7).map_err(storage_err)?,
                columns_references,
                row_offset: row.get::<u32>(9).map_err(storage_err)?,
                row_limit: row.get::<u32>(10).map_err(storage_err)?,
                search_enabled: row.get::<i64>(11).map_err(storage_err)? != 0,
                updated_at: parse_timestamp(&row.get::<String>(12).map_err(storage_err)?)?,
            })
        }
        None => None,
    };

    Ok(Column {
        id: parse_id(&row.get::<String>(0).map_err(storage_err)?)?,
        dataset_id: parse_id(&row.get::<String>(1).map_err(storage_err)?)?,
        name: row.get::<String>(2).map_err(storage_err)?,
        kind,
        process,
    })
}

fn row_to_cell(row: &libsql::Row) -> Result<Cell> {
    Ok(Cell {
        id: parse_id::<CellId>(&row.get::<String>(0).map_err(storage_err)?)?,
        column_id: parse_id(&row.get::<String>(1).map_err(storage_err)?)?,
        row_index: row.get::<u32>(2).map_err(storage_err)?,
        value: row.get::<String>(3).ok(),
        error: row.get::<String>(4).ok(),
        generating: row.get::<i64>(5).map_err(storage_err)? != 0,
        validated: row.get::<i64>(6).map_err(storage_err)? != 0,
        updated_at: parse_timestamp(&row.get::<String>(7).map_err(storage_err)?)?,
    })
}
