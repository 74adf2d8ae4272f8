//! SQL migration definitions for the Cellforge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: datasets, columns, processes, cells",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS datasets (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS columns (
    id         TEXT PRIMARY KEY,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    name       TEXT NOT NULL,
    kind       TEXT NOT NULL,
    position   INTEGER NOT NULL,
    UNIQUE(dataset_id, name)
);

CREATE INDEX IF NOT EXISTS idx_columns_dataset ON columns(dataset_id);

-- One generation process per dynamic column
CREATE TABLE IF NOT EXISTS processes (
    id                 TEXT PRIMARY KEY,
    column_id          TEXT NOT NULL UNIQUE REFERENCES columns(id) ON DELETE CASCADE,
    instruction        TEXT NOT NULL,
    model_id           TEXT NOT NULL,
    provider_id        TEXT NOT NULL,
    columns_references TEXT NOT NULL DEFAULT '[]',
    row_offset         INTEGER NOT NULL DEFAULT 0,
    row_limit          INTEGER NOT NULL DEFAULT 0,
    search_enabled     INTEGER NOT NULL DEFAULT 0,
    updated_at         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cells (
    id         TEXT PRIMARY KEY,
    column_id  TEXT NOT NULL REFERENCES columns(id) ON DELETE CASCADE,
    row_index  INTEGER NOT NULL,
    value      TEXT,
    error      TEXT,
    generating INTEGER NOT NULL DEFAULT 0,
    validated  INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    UNIQUE(column_id, row_index)
);

CREATE INDEX IF NOT EXISTS idx_cells_column ON cells(column_id, row_index);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Per-dataset embedding index with FTS5 mirror",
            sql: r#"
CREATE TABLE IF NOT EXISTS embeddings (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    dataset_id TEXT NOT NULL,
    source_uri TEXT NOT NULL,
    text       TEXT NOT NULL,
    embedding  BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_source ON embeddings(dataset_id, source_uri);

CREATE VIRTUAL TABLE IF NOT EXISTS embeddings_fts USING fts5(
    text,
    content=embeddings,
    content_rowid=id
);

-- Triggers to keep FTS in sync with the embeddings table
CREATE TRIGGER IF NOT EXISTS embeddings_fts_insert AFTER INSERT ON embeddings BEGIN
    INSERT INTO embeddings_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TRIGGER IF NOT EXISTS embeddings_fts_delete AFTER DELETE ON embeddings BEGIN
    INSERT INTO embeddings_fts(embeddings_fts, rowid, text) VALUES ('delete', old.id, old.text);
END;

CREATE TRIGGER IF NOT EXISTS embeddings_fts_update AFTER UPDATE ON embeddings BEGIN
    INSERT INTO embeddings_fts(embeddings_fts, rowid, text) VALUES ('delete', old.id, old.text);
    INSERT INTO embeddings_fts(rowid, text) VALUES (new.id, new.text);
END;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
