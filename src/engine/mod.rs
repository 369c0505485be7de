/*!
The contract of the embedded analytical engine that holds live tables.

The core never interprets table data itself: shard payloads are opaque bytes
produced and consumed only by the engine (Arrow IPC in a production adapter,
a JSON frame in [MemoryEngine](memory::MemoryEngine)). Everything the core
needs from the engine — table DDL, ordered shard export/import, cell and row
mutations, introspection — is a method here, so the rest of the crate is
testable against the in-memory implementation, in the same way
[object_store] ships `memory::InMemory` for its own contract.
*/
use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::model::{CellValue, Row};

pub mod memory;

/// One shard pulled out of the engine during an ordered export.
#[derive(Clone, Debug)]
pub struct ExportedShard {
    /// The encoded shard. Opaque outside the engine.
    pub bytes: Bytes,
    /// Rows in the shard.
    pub row_count: u64,
    /// Smallest `_cs_id` in the shard.
    pub min_cs_id: i64,
    /// Largest `_cs_id` in the shard.
    pub max_cs_id: i64,
}

/// What an engine reports after ingesting one shard.
#[derive(Clone, Copy, Debug)]
pub struct ImportedShard {
    /// Rows ingested from the shard.
    pub row_count: u64,
    /// Smallest `_cs_id` ingested, if the shard had rows.
    pub min_cs_id: Option<i64>,
    /// Largest `_cs_id` ingested, if the shard had rows.
    pub max_cs_id: Option<i64>,
}

/// The embedded analytical engine: named tables, ordered shard export and
/// import, and the typed mutations the core replays.
///
/// A production adapter is expected to provide MVCC-consistent reads during
/// an in-flight export, so a live table can be exported without duplicating
/// it first.
#[async_trait]
pub trait SqlEngine: Send + Sync {
    /// Whether a table with this name exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Names of all tables currently in the engine.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Create an empty table with the given columns.
    async fn create_table(&self, table: &str, columns: &[String]) -> Result<()>;

    /// Drop a table. Dropping a missing table is not an error.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Duplicate a table under a new name, replacing any existing target.
    async fn duplicate_table(&self, source: &str, target: &str) -> Result<()>;

    /// Column names of a table, reserved columns included.
    async fn columns(&self, table: &str) -> Result<Vec<String>>;

    /// Number of rows in a table.
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Largest `_cs_id` in a table, None when empty.
    async fn max_cs_id(&self, table: &str) -> Result<Option<i64>>;

    /// All rows of a table, ordered by `_cs_id`. Only call on tables known
    /// to be at most one shard long.
    async fn read_rows(&self, table: &str) -> Result<Vec<Row>>;

    /// The rows whose `_cs_id` is in `cs_ids`, ordered by `_cs_id`.
    async fn read_rows_by_ids(&self, table: &str, cs_ids: &[i64]) -> Result<Vec<Row>>;

    /// One cell, or None when no row has that `_cs_id`.
    async fn read_cell(&self, table: &str, cs_id: i64, column: &str)
        -> Result<Option<CellValue>>;

    /// Append rows. The engine keeps the table ordered by `_cs_id`.
    async fn append_rows(&self, table: &str, rows: Vec<Row>) -> Result<()>;

    /// Set one cell by `_cs_id`. Returns how many rows matched (0 or 1).
    async fn update_cell(
        &self,
        table: &str,
        cs_id: i64,
        column: &str,
        value: &CellValue,
    ) -> Result<u64>;

    /// Apply a from → to value mapping over one column. Returns rows
    /// changed.
    async fn apply_value_map(
        &self,
        table: &str,
        column: &str,
        mapping: &[(CellValue, CellValue)],
    ) -> Result<u64>;

    /// Delete rows by `_cs_id`. Returns rows deleted.
    async fn delete_rows(&self, table: &str, cs_ids: &[i64]) -> Result<u64>;

    /// Add `delta` to every `_cs_id` at or above `min_cs_id`, making room
    /// for an insertion. Returns rows shifted.
    async fn shift_cs_ids(&self, table: &str, min_cs_id: i64, delta: i64) -> Result<u64>;

    /// Export a table ordered by `_cs_id` as a stream of shards of at most
    /// `shard_rows` rows each. An empty table yields an empty stream.
    async fn export_shards(
        &self,
        table: &str,
        shard_rows: usize,
    ) -> Result<BoxStream<'static, Result<ExportedShard>>>;

    /// Ingest one shard into a table, creating it when absent, appending
    /// when present.
    async fn import_shard(&self, table: &str, bytes: Bytes) -> Result<ImportedShard>;

    /// Release buffer-pool memory.
    async fn checkpoint(&self) -> Result<()>;

    /// Run a statement the core does not need to understand.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Run a query the core does not need to understand.
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;
}

/// Runs transforms on behalf of the timeline during replay. Transform
/// execution lives outside the core; the application layer registers the
/// same runner the original operation went through.
#[async_trait]
pub trait TransformRunner: Send + Sync {
    /// Re-run a recorded transform against a live table.
    async fn run_transform(
        &self,
        table: &str,
        transform_type: &str,
        column: Option<&str>,
        options: &BTreeMap<String, CellValue>,
    ) -> Result<()>;
}

/// Serializes structural operations (combines, transform application,
/// snapshot restores) against the engine so schema changes never
/// interleave.
#[derive(Debug, Default)]
pub struct SqlGate {
    inner: tokio::sync::Mutex<()>,
}

impl SqlGate {
    /// A fresh, unlocked gate.
    pub fn new() -> Self {
        SqlGate::default()
    }

    /// Hold the gate for the duration of a structural operation.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}
