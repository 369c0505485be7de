/*!
An in-memory [SqlEngine], the reference implementation of the contract and
the engine the test suite runs against. Tables are row vectors kept ordered
by `_cs_id`; shard payloads are JSON frames.
*/
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::model::{row_cs_id, CellValue, Row, CS_ID_COLUMN};

use super::{ExportedShard, ImportedShard, SqlEngine};

#[derive(Clone, Debug, Default)]
struct MemTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl MemTable {
    fn sort(&mut self) {
        self.rows
            .sort_by_key(|row| row_cs_id(row).unwrap_or(i64::MAX));
    }
}

/// The shard encoding of the in-memory engine. A production adapter would
/// emit Arrow IPC here; the store treats either as opaque bytes.
#[derive(Serialize, Deserialize)]
struct ShardFrame {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// In-memory implementation of [SqlEngine].
#[derive(Debug, Default)]
pub struct MemoryEngine {
    tables: Mutex<HashMap<String, MemTable>>,
}

impl MemoryEngine {
    /// A fresh engine with no tables.
    pub fn new() -> Self {
        MemoryEngine::default()
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&MemTable) -> T) -> Result<T> {
        let tables = self.tables.lock().expect("engine lock poisoned");
        let found = tables
            .get(table)
            .with_context(|| format!("no such table: {}", table))?;
        Ok(f(found))
    }

    fn with_table_mut<T>(&self, table: &str, f: impl FnOnce(&mut MemTable) -> T) -> Result<T> {
        let mut tables = self.tables.lock().expect("engine lock poisoned");
        let found = tables
            .get_mut(table)
            .with_context(|| format!("no such table: {}", table))?;
        Ok(f(found))
    }
}

#[async_trait]
impl SqlEngine for MemoryEngine {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .expect("engine lock poisoned")
            .contains_key(table))
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .expect("engine lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_table(&self, table: &str, columns: &[String]) -> Result<()> {
        let mut tables = self.tables.lock().expect("engine lock poisoned");
        if tables.contains_key(table) {
            return Err(anyhow!("table already exists: {}", table));
        }
        tables.insert(
            table.to_string(),
            MemTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.tables
            .lock()
            .expect("engine lock poisoned")
            .remove(table);
        Ok(())
    }

    async fn duplicate_table(&self, source: &str, target: &str) -> Result<()> {
        let mut tables = self.tables.lock().expect("engine lock poisoned");
        let copy = tables
            .get(source)
            .with_context(|| format!("no such table: {}", source))?
            .clone();
        tables.insert(target.to_string(), copy);
        Ok(())
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>> {
        self.with_table(table, |found| found.columns.clone())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.with_table(table, |found| found.rows.len() as u64)
    }

    async fn max_cs_id(&self, table: &str) -> Result<Option<i64>> {
        self.with_table(table, |found| {
            found.rows.iter().filter_map(row_cs_id).max()
        })
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Row>> {
        self.with_table(table, |found| found.rows.clone())
    }

    async fn read_rows_by_ids(&self, table: &str, cs_ids: &[i64]) -> Result<Vec<Row>> {
        let wanted: std::collections::HashSet<i64> = cs_ids.iter().copied().collect();
        self.with_table(table, |found| {
            found
                .rows
                .iter()
                .filter(|row| row_cs_id(row).map(|id| wanted.contains(&id)).unwrap_or(false))
                .cloned()
                .collect()
        })
    }

    async fn read_cell(
        &self,
        table: &str,
        cs_id: i64,
        column: &str,
    ) -> Result<Option<CellValue>> {
        self.with_table(table, |found| {
            found
                .rows
                .iter()
                .find(|row| row_cs_id(row) == Some(cs_id))
                .map(|row| row.get(column).cloned().unwrap_or(CellValue::Null))
        })
    }

    async fn append_rows(&self, table: &str, rows: Vec<Row>) -> Result<()> {
        self.with_table_mut(table, |found| {
            for row in rows {
                for column in row.keys() {
                    if !found.columns.contains(column) {
                        found.columns.push(column.clone());
                    }
                }
                found.rows.push(row);
            }
            found.sort();
        })
    }

    async fn update_cell(
        &self,
        table: &str,
        cs_id: i64,
        column: &str,
        value: &CellValue,
    ) -> Result<u64> {
        if !self.columns(table).await?.contains(&column.to_string()) {
            return Err(anyhow!("no such column: {}.{}", table, column));
        }
        self.with_table_mut(table, |found| {
            match found
                .rows
                .iter_mut()
                .find(|row| row_cs_id(row) == Some(cs_id))
            {
                Some(row) => {
                    row.insert(column.to_string(), value.clone());
                    1
                }
                None => 0,
            }
        })
    }

    async fn apply_value_map(
        &self,
        table: &str,
        column: &str,
        mapping: &[(CellValue, CellValue)],
    ) -> Result<u64> {
        self.with_table_mut(table, |found| {
            let mut changed = 0;
            for row in found.rows.iter_mut() {
                let current = row.get(column).cloned().unwrap_or(CellValue::Null);
                if let Some((_, to)) = mapping.iter().find(|(from, _)| *from == current) {
                    if *to != current {
                        row.insert(column.to_string(), to.clone());
                        changed += 1;
                    }
                }
            }
            changed
        })
    }

    async fn delete_rows(&self, table: &str, cs_ids: &[i64]) -> Result<u64> {
        let doomed: std::collections::HashSet<i64> = cs_ids.iter().copied().collect();
        self.with_table_mut(table, |found| {
            let before = found.rows.len();
            found.rows.retain(|row| {
                row_cs_id(row)
                    .map(|id| !doomed.contains(&id))
                    .unwrap_or(true)
            });
            (before - found.rows.len()) as u64
        })
    }

    async fn shift_cs_ids(&self, table: &str, min_cs_id: i64, delta: i64) -> Result<u64> {
        self.with_table_mut(table, |found| {
            let mut shifted = 0;
            for row in found.rows.iter_mut() {
                if let Some(id) = row_cs_id(row) {
                    if id >= min_cs_id {
                        row.insert(CS_ID_COLUMN.to_string(), CellValue::from(id + delta));
                        shifted += 1;
                    }
                }
            }
            found.sort();
            shifted
        })
    }

    async fn export_shards(
        &self,
        table: &str,
        shard_rows: usize,
    ) -> Result<BoxStream<'static, Result<ExportedShard>>> {
        let (columns, rows) =
            self.with_table(table, |found| (found.columns.clone(), found.rows.clone()))?;
        let mut shards = Vec::new();
        for chunk in rows.chunks(shard_rows.max(1)) {
            let frame = ShardFrame {
                columns: columns.clone(),
                rows: chunk.to_vec(),
            };
            let encoded = serde_json::to_vec(&frame)?;
            let ids: Vec<i64> = chunk.iter().filter_map(row_cs_id).collect();
            shards.push(Ok(ExportedShard {
                bytes: Bytes::from(encoded),
                row_count: chunk.len() as u64,
                min_cs_id: ids.iter().copied().min().unwrap_or(0),
                max_cs_id: ids.iter().copied().max().unwrap_or(0),
            }));
        }
        Ok(Box::pin(futures::stream::iter(shards)))
    }

    async fn import_shard(&self, table: &str, bytes: Bytes) -> Result<ImportedShard> {
        let frame: ShardFrame =
            serde_json::from_slice(&bytes).context("shard payload is not a valid frame")?;
        let ids: Vec<i64> = frame.rows.iter().filter_map(row_cs_id).collect();
        let imported = ImportedShard {
            row_count: frame.rows.len() as u64,
            min_cs_id: ids.iter().copied().min(),
            max_cs_id: ids.iter().copied().max(),
        };
        let mut tables = self.tables.lock().expect("engine lock poisoned");
        let target = tables.entry(table.to_string()).or_insert_with(|| MemTable {
            columns: frame.columns.clone(),
            rows: Vec::new(),
        });
        for column in &frame.columns {
            if !target.columns.contains(column) {
                target.columns.push(column.clone());
            }
        }
        target.rows.extend(frame.rows);
        target.sort();
        Ok(imported)
    }

    async fn checkpoint(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        Err(anyhow!(
            "the in-memory engine does not interpret SQL (statement: {})",
            sql
        ))
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        Err(anyhow!(
            "the in-memory engine does not interpret SQL (query: {})",
            sql
        ))
    }
}


#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use serde_json::json;

    use super::test_support::seed_table;
    use super::*;

    #[tokio::test]
    async fn test_export_splits_into_shards_ordered_by_cs_id() -> Result<()> {
        let engine = MemoryEngine::new();
        let values: Vec<Vec<CellValue>> = (0..5).map(|n| vec![json!(n)]).collect();
        seed_table(&engine, "t", &["n"], &values).await?;
        let shards: Vec<ExportedShard> =
            engine.export_shards("t", 2).await?.try_collect().await?;
        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].row_count, 2);
        assert_eq!(shards[0].min_cs_id, 100);
        assert_eq!(shards[0].max_cs_id, 200);
        assert_eq!(shards[2].row_count, 1);
        assert!(shards[1].min_cs_id > shards[0].max_cs_id);
        Ok(())
    }

    #[tokio::test]
    async fn test_import_appends_and_reorders() -> Result<()> {
        let engine = MemoryEngine::new();
        seed_table(&engine, "src", &["n"], &[vec![json!(1)], vec![json!(2)]]).await?;
        let shards: Vec<ExportedShard> =
            engine.export_shards("src", 1).await?.try_collect().await?;
        // Import out of order; the engine keeps _cs_id order.
        engine.import_shard("dst", shards[1].bytes.clone()).await?;
        let imported = engine.import_shard("dst", shards[0].bytes.clone()).await?;
        assert_eq!(imported.row_count, 1);
        let rows = engine.read_rows("dst").await?;
        assert_eq!(row_cs_id(&rows[0]), Some(100));
        assert_eq!(row_cs_id(&rows[1]), Some(200));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_cell_rejects_missing_column() -> Result<()> {
        let engine = MemoryEngine::new();
        seed_table(&engine, "t", &["a"], &[vec![json!("x")]]).await?;
        assert_eq!(engine.update_cell("t", 100, "a", &json!("y")).await?, 1);
        assert_eq!(engine.update_cell("t", 999, "a", &json!("y")).await?, 0);
        assert!(engine.update_cell("t", 100, "gone", &json!("y")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_shift_makes_room_for_insertion() -> Result<()> {
        let engine = MemoryEngine::new();
        seed_table(&engine, "t", &["a"], &[vec![json!(1)], vec![json!(2)]]).await?;
        engine.shift_cs_ids("t", 200, 100).await?;
        let mut row = Row::new();
        row.insert(CS_ID_COLUMN.to_string(), json!(200));
        row.insert("a".to_string(), json!(99));
        engine.append_rows("t", vec![row]).await?;
        let ids: Vec<i64> = engine
            .read_rows("t")
            .await?
            .iter()
            .filter_map(row_cs_id)
            .collect();
        assert_eq!(ids, vec![100, 200, 300]);
        Ok(())
    }

    #[tokio::test]
    async fn test_value_map_changes_matching_rows() -> Result<()> {
        let engine = MemoryEngine::new();
        seed_table(
            &engine,
            "t",
            &["state"],
            &[vec![json!("calif.")], vec![json!("CA")], vec![json!("calif.")]],
        )
        .await?;
        let changed = engine
            .apply_value_map("t", "state", &[(json!("calif."), json!("CA"))])
            .await?;
        assert_eq!(changed, 2);
        Ok(())
    }
}
