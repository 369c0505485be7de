/*!
Per-table append-only JSONL logs of fine-grained mutations.

An append is one serialize plus one file write; after it resolves, the
entry survives process restart. The file itself is the ordering — the
timestamps inside entries are advisory.
*/
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::debug;

use crate::model::changelog::ChangeEntry;

use super::blobs::{BlobStore, CHANGELOG_DIR};

fn log_file_name(table_id: &str) -> String {
    format!("{}.jsonl", table_id)
}

/// Reads and writes the changelog files.
#[derive(Clone)]
pub struct ChangelogStore {
    blobs: Arc<BlobStore>,
}

impl ChangelogStore {
    /// A store over the given blobs.
    pub fn new(blobs: Arc<BlobStore>) -> Self {
        ChangelogStore { blobs }
    }

    /// Append one entry to its table's log.
    pub async fn append(&self, entry: &ChangeEntry) -> Result<()> {
        let line = entry.to_json_line()?;
        self.blobs
            .append_file(CHANGELOG_DIR, &log_file_name(entry.table_id()), line.into())
            .await?;
        debug!(table_id = entry.table_id(), "changelog append");
        Ok(())
    }

    /// All entries of a table's log, in append order. Blank lines are
    /// skipped; a table with no log reads as empty.
    pub async fn read_all(&self, table_id: &str) -> Result<Vec<ChangeEntry>> {
        let bytes = match self
            .blobs
            .read_file(CHANGELOG_DIR, &log_file_name(table_id))
            .await?
        {
            Some(bytes) => bytes,
            None => return Ok(Vec::new()),
        };
        let text = std::str::from_utf8(&bytes).context("changelog is not UTF-8")?;
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(ChangeEntry::from_json_line(line)?);
        }
        Ok(entries)
    }

    /// Delete a table's log. Idempotent.
    pub async fn clear(&self, table_id: &str) -> Result<()> {
        self.blobs
            .delete_file(CHANGELOG_DIR, &log_file_name(table_id))
            .await
    }

    /// Number of entries in a table's log, without parsing them.
    pub async fn count(&self, table_id: &str) -> Result<usize> {
        let bytes = match self
            .blobs
            .read_file(CHANGELOG_DIR, &log_file_name(table_id))
            .await?
        {
            Some(bytes) => bytes,
            None => return Ok(0),
        };
        Ok(bytes.iter().filter(|byte| **byte == b'\n').count())
    }

    /// Number of entries across every table's log.
    pub async fn total_count(&self) -> Result<usize> {
        let mut total = 0;
        for table_id in self.table_ids_with_entries().await? {
            total += self.count(&table_id).await?;
        }
        Ok(total)
    }

    /// Ids of tables that currently have a log on disk.
    pub async fn table_ids_with_entries(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.blobs.list_files(CHANGELOG_DIR, None).await? {
            if let Some(id) = entry.name.strip_suffix(".jsonl") {
                if entry.size > 0 {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use serde_json::json;

    use super::*;

    fn memory_store() -> ChangelogStore {
        ChangelogStore::new(Arc::new(BlobStore::new(Arc::new(InMemory::new()))))
    }

    #[tokio::test]
    async fn test_append_then_read_preserves_order() -> Result<()> {
        let store = memory_store();
        let first = ChangeEntry::cell_edit("t1", 100, "b", json!("x"), json!("y"));
        let second = ChangeEntry::cell_edit("t1", 100, "b", json!("y"), json!("z"));
        store.append(&first).await?;
        store.append(&second).await?;
        let entries = store.read_all("t1").await?;
        assert_eq!(entries, vec![first, second]);
        Ok(())
    }

    #[tokio::test]
    async fn test_counts_and_clear() -> Result<()> {
        let store = memory_store();
        store
            .append(&ChangeEntry::cell_edit("t1", 100, "a", json!(1), json!(2)))
            .await?;
        store
            .append(&ChangeEntry::cell_edit("t2", 100, "a", json!(1), json!(2)))
            .await?;
        store
            .append(&ChangeEntry::cell_edit("t2", 200, "a", json!(1), json!(2)))
            .await?;
        assert_eq!(store.count("t1").await?, 1);
        assert_eq!(store.count("t2").await?, 2);
        assert_eq!(store.total_count().await?, 3);
        let mut ids = store.table_ids_with_entries().await?;
        ids.sort();
        assert_eq!(ids, vec!["t1", "t2"]);
        store.clear("t2").await?;
        assert_eq!(store.count("t2").await?, 0);
        assert_eq!(store.total_count().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_log_reads_as_empty() -> Result<()> {
        let store = memory_store();
        assert!(store.read_all("missing").await?.is_empty());
        assert_eq!(store.count("missing").await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_legacy_untyped_lines_read_back() -> Result<()> {
        let store = memory_store();
        store
            .blobs
            .append_file(
                CHANGELOG_DIR,
                "t1.jsonl",
                Bytes::from_static(
                    b"{\"tableId\":\"t1\",\"ts\":1,\"rowId\":100,\"column\":\"b\",\"oldValue\":\"x\",\"newValue\":\"y\"}\n",
                ),
            )
            .await?;
        let entries = store.read_all("t1").await?;
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0], ChangeEntry::CellEdit { .. }));
        Ok(())
    }
}
