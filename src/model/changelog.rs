/*!
Changelog entries: the fine-grained mutations journaled between snapshots.

One JSON object per line on disk, discriminated by a `type` field. Entries
are totally ordered by append position within a table's log; the timestamp
is advisory.
*/
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CellValue, Row};

/// One journaled mutation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEntry {
    /// A single cell changed value.
    #[serde(rename_all = "camelCase")]
    CellEdit {
        /// Table the edit belongs to.
        table_id: String,
        /// Milliseconds since the epoch. Advisory.
        ts: i64,
        /// `_cs_id` of the edited row.
        row_id: i64,
        /// Edited column.
        column: String,
        /// Value before the edit.
        old_value: CellValue,
        /// Value after the edit.
        new_value: CellValue,
    },
    /// A blank row was inserted; its values arrive as later cell edits.
    #[serde(rename_all = "camelCase")]
    InsertRow {
        /// Table the row was inserted into.
        table_id: String,
        /// Milliseconds since the epoch. Advisory.
        ts: i64,
        /// `_cs_id` assigned to the new row.
        cs_id: i64,
        /// `_cs_origin_id` assigned to the new row.
        origin_id: String,
        /// Row after which the insertion happened, if not at the end.
        insert_after_cs_id: Option<i64>,
        /// Column names at insertion time.
        column_names: Vec<String>,
    },
    /// Rows were deleted, values retained for undo.
    #[serde(rename_all = "camelCase")]
    DeleteRow {
        /// Table the rows were deleted from.
        table_id: String,
        /// Milliseconds since the epoch. Advisory.
        ts: i64,
        /// `_cs_id`s of the deleted rows.
        cs_ids: Vec<i64>,
        /// Full deleted rows, in `cs_ids` order.
        deleted_rows: Vec<Row>,
        /// Column names at deletion time.
        column_names: Vec<String>,
    },
}

impl ChangeEntry {
    /// The table this entry belongs to.
    pub fn table_id(&self) -> &str {
        match self {
            ChangeEntry::CellEdit { table_id, .. } => table_id,
            ChangeEntry::InsertRow { table_id, .. } => table_id,
            ChangeEntry::DeleteRow { table_id, .. } => table_id,
        }
    }

    /// A cell-edit entry stamped with the current time.
    pub fn cell_edit(
        table_id: &str,
        row_id: i64,
        column: &str,
        old_value: CellValue,
        new_value: CellValue,
    ) -> Self {
        ChangeEntry::CellEdit {
            table_id: table_id.to_string(),
            ts: Utc::now().timestamp_millis(),
            row_id,
            column: column.to_string(),
            old_value,
            new_value,
        }
    }

    /// Parse one changelog line. Entries written before the `type`
    /// discriminator existed are read as cell edits.
    pub fn from_json_line(line: &str) -> Result<ChangeEntry> {
        let mut value: Value =
            serde_json::from_str(line).context("changelog line is not valid JSON")?;
        if let Some(object) = value.as_object_mut() {
            if !object.contains_key("type") {
                object.insert("type".to_string(), Value::String("cell_edit".to_string()));
            }
        }
        serde_json::from_value(value).context("changelog line does not match any entry shape")
    }

    /// Serialize to one JSONL line, newline included.
    pub fn to_json_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_tagged_round_trip() -> Result<()> {
        let entry = ChangeEntry::cell_edit("t1", 100, "b", json!("x"), json!("y"));
        let line = entry.to_json_line()?;
        assert!(line.contains("\"type\":\"cell_edit\""));
        assert_eq!(ChangeEntry::from_json_line(line.trim())?, entry);
        Ok(())
    }

    #[test]
    fn test_legacy_untyped_line_reads_as_cell_edit() -> Result<()> {
        let line = r#"{"tableId":"t1","ts":1,"rowId":100,"column":"b","oldValue":"x","newValue":"y"}"#;
        match ChangeEntry::from_json_line(line)? {
            ChangeEntry::CellEdit { row_id, column, .. } => {
                assert_eq!(row_id, 100);
                assert_eq!(column, "b");
            }
            other => panic!("expected cell edit, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_delete_row_retains_values() -> Result<()> {
        let mut row = Row::new();
        row.insert("_cs_id".to_string(), json!(100));
        row.insert("a".to_string(), json!("kept"));
        let entry = ChangeEntry::DeleteRow {
            table_id: "t1".to_string(),
            ts: 2,
            cs_ids: vec![100],
            deleted_rows: vec![row],
            column_names: vec!["a".to_string()],
        };
        let parsed = ChangeEntry::from_json_line(entry.to_json_line()?.trim())?;
        assert_eq!(parsed, entry);
        Ok(())
    }
}
