/*!
Timeline commands: every user operation, recorded as an immutable value.

[TimelineParams] is the sum type over operation kinds; replay dispatches on
it exhaustively. Structural operations that rewrite the whole table are
*expensive* — a step snapshot is taken before they run.
*/
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CellValue, Row};

/// Transform kinds that rewrite enough of the table to warrant a step
/// snapshot before they run.
pub const EXPENSIVE_TRANSFORM_TYPES: &[&str] = &[
    "remove_duplicates",
    "fill_down",
    "split_column",
    "merge_columns",
    "custom_sql",
];

/// The join flavors the combine engine executes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    /// Rows present on both sides.
    Inner,
    /// All left rows, right padded with NULL.
    Left,
    /// All rows from both sides.
    Full,
}

/// One cell change within a batch edit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CellChange {
    /// `_cs_id` of the changed row.
    pub row_id: i64,
    /// Changed column.
    pub column: String,
    /// Value before.
    pub previous_value: CellValue,
    /// Value after.
    pub new_value: CellValue,
}

/// One from → to pair of a standardize operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueMapping {
    /// Value to replace.
    pub from: CellValue,
    /// Replacement.
    pub to: CellValue,
}

/// Parameters of each user operation kind.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineParams {
    /// A named transform, re-run verbatim on replay.
    #[serde(rename_all = "camelCase")]
    Transform {
        /// Transform kind, e.g. `trim_whitespace`.
        transform_type: String,
        /// Column the transform applies to, if single-column.
        column: Option<String>,
        /// Free-form options the transform runner understands.
        options: BTreeMap<String, CellValue>,
    },
    /// A single cell edit. Self-inverse; undo/redo take the fast path.
    #[serde(rename_all = "camelCase")]
    ManualEdit {
        /// `_cs_id` of the edited row.
        row_id: i64,
        /// Edited column.
        column: String,
        /// Value before.
        previous_value: CellValue,
        /// Value after.
        new_value: CellValue,
    },
    /// Many cell edits applied together.
    #[serde(rename_all = "camelCase")]
    BatchEdit {
        /// The individual changes.
        edits: Vec<CellChange>,
    },
    /// A stored from-value → to-value mapping over one column.
    #[serde(rename_all = "camelCase")]
    Standardize {
        /// Column the mapping applies to.
        column: String,
        /// The mapping, applied in order.
        mapping: Vec<ValueMapping>,
    },
    /// Rows merged away (deduplication); replay deletes them again.
    #[serde(rename_all = "camelCase")]
    Merge {
        /// `_cs_id`s of the rows that were removed.
        removed_cs_ids: Vec<i64>,
    },
    /// Two tables stacked into this one. Table-creating; not replayed in
    /// place.
    #[serde(rename_all = "camelCase")]
    Stack {
        /// Name of the upper source.
        left_table: String,
        /// Name of the lower source.
        right_table: String,
    },
    /// Two tables joined into this one. Table-creating; not replayed in
    /// place.
    #[serde(rename_all = "camelCase")]
    Join {
        /// Left source name.
        left_table: String,
        /// Right source name.
        right_table: String,
        /// Join key on the left side.
        left_key: String,
        /// Join key on the right side.
        right_key: String,
        /// Join flavor.
        join_type: JoinKind,
    },
    /// A blank row inserted.
    #[serde(rename_all = "camelCase")]
    InsertRow {
        /// `_cs_id` assigned to the new row.
        new_cs_id: i64,
        /// `_cs_origin_id` assigned to the new row.
        origin_id: String,
        /// Row after which the insertion happened, if not at the end.
        insert_after_cs_id: Option<i64>,
    },
    /// Rows deleted, values retained so undo can restore them.
    #[serde(rename_all = "camelCase")]
    DeleteRow {
        /// `_cs_id`s of the deleted rows.
        cs_ids: Vec<i64>,
        /// Full deleted rows, in `cs_ids` order.
        deleted_rows: Vec<Row>,
        /// Column names at deletion time.
        column_names: Vec<String>,
    },
}

impl TimelineParams {
    /// The command kind as a stable string, for labels and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TimelineParams::Transform { .. } => "transform",
            TimelineParams::ManualEdit { .. } => "manual_edit",
            TimelineParams::BatchEdit { .. } => "batch_edit",
            TimelineParams::Standardize { .. } => "standardize",
            TimelineParams::Merge { .. } => "merge",
            TimelineParams::Stack { .. } => "stack",
            TimelineParams::Join { .. } => "join",
            TimelineParams::InsertRow { .. } => "insert_row",
            TimelineParams::DeleteRow { .. } => "delete_row",
        }
    }

    /// Whether a step snapshot must be taken before this command runs.
    pub fn is_expensive(&self) -> bool {
        match self {
            TimelineParams::Merge { .. }
            | TimelineParams::Stack { .. }
            | TimelineParams::Join { .. } => true,
            TimelineParams::Transform { transform_type, .. } => {
                EXPENSIVE_TRANSFORM_TYPES.contains(&transform_type.as_str())
            }
            _ => false,
        }
    }

    /// Whether this command creates a table rather than mutating one; such
    /// commands are never replayed in place.
    pub fn is_table_creating(&self) -> bool {
        matches!(
            self,
            TimelineParams::Stack { .. } | TimelineParams::Join { .. }
        )
    }
}

/// An immutable record of one user operation in a timeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Unique id of the command.
    pub id: String,
    /// User-facing label, e.g. `Trim whitespace in "email"`.
    pub label: String,
    /// The operation parameters.
    pub params: TimelineParams,
    /// Column order before the command, when it reordered columns.
    pub column_order_before: Option<Vec<String>>,
    /// Column order after the command, when it reordered columns.
    pub column_order_after: Option<Vec<String>>,
    /// Whether a step snapshot was taken before this command.
    pub is_expensive: bool,
    /// `_cs_id`s the command touched, when known.
    pub affected_row_ids: Option<Vec<i64>>,
    /// Rows the command touched, when known.
    pub rows_affected: Option<u64>,
}

impl Command {
    /// A command with a fresh id, expensiveness derived from its params.
    pub fn new(label: &str, params: TimelineParams) -> Self {
        let is_expensive = params.is_expensive();
        Command {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            params,
            column_order_before: None,
            column_order_after: None,
            is_expensive,
            affected_row_ids: None,
            rows_affected: None,
        }
    }

    /// The command kind as a stable string.
    pub fn kind(&self) -> &'static str {
        self.params.kind()
    }
}
