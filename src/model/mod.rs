/*!
The data model: everything that hits disk plus the timeline command
vocabulary, and the reserved identifiers shared across the engine.
*/
use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

pub mod changelog;
pub mod command;
pub mod manifest;
pub mod state;
pub mod timeline;

/// A single cell value. JSON's value space is the engine's value space;
/// `Null` is SQL NULL.
pub type CellValue = serde_json::Value;

/// One table row, keyed by column name. Reserved columns ride along.
pub type Row = BTreeMap<String, CellValue>;

/// Reserved column holding the stable per-version row identity.
pub const CS_ID_COLUMN: &str = "_cs_id";

/// Reserved column holding the row identity that survives transformations.
pub const CS_ORIGIN_ID_COLUMN: &str = "_cs_origin_id";

/// Prefix marking an in-memory reference to an on-disk snapshot.
pub const PARQUET_REF_PREFIX: &str = "parquet:";

/// Snapshot-id prefixes reserved for internal use; excluded from hydration.
pub const RESERVED_SNAPSHOT_PREFIXES: &[&str] = &[
    "original_",
    "snapshot_",
    "_timeline_",
    "_diff_",
    "_combine_temp_",
    "_combine_result_",
    "_mat_",
    "_custom_sql_before_",
];

/// Table-name prefix reserved for in-memory step snapshots.
pub const HOT_TABLE_PREFIX: &str = "_hot_";

/// Table-name prefix reserved for in-flight transforms.
pub const STAGING_TABLE_PREFIX: &str = "_staging_";

lazy_static! {
    static ref NON_IDENT: Regex = Regex::new("[^a-zA-Z0-9_]").unwrap();
}

/// Normalize a human-readable table label into a storage key: lowercase,
/// anything outside `[a-zA-Z0-9_]` replaced by `_`.
pub fn normalize_name(name: &str) -> String {
    NON_IDENT.replace_all(&name.to_lowercase(), "_").to_string()
}

/// Whether a snapshot id belongs to the engine rather than a user table.
pub fn is_reserved_snapshot_id(id: &str) -> bool {
    RESERVED_SNAPSHOT_PREFIXES
        .iter()
        .any(|prefix| id.starts_with(prefix))
}

/// Whether a column name is one of the reserved identity columns.
pub fn is_reserved_column(name: &str) -> bool {
    name == CS_ID_COLUMN || name == CS_ORIGIN_ID_COLUMN
}

/// The user-visible subset of a column list, original order preserved.
pub fn user_columns(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .filter(|name| !is_reserved_column(name))
        .cloned()
        .collect()
}

/// Wrap a snapshot id in its in-memory reference form.
pub fn parquet_ref(snapshot_id: &str) -> String {
    format!("{}{}", PARQUET_REF_PREFIX, snapshot_id)
}

/// Strip the in-memory reference prefix, if present.
pub fn strip_parquet_ref(reference: &str) -> &str {
    reference
        .strip_prefix(PARQUET_REF_PREFIX)
        .unwrap_or(reference)
}

/// Mint a fresh `_cs_origin_id`.
pub fn new_origin_id() -> String {
    Uuid::new_v4().to_string()
}

/// The `_cs_id` of a row, if it carries one.
pub fn row_cs_id(row: &Row) -> Option<i64> {
    row.get(CS_ID_COLUMN).and_then(CellValue::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("My Table (2024)"), "my_table__2024_");
        assert_eq!(normalize_name("already_normal"), "already_normal");
    }

    #[test]
    fn test_reserved_snapshot_ids() {
        assert!(is_reserved_snapshot_id("original_sales"));
        assert!(is_reserved_snapshot_id("_combine_temp_x"));
        assert!(!is_reserved_snapshot_id("sales"));
    }

    #[test]
    fn test_user_columns_strips_reserved() {
        let columns = vec![
            CS_ID_COLUMN.to_string(),
            "a".to_string(),
            CS_ORIGIN_ID_COLUMN.to_string(),
            "b".to_string(),
        ];
        assert_eq!(user_columns(&columns), vec!["a", "b"]);
    }

    #[test]
    fn test_parquet_ref_round_trip() {
        let reference = parquet_ref("sales");
        assert_eq!(reference, "parquet:sales");
        assert_eq!(strip_parquet_ref(&reference), "sales");
        assert_eq!(strip_parquet_ref("bare"), "bare");
    }
}
