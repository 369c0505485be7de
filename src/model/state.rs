/*!
Saved application state: the table registry's durable half, written to
`state/app-state.json`.
*/
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One known table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TableStateEntry {
    /// Stable id that outlives renames.
    pub table_id: String,
    /// Current human-readable label.
    pub name: String,
}

/// Everything hydration needs before touching snapshots.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppState {
    /// The table that was live in the engine when state was last saved.
    pub active_table_id: Option<String>,
    /// All known tables, in display order.
    pub tables: Vec<TableStateEntry>,
    /// Saved column orders, keyed by table id.
    pub column_orders: BTreeMap<String, Vec<String>>,
}

impl AppState {
    /// Look up a table entry by id.
    pub fn table(&self, table_id: &str) -> Option<&TableStateEntry> {
        self.tables.iter().find(|entry| entry.table_id == table_id)
    }

    /// Register or rename a table.
    pub fn upsert_table(&mut self, table_id: &str, name: &str) {
        match self
            .tables
            .iter_mut()
            .find(|entry| entry.table_id == table_id)
        {
            Some(entry) => entry.name = name.to_string(),
            None => self.tables.push(TableStateEntry {
                table_id: table_id.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Forget a table and its column order.
    pub fn remove_table(&mut self, table_id: &str) {
        self.tables.retain(|entry| entry.table_id != table_id);
        self.column_orders.remove(table_id);
        if self.active_table_id.as_deref() == Some(table_id) {
            self.active_table_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_default() {
        let state: AppState = serde_json::from_str("{}").expect("empty state parses");
        assert_eq!(state, AppState::default());
    }

    #[test]
    fn test_round_trip_with_camel_case_keys() {
        let mut state = AppState::default();
        state.upsert_table("t1", "Sales");
        state.active_table_id = Some("t1".to_string());
        state
            .column_orders
            .insert("t1".to_string(), vec!["b".to_string(), "a".to_string()]);
        let text = serde_json::to_string(&state).expect("Failed to serialize state");
        assert!(text.contains("activeTableId"));
        assert!(text.contains("columnOrders"));
        let parsed: AppState = serde_json::from_str(&text).expect("Failed to deserialize state");
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_remove_table_clears_active_and_order() {
        let mut state = AppState::default();
        state.upsert_table("t1", "Sales");
        state.active_table_id = Some("t1".to_string());
        state
            .column_orders
            .insert("t1".to_string(), vec!["a".to_string()]);
        state.remove_table("t1");
        assert!(state.tables.is_empty());
        assert!(state.active_table_id.is_none());
        assert!(state.column_orders.is_empty());
    }
}
