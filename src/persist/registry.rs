/*!
The table registry: every known table, where its rows currently live, and
an event stream for the persistence engine to act on.

Removals during re-hydration are registry clears, not user intent; the
`during_hydration` flag on the removal event is what keeps the deletion
watcher from destroying snapshots it is about to reload.
*/
use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::model::normalize_name;

/// Where a table's rows currently live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableResidency {
    /// Present in the engine, backed by a snapshot.
    Thawed,
    /// Registered with metadata only; rows exist only in shards on disk.
    Frozen,
}

/// One registered table.
#[derive(Clone, Debug)]
pub struct TableInfo {
    /// Stable id that outlives renames.
    pub table_id: String,
    /// Human-readable label.
    pub name: String,
    /// Whether the rows are in the engine or only on disk.
    pub residency: TableResidency,
    /// Row count, when known.
    pub row_count: Option<u64>,
    /// Column names, when known. Reserved columns included.
    pub columns: Vec<String>,
}

impl TableInfo {
    /// The engine table name and snapshot id for this table.
    pub fn storage_name(&self) -> String {
        normalize_name(&self.name)
    }
}

/// Registry change events, in occurrence order.
#[derive(Clone, Debug)]
pub enum TableEvent {
    /// A table was added to the registry.
    Registered {
        /// Id of the added table.
        table_id: String,
    },
    /// A table left the registry.
    Removed {
        /// Id of the removed table.
        table_id: String,
        /// Its label at removal time.
        name: String,
        /// True when the removal is a hydration-time registry clear
        /// rather than a user delete.
        during_hydration: bool,
    },
}

#[derive(Default)]
struct RegistryInner {
    tables: BTreeMap<String, TableInfo>,
    active_table_id: Option<String>,
    hydrating: bool,
}

/// Process-wide table registry with explicit events.
pub struct TableRegistry {
    inner: Mutex<RegistryInner>,
    events: broadcast::Sender<TableEvent>,
}

impl Default for TableRegistry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        TableRegistry {
            inner: Mutex::new(RegistryInner::default()),
            events,
        }
    }
}

impl TableRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        TableRegistry::default()
    }

    /// Listen for registry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.events.subscribe()
    }

    /// Add or replace a table.
    pub fn register(&self, info: TableInfo) {
        let table_id = info.table_id.clone();
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .tables
            .insert(table_id.clone(), info);
        let _ = self.events.send(TableEvent::Registered { table_id });
    }

    /// Remove a table. The emitted event carries the hydration flag.
    pub fn remove(&self, table_id: &str) -> Option<TableInfo> {
        let (removed, hydrating) = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            if inner.active_table_id.as_deref() == Some(table_id) {
                inner.active_table_id = None;
            }
            (inner.tables.remove(table_id), inner.hydrating)
        };
        if let Some(info) = &removed {
            let _ = self.events.send(TableEvent::Removed {
                table_id: info.table_id.clone(),
                name: info.name.clone(),
                during_hydration: hydrating,
            });
        }
        removed
    }

    /// Look up one table.
    pub fn get(&self, table_id: &str) -> Option<TableInfo> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .tables
            .get(table_id)
            .cloned()
    }

    /// Find a table by its normalized storage name.
    pub fn find_by_storage_name(&self, storage_name: &str) -> Option<TableInfo> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .tables
            .values()
            .find(|info| info.storage_name() == storage_name)
            .cloned()
    }

    /// All tables, in id order.
    pub fn list(&self) -> Vec<TableInfo> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .tables
            .values()
            .cloned()
            .collect()
    }

    /// Update a table's residency.
    pub fn set_residency(&self, table_id: &str, residency: TableResidency) {
        if let Some(info) = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .tables
            .get_mut(table_id)
        {
            info.residency = residency;
        }
    }

    /// Update a table's known row count.
    pub fn set_row_count(&self, table_id: &str, row_count: Option<u64>) {
        if let Some(info) = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .tables
            .get_mut(table_id)
        {
            info.row_count = row_count;
        }
    }

    /// Update a table's known columns.
    pub fn set_columns(&self, table_id: &str, columns: Vec<String>) {
        if let Some(info) = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .tables
            .get_mut(table_id)
        {
            info.columns = columns;
        }
    }

    /// Mark the table currently live in the engine.
    pub fn set_active(&self, table_id: Option<&str>) {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .active_table_id = table_id.map(|id| id.to_string());
    }

    /// The table currently live in the engine.
    pub fn active(&self) -> Option<TableInfo> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .active_table_id
            .as_ref()
            .and_then(|id| inner.tables.get(id))
            .cloned()
    }

    /// Enter the hydration window: removals become registry clears.
    pub fn begin_hydration(&self) {
        self.inner.lock().expect("registry lock poisoned").hydrating = true;
    }

    /// Leave the hydration window.
    pub fn end_hydration(&self) {
        self.inner.lock().expect("registry lock poisoned").hydrating = false;
    }
}
