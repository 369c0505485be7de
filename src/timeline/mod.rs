/*!
The timeline engine: every user operation over a table is recorded as an
immutable command in a linear history, with step snapshots taken before
expensive commands so undo never re-runs a minute-long transform.

Undo and redo dispatch on two paths: a single manual edit is self-inverse
and undone with one cell update (fast path); everything else restores the
nearest snapshot and replays forward (heavy path).
*/
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::config::EngineOptions;
use crate::engine::{SqlEngine, SqlGate, TransformRunner};
use crate::model::command::{Command, TimelineParams};
use crate::model::timeline::Timeline;
use crate::model::{normalize_name, strip_parquet_ref, HOT_TABLE_PREFIX};
use crate::persist::registry::TableRegistry;
use crate::storage::snapshots::SnapshotStore;

mod replay;
mod snapshots;

/// Extra context recorded alongside a command.
#[derive(Clone, Debug, Default)]
pub struct RecordOptions {
    /// Column order before the command, when it reordered columns.
    pub column_order_before: Option<Vec<String>>,
    /// Column order after the command, when it reordered columns.
    pub column_order_after: Option<Vec<String>>,
    /// `_cs_id`s the command touched, when known.
    pub affected_row_ids: Option<Vec<i64>>,
    /// Rows the command touched, when known.
    pub rows_affected: Option<u64>,
}

/// How an undo or redo was carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UndoPath {
    /// One inverse (or re-issued) cell update.
    Fast,
    /// Snapshot restore plus forward replay.
    Heavy,
}

/// The per-table command histories and their snapshot machinery.
pub struct TimelineEngine {
    engine: Arc<dyn SqlEngine>,
    snapshots: Arc<SnapshotStore>,
    registry: Arc<TableRegistry>,
    options: Arc<EngineOptions>,
    timelines: tokio::sync::Mutex<HashMap<String, Timeline>>,
    init_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    transform_runner: std::sync::Mutex<Option<Arc<dyn TransformRunner>>>,
    replaying: Arc<AtomicBool>,
    gate: Arc<SqlGate>,
}

impl TimelineEngine {
    /// A timeline engine over the given stores. `replaying` is shared with
    /// the persistence engine so replay-transient states are never saved.
    pub fn new(
        engine: Arc<dyn SqlEngine>,
        snapshots: Arc<SnapshotStore>,
        registry: Arc<TableRegistry>,
        options: Arc<EngineOptions>,
        replaying: Arc<AtomicBool>,
        gate: Arc<SqlGate>,
    ) -> Self {
        TimelineEngine {
            engine,
            snapshots,
            registry,
            options,
            timelines: tokio::sync::Mutex::new(HashMap::new()),
            init_locks: std::sync::Mutex::new(HashMap::new()),
            transform_runner: std::sync::Mutex::new(None),
            replaying,
            gate,
        }
    }

    /// Register the runner that re-executes transform commands on replay.
    pub fn set_transform_runner(&self, runner: Arc<dyn TransformRunner>) {
        *self
            .transform_runner
            .lock()
            .expect("transform runner lock poisoned") = Some(runner);
    }

    fn runner(&self) -> Option<Arc<dyn TransformRunner>> {
        self.transform_runner
            .lock()
            .expect("transform runner lock poisoned")
            .clone()
    }

    fn live_table_name(&self, table_id: &str, timeline: &Timeline) -> String {
        self.registry
            .get(table_id)
            .map(|info| info.storage_name())
            .unwrap_or_else(|| normalize_name(&timeline.table_name))
    }

    /// Create the timeline (and its original snapshot) on first touch.
    /// Concurrent calls for the same table coalesce on a per-table mutex.
    pub async fn ensure_timeline(&self, table_id: &str) -> Result<()> {
        let init_lock = {
            let mut locks = self.init_locks.lock().expect("init lock map poisoned");
            locks
                .entry(table_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = init_lock.lock().await;
        if self.timelines.lock().await.contains_key(table_id) {
            return Ok(());
        }
        let info = self
            .registry
            .get(table_id)
            .with_context(|| format!("no registered table {}", table_id))?;
        let storage_name = info.storage_name();
        let original_id = format!("original_{}", storage_name);
        if !self.snapshots.snapshot_exists(&original_id).await? {
            self.snapshots
                .export_table_to_snapshot(&storage_name, &original_id, None)
                .await?;
        }
        let timeline = Timeline::new(table_id, &info.name, &original_id);
        debug!(table_id, timeline_id = %timeline.id, "created timeline");
        self.timelines
            .lock()
            .await
            .insert(table_id.to_string(), timeline);
        Ok(())
    }

    /// Record a command at the current position, discarding any redo
    /// branch beyond it. A step snapshot of the current state is taken
    /// first when the command is expensive, so expensive commands must be
    /// recorded before they execute. Returns the new position.
    pub async fn record_command(
        &self,
        table_id: &str,
        label: &str,
        params: TimelineParams,
        options: RecordOptions,
    ) -> Result<i64> {
        self.ensure_timeline(table_id).await?;
        let mut timelines = self.timelines.lock().await;
        let timeline = timelines
            .get_mut(table_id)
            .with_context(|| format!("no timeline for {}", table_id))?;
        let live = self.live_table_name(table_id, timeline);

        let discarded = {
            let position = timeline.current_position;
            timeline.truncate_after(position)
        };
        for snapshot in discarded {
            self.discard_step_snapshot(&snapshot).await;
        }

        let mut command = Command::new(label, params);
        command.column_order_before = options.column_order_before;
        command.column_order_after = options.column_order_after;
        command.affected_row_ids = options.affected_row_ids;
        command.rows_affected = options.rows_affected;

        if command.is_expensive {
            self.create_step_snapshot(timeline, &live).await?;
        }
        timeline.commands.push(command);
        timeline.current_position += 1;
        debug!(
            table_id,
            position = timeline.current_position,
            "recorded command"
        );
        Ok(timeline.current_position)
    }

    /// Undo the command at the current position.
    pub async fn undo(&self, table_id: &str) -> Result<UndoPath> {
        let mut timelines = self.timelines.lock().await;
        let timeline = timelines
            .get_mut(table_id)
            .with_context(|| format!("no timeline for {}", table_id))?;
        if !timeline.can_undo() {
            return Err(anyhow!("nothing to undo for {}", table_id));
        }
        let live = self.live_table_name(table_id, timeline);
        let command = timeline
            .command_at(timeline.current_position)
            .expect("can_undo implies a command")
            .clone();
        if let TimelineParams::ManualEdit {
            row_id,
            column,
            previous_value,
            ..
        } = &command.params
        {
            // Inverse update, unless the column has since been renamed
            // away; then the snapshot path still reaches the right state.
            if self.engine.columns(&live).await?.contains(column) {
                self.engine
                    .update_cell(&live, *row_id, column, previous_value)
                    .await?;
                timeline.current_position -= 1;
                return Ok(UndoPath::Fast);
            }
        }
        let target = timeline.current_position - 1;
        self.replay_to_position(timeline, &live, target).await?;
        Ok(UndoPath::Heavy)
    }

    /// Redo the command just beyond the current position.
    pub async fn redo(&self, table_id: &str) -> Result<UndoPath> {
        let mut timelines = self.timelines.lock().await;
        let timeline = timelines
            .get_mut(table_id)
            .with_context(|| format!("no timeline for {}", table_id))?;
        if !timeline.can_redo() {
            return Err(anyhow!("nothing to redo for {}", table_id));
        }
        let live = self.live_table_name(table_id, timeline);
        let command = timeline
            .command_at(timeline.current_position + 1)
            .expect("can_redo implies a command")
            .clone();
        if let TimelineParams::ManualEdit {
            row_id,
            column,
            new_value,
            ..
        } = &command.params
        {
            if self.engine.columns(&live).await?.contains(column) {
                self.engine
                    .update_cell(&live, *row_id, column, new_value)
                    .await?;
                timeline.current_position += 1;
                return Ok(UndoPath::Fast);
            }
        }
        let target = timeline.current_position + 1;
        self.replay_to_position(timeline, &live, target).await?;
        Ok(UndoPath::Heavy)
    }

    /// The column order in effect at the current position; None means the
    /// registry default applies.
    pub async fn current_column_order(&self, table_id: &str) -> Option<Vec<String>> {
        let timelines = self.timelines.lock().await;
        let timeline = timelines.get(table_id)?;
        timeline
            .column_order_at(timeline.current_position)
            .map(|order| order.to_vec())
    }

    /// Destroy a table's timeline: hot tables dropped from the engine,
    /// cold snapshots (steps and original) deleted, record removed.
    pub async fn cleanup_table(&self, table_id: &str) -> Result<()> {
        let timeline = match self.timelines.lock().await.remove(table_id) {
            Some(timeline) => timeline,
            None => return Ok(()),
        };
        let hot_prefix = format!("{}{}_", HOT_TABLE_PREFIX, timeline.id);
        for table in self.engine.list_tables().await? {
            if table.starts_with(&hot_prefix) {
                self.engine.drop_table(&table).await?;
            }
        }
        for snapshot in timeline.snapshots.values() {
            self.snapshots
                .delete_snapshot(strip_parquet_ref(&snapshot.parquet_id))
                .await?;
        }
        self.snapshots
            .delete_snapshot(&timeline.original_snapshot_name)
            .await?;
        self.init_locks
            .lock()
            .expect("init lock map poisoned")
            .remove(table_id);
        debug!(table_id, "timeline cleaned up");
        Ok(())
    }

    /// A copy of a table's timeline, for inspection.
    pub async fn timeline(&self, table_id: &str) -> Option<Timeline> {
        self.timelines.lock().await.get(table_id).cloned()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use object_store::memory::InMemory;
    use serde_json::json;

    use crate::engine::memory::test_support::seed_table;
    use crate::engine::memory::MemoryEngine;
    use crate::model::CellValue;
    use crate::persist::registry::{TableInfo, TableRegistry, TableResidency};
    use crate::storage::blobs::BlobStore;

    use super::*;

    /// A timeline engine over a fresh in-memory stack, with one seeded,
    /// registered table.
    pub struct TimelineFixture {
        /// The engine under test.
        pub timeline: TimelineEngine,
        /// The in-memory analytical engine.
        pub engine: Arc<MemoryEngine>,
        /// The snapshot store under it.
        pub snapshots: Arc<SnapshotStore>,
        /// The table registry.
        pub registry: Arc<TableRegistry>,
    }

    /// Seed `rows` rows into a table named `Sales` (storage name `sales`)
    /// with columns `a, b`, registered as table id `t1`.
    pub async fn fixture_with_rows(rows: usize) -> TimelineFixture {
        let engine = Arc::new(MemoryEngine::new());
        let values: Vec<Vec<CellValue>> = (0..rows)
            .map(|n| vec![json!(format!("a{}", n)), json!("x")])
            .collect();
        seed_table(&engine, "sales", &["a", "b"], &values)
            .await
            .expect("seed table");
        let blobs = Arc::new(BlobStore::new(Arc::new(InMemory::new())));
        let options = Arc::new(EngineOptions::default());
        let snapshots = Arc::new(SnapshotStore::new(
            blobs,
            engine.clone(),
            options.clone(),
        ));
        let registry = Arc::new(TableRegistry::new());
        registry.register(TableInfo {
            table_id: "t1".to_string(),
            name: "Sales".to_string(),
            residency: TableResidency::Thawed,
            row_count: Some(rows as u64),
            columns: Vec::new(),
        });
        let timeline = TimelineEngine::new(
            engine.clone(),
            snapshots.clone(),
            registry.clone(),
            options,
            Arc::new(AtomicBool::new(false)),
            Arc::new(SqlGate::new()),
        );
        TimelineFixture {
            timeline,
            engine,
            snapshots,
            registry,
        }
    }

    /// A manual-edit params value for row `row_id`, column `b`.
    pub fn edit_params(row_id: i64, from: &str, to: &str) -> TimelineParams {
        TimelineParams::ManualEdit {
            row_id,
            column: "b".to_string(),
            previous_value: json!(from),
            new_value: json!(to),
        }
    }

    /// Merge params deleting the given rows.
    pub fn merge_params(removed: &[i64]) -> TimelineParams {
        TimelineParams::Merge {
            removed_cs_ids: removed.to_vec(),
        }
    }
}
