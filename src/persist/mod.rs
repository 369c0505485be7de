/*!
The persistence engine: lazy hydration on startup, the cell-edit fast path
into the changelog, the debounced snapshot scheduler for structural
changes, periodic compaction, and the deletion watcher.

The guarantee this module exists for: no user mutation is ever silently
lost, while snapshot export frequency stays tolerable. Cell edits cost a
changelog append (milliseconds); structural changes cost a debounced
snapshot export (seconds, scaled by table size).
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use object_store::DynObjectStore;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::EngineOptions;
use crate::engine::SqlEngine;
use crate::model::changelog::ChangeEntry;
use crate::model::state::AppState;
use crate::model::{
    normalize_name, CellValue, Row, CS_ID_COLUMN, CS_ORIGIN_ID_COLUMN,
};
use crate::storage::blobs::BlobStore;
use crate::storage::changelog::ChangelogStore;
use crate::storage::snapshots::{CleanupReport, SnapshotStore};
use crate::storage::state::StateStore;

pub mod compact;
pub mod registry;
pub mod saver;

use compact::{ActivityTracker, CompactionLock, Compactor, LocalLock};
use registry::{TableEvent, TableInfo, TableRegistry, TableResidency};
use saver::SaveScheduler;

/// Persistence lifecycle events, for the host UI to surface.
#[derive(Clone, Debug)]
pub enum PersistEvent {
    /// A snapshot export began.
    SaveStarted {
        /// Table being exported.
        table_id: String,
    },
    /// A snapshot export committed.
    SaveCompleted {
        /// Table that was exported.
        table_id: String,
        /// Rows in the exported snapshot.
        rows: u64,
    },
    /// A snapshot export failed; the table stays dirty and retries on the
    /// next change.
    SaveFailed {
        /// Table whose export failed.
        table_id: String,
        /// Human-readable failure.
        message: String,
    },
    /// A compaction sweep folded changelogs into snapshots.
    CompactionCompleted {
        /// Tables compacted in the sweep.
        tables: usize,
    },
}

/// What hydration found and did.
#[derive(Clone, Debug)]
pub struct HydrationReport {
    /// Tables registered from snapshots on disk.
    pub tables: usize,
    /// The table imported into the engine, if any.
    pub thawed: Option<String>,
    /// Changelog entries replayed onto the thawed table.
    pub replayed_entries: usize,
    /// Debris removed before hydration.
    pub cleanup: CleanupReport,
    /// Legacy snapshot ids that received a synthesized manifest.
    pub migrated_legacy: Vec<String>,
}

/// The unload decision: veto when work would be lost.
#[derive(Clone, Debug)]
pub struct ShutdownVerdict {
    /// True when unloading now could lose data.
    pub veto: bool,
    /// Why, when vetoed.
    pub reason: Option<String>,
}

/// Replays one changelog entry onto a live table.
pub(crate) async fn apply_change_entry(
    engine: &dyn SqlEngine,
    table: &str,
    entry: &ChangeEntry,
    cs_id_step: i64,
) -> Result<()> {
    match entry {
        ChangeEntry::CellEdit {
            row_id,
            column,
            new_value,
            ..
        } => {
            let matched = engine
                .update_cell(table, *row_id, column, new_value)
                .await
                .with_context(|| format!("replaying cell edit on {}.{}", table, column))?;
            if matched == 0 {
                warn!(table, row_id, column = column.as_str(), "cell edit targets a missing row");
            }
        }
        ChangeEntry::InsertRow {
            cs_id,
            origin_id,
            column_names,
            ..
        } => {
            engine.shift_cs_ids(table, *cs_id, cs_id_step).await?;
            let mut row = Row::new();
            row.insert(CS_ID_COLUMN.to_string(), CellValue::from(*cs_id));
            row.insert(
                CS_ORIGIN_ID_COLUMN.to_string(),
                CellValue::from(origin_id.clone()),
            );
            for column in column_names {
                row.entry(column.clone()).or_insert(CellValue::Null);
            }
            engine.append_rows(table, vec![row]).await?;
        }
        ChangeEntry::DeleteRow { cs_ids, .. } => {
            engine.delete_rows(table, cs_ids).await?;
        }
    }
    Ok(())
}

/// Owner of all persistence state. One per store + engine pair.
pub struct PersistenceEngine {
    engine: Arc<dyn SqlEngine>,
    snapshots: Arc<SnapshotStore>,
    changelog: Arc<ChangelogStore>,
    state_store: Arc<StateStore>,
    registry: Arc<TableRegistry>,
    saver: Arc<SaveScheduler>,
    compactor: Arc<Compactor>,
    options: Arc<EngineOptions>,
    events: broadcast::Sender<PersistEvent>,
    replaying: Arc<AtomicBool>,
    activity: ActivityTracker,
    app_state: tokio::sync::Mutex<AppState>,
}

impl PersistenceEngine {
    /// Wire a persistence engine over an object store and an engine, with
    /// the in-process compaction lock.
    pub fn new(
        store: Arc<DynObjectStore>,
        engine: Arc<dyn SqlEngine>,
        options: EngineOptions,
    ) -> Arc<Self> {
        Self::with_lock(store, engine, options, Arc::new(LocalLock::new()))
    }

    /// Same, with a caller-supplied compaction lock scope.
    pub fn with_lock(
        store: Arc<DynObjectStore>,
        engine: Arc<dyn SqlEngine>,
        options: EngineOptions,
        lock: Arc<dyn CompactionLock>,
    ) -> Arc<Self> {
        let options = Arc::new(options);
        let blobs = Arc::new(BlobStore::new(store));
        let snapshots = Arc::new(SnapshotStore::new(
            blobs.clone(),
            engine.clone(),
            options.clone(),
        ));
        let changelog = Arc::new(ChangelogStore::new(blobs.clone()));
        let state_store = Arc::new(StateStore::new(blobs));
        let registry = Arc::new(TableRegistry::new());
        let (events, _) = broadcast::channel(256);
        let replaying = Arc::new(AtomicBool::new(false));
        let activity = ActivityTracker::new();
        let saver = Arc::new(SaveScheduler::new(
            snapshots.clone(),
            changelog.clone(),
            registry.clone(),
            options.clone(),
            events.clone(),
            replaying.clone(),
        ));
        let compactor = Arc::new(Compactor::new(
            engine.clone(),
            snapshots.clone(),
            changelog.clone(),
            registry.clone(),
            saver.clone(),
            options.clone(),
            lock,
            activity.clone(),
            events.clone(),
        ));
        Arc::new(PersistenceEngine {
            engine,
            snapshots,
            changelog,
            state_store,
            registry,
            saver,
            compactor,
            options,
            events,
            replaying,
            activity,
            app_state: tokio::sync::Mutex::new(AppState::default()),
        })
    }

    /// Start the background tasks: the compaction loop and the deletion
    /// watcher.
    pub fn spawn_background(self: &Arc<Self>) {
        self.compactor.spawn_loop();
        let this = Arc::clone(self);
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TableEvent::Removed {
                        table_id,
                        name,
                        during_hydration: false,
                    }) => {
                        this.on_table_removed(&table_id, &name).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "deletion watcher lagged behind registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// A user-initiated removal: destroy the table's snapshot, changelog,
    /// and saved state.
    async fn on_table_removed(&self, table_id: &str, name: &str) {
        let storage_name = normalize_name(name);
        if let Err(err) = self.snapshots.delete_snapshot(&storage_name).await {
            warn!(table_id, error = %err, "failed to delete snapshot of removed table");
        }
        if let Err(err) = self.changelog.clear(table_id).await {
            warn!(table_id, error = %err, "failed to clear changelog of removed table");
        }
        let mut state = self.app_state.lock().await;
        state.remove_table(table_id);
        if let Err(err) = self.state_store.save(&state).await {
            warn!(table_id, error = %err, "failed to save state after table removal");
        }
        info!(table_id, "removed table storage");
    }

    /// Startup: load saved state, clean up debris, migrate legacy
    /// snapshots, register every user snapshot, and thaw exactly one table
    /// (the saved active table, or the first). Everything else stays
    /// frozen: present in the registry, absent from the engine.
    pub async fn hydrate(self: &Arc<Self>) -> Result<HydrationReport> {
        let mut state = self.state_store.load().await?;
        self.registry.begin_hydration();
        let cleanup = self.snapshots.startup_cleanup().await?;
        let migrated_legacy = self.snapshots.migrate_legacy_snapshots().await?;
        let ids = self.snapshots.list_user_snapshot_ids().await?;
        for id in &ids {
            let manifest = self.snapshots.read_manifest(id).await?;
            let known = state
                .tables
                .iter()
                .find(|entry| normalize_name(&entry.name) == *id)
                .map(|entry| (entry.table_id.clone(), entry.name.clone()));
            let (table_id, name) = match known {
                Some(found) => found,
                None => {
                    // A snapshot with no saved mapping: adopt it under its
                    // own id.
                    state.upsert_table(id, id);
                    (id.clone(), id.clone())
                }
            };
            let (row_count, columns) = match manifest {
                Some(manifest) if !manifest.has_unknown_counts() => {
                    (Some(manifest.total_rows), manifest.columns)
                }
                Some(manifest) => (None, manifest.columns),
                None => (None, Vec::new()),
            };
            self.registry.register(TableInfo {
                table_id,
                name,
                residency: TableResidency::Frozen,
                row_count,
                columns,
            });
        }
        state
            .tables
            .retain(|entry| ids.contains(&normalize_name(&entry.name)));
        let thawed = state
            .active_table_id
            .clone()
            .filter(|table_id| self.registry.get(table_id).is_some())
            .or_else(|| {
                self.registry
                    .list()
                    .first()
                    .map(|info| info.table_id.clone())
            });
        let mut replayed_entries = 0;
        if let Some(table_id) = &thawed {
            replayed_entries = self.thaw(table_id).await?;
            state.active_table_id = Some(table_id.clone());
        }
        self.registry.end_hydration();
        self.state_store.save(&state).await?;
        *self.app_state.lock().await = state;
        let report = HydrationReport {
            tables: ids.len(),
            thawed,
            replayed_entries,
            cleanup,
            migrated_legacy,
        };
        info!(
            tables = report.tables,
            thawed = report.thawed.as_deref().unwrap_or("none"),
            replayed = report.replayed_entries,
            "hydrated"
        );
        Ok(report)
    }

    /// Register a table that was just created live in the engine (import,
    /// combine result). The previous active table is frozen first, the new
    /// one becomes active, and an initial snapshot is saved with priority.
    pub async fn register_table(self: &Arc<Self>, table_id: &str, name: &str) -> Result<()> {
        if let Some(previous) = self.registry.active() {
            if previous.table_id != table_id {
                self.freeze_table(&previous.table_id).await?;
            }
        }
        let storage_name = normalize_name(name);
        let columns = self.engine.columns(&storage_name).await?;
        let row_count = self.engine.row_count(&storage_name).await?;
        self.registry.register(TableInfo {
            table_id: table_id.to_string(),
            name: name.to_string(),
            residency: TableResidency::Thawed,
            row_count: Some(row_count),
            columns,
        });
        self.registry.set_active(Some(table_id));
        {
            let mut state = self.app_state.lock().await;
            state.upsert_table(table_id, name);
            state.active_table_id = Some(table_id.to_string());
            self.state_store.save(&state).await?;
        }
        self.saver.notify_structural_change(table_id, true);
        Ok(())
    }

    /// Remove a table at the user's request. The deletion watcher destroys
    /// its snapshot, changelog, and saved state.
    pub async fn delete_table(&self, table_id: &str) -> Result<()> {
        if let Some(info) = self.registry.get(table_id) {
            if info.residency == TableResidency::Thawed {
                self.engine.drop_table(&info.storage_name()).await?;
            }
        }
        self.registry.remove(table_id);
        Ok(())
    }

    /// The cell-edit fast path: the engine already holds the new value
    /// (the UI writes through); journal it and move on. Compaction is
    /// kicked early when the log crosses its threshold.
    pub async fn record_cell_edit(
        self: &Arc<Self>,
        table_id: &str,
        row_id: i64,
        column: &str,
        old_value: CellValue,
        new_value: CellValue,
    ) -> Result<()> {
        self.activity.touch();
        self.changelog
            .append(&ChangeEntry::cell_edit(
                table_id, row_id, column, old_value, new_value,
            ))
            .await?;
        if self.changelog.count(table_id).await? >= self.options.compaction_entry_threshold {
            let compactor = self.compactor.clone();
            tokio::spawn(async move {
                if let Err(err) = compactor.run_once().await {
                    warn!(error = %err, "threshold compaction failed");
                }
            });
        }
        Ok(())
    }

    /// Journal a row insertion and schedule a priority save.
    pub async fn record_row_insert(
        self: &Arc<Self>,
        table_id: &str,
        cs_id: i64,
        origin_id: &str,
        insert_after_cs_id: Option<i64>,
        column_names: Vec<String>,
    ) -> Result<()> {
        self.activity.touch();
        self.changelog
            .append(&ChangeEntry::InsertRow {
                table_id: table_id.to_string(),
                ts: chrono::Utc::now().timestamp_millis(),
                cs_id,
                origin_id: origin_id.to_string(),
                insert_after_cs_id,
                column_names,
            })
            .await?;
        self.saver.notify_structural_change(table_id, true);
        Ok(())
    }

    /// Journal a row deletion and schedule a priority save.
    pub async fn record_row_delete(
        self: &Arc<Self>,
        table_id: &str,
        cs_ids: Vec<i64>,
        deleted_rows: Vec<Row>,
        column_names: Vec<String>,
    ) -> Result<()> {
        self.activity.touch();
        self.changelog
            .append(&ChangeEntry::DeleteRow {
                table_id: table_id.to_string(),
                ts: chrono::Utc::now().timestamp_millis(),
                cs_ids,
                deleted_rows,
                column_names,
            })
            .await?;
        self.saver.notify_structural_change(table_id, true);
        Ok(())
    }

    /// Record a structural change (data-version bump). Priority bypasses
    /// the debounce, for changes that must survive an immediate refresh.
    pub fn notify_structural_change(self: &Arc<Self>, table_id: &str, priority: bool) {
        self.activity.touch();
        self.saver.notify_structural_change(table_id, priority);
    }

    /// Export (if dirty) and drop a table from the engine, leaving it
    /// frozen: registered, rows only on disk.
    pub async fn freeze_table(&self, table_id: &str) -> Result<()> {
        let info = self
            .registry
            .get(table_id)
            .with_context(|| format!("freezing unknown table {}", table_id))?;
        if info.residency != TableResidency::Thawed {
            return Ok(());
        }
        // Wait out any in-flight export before the table leaves the engine.
        self.saver.flush(table_id).await?;
        self.engine.drop_table(&info.storage_name()).await?;
        self.registry.set_residency(table_id, TableResidency::Frozen);
        if self
            .registry
            .active()
            .map(|active| active.table_id == *table_id)
            .unwrap_or(false)
        {
            self.registry.set_active(None);
        }
        debug!(table_id, "froze table");
        Ok(())
    }

    /// Import a frozen table into the engine and replay its changelog.
    /// Returns the number of entries replayed.
    pub async fn thaw(&self, table_id: &str) -> Result<usize> {
        let info = self
            .registry
            .get(table_id)
            .with_context(|| format!("thawing unknown table {}", table_id))?;
        let storage_name = info.storage_name();
        self.snapshots
            .import_table_from_snapshot(&storage_name, &storage_name)
            .await?;
        let entries = self.changelog.read_all(table_id).await?;
        for entry in &entries {
            apply_change_entry(
                self.engine.as_ref(),
                &storage_name,
                entry,
                self.options.cs_id_step,
            )
            .await?;
        }
        self.registry
            .set_residency(table_id, TableResidency::Thawed);
        self.registry
            .set_row_count(table_id, Some(self.engine.row_count(&storage_name).await?));
        self.registry
            .set_columns(table_id, self.engine.columns(&storage_name).await?);
        self.registry.set_active(Some(table_id));
        debug!(table_id, replayed = entries.len(), "thawed table");
        Ok(entries.len())
    }

    /// Switch the single active table: freeze the current one, thaw the
    /// target, persist the choice.
    pub async fn activate_table(self: &Arc<Self>, table_id: &str) -> Result<()> {
        if let Some(active) = self.registry.active() {
            if active.table_id == table_id {
                return Ok(());
            }
            self.freeze_table(&active.table_id).await?;
        }
        self.thaw(table_id).await?;
        let mut state = self.app_state.lock().await;
        state.active_table_id = Some(table_id.to_string());
        self.state_store.save(&state).await
    }

    /// The unload contract: veto when a save is in flight or any table is
    /// dirty, and kick a best-effort final compaction without awaiting it.
    pub fn prepare_shutdown(self: &Arc<Self>) -> ShutdownVerdict {
        let busy = self.saver.any_save_active();
        let dirty = self.saver.any_dirty();
        if busy || dirty {
            let compactor = self.compactor.clone();
            tokio::spawn(async move {
                let _ = compactor.run_once().await;
            });
            let reason = if busy {
                "a save is in progress"
            } else {
                "there are unsaved changes"
            };
            return ShutdownVerdict {
                veto: true,
                reason: Some(reason.to_string()),
            };
        }
        ShutdownVerdict {
            veto: false,
            reason: None,
        }
    }

    /// Persist a column-order preference.
    pub async fn set_column_order(&self, table_id: &str, order: Vec<String>) -> Result<()> {
        let mut state = self.app_state.lock().await;
        state.column_orders.insert(table_id.to_string(), order);
        self.state_store.save(&state).await
    }

    /// The saved column order for a table, if any.
    pub async fn column_order(&self, table_id: &str) -> Option<Vec<String>> {
        self.app_state
            .lock()
            .await
            .column_orders
            .get(table_id)
            .cloned()
    }

    /// Listen for persistence events.
    pub fn subscribe(&self) -> broadcast::Receiver<PersistEvent> {
        self.events.subscribe()
    }

    /// The table registry.
    pub fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// The snapshot store.
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// The changelog store.
    pub fn changelog(&self) -> &Arc<ChangelogStore> {
        &self.changelog
    }

    /// The save scheduler.
    pub fn saver(&self) -> &Arc<SaveScheduler> {
        &self.saver
    }

    /// The compactor.
    pub fn compactor(&self) -> &Arc<Compactor> {
        &self.compactor
    }

    /// The engine options in effect.
    pub fn options(&self) -> &Arc<EngineOptions> {
        &self.options
    }

    /// The flag the timeline raises while replaying, so transient states
    /// are not saved.
    pub fn replay_flag(&self) -> Arc<AtomicBool> {
        self.replaying.clone()
    }

    /// Whether a replay is currently suppressing saves.
    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }
}
