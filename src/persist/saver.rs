/*!
The debounced snapshot scheduler.

Structural changes do not export immediately: a debounce window (scaled by
table size) coalesces bursts of edits, a max-wait deadline forces a flush
under continuous editing, and a priority bit bypasses the debounce entirely
for changes that must not be lost on refresh.

At most one export per table is ever in flight. The `save_starting` bit is
reserved synchronously before the first await of a save, which closes the
window in which two concurrent callers could both pass the in-progress
check; a request that arrives while a save runs is folded into a single
follow-up save, whose priority bit is the OR of the folded requests.
*/
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::EngineOptions;
use crate::model::{is_reserved_snapshot_id, HOT_TABLE_PREFIX, STAGING_TABLE_PREFIX};
use crate::storage::changelog::ChangelogStore;
use crate::storage::snapshots::SnapshotStore;

use super::registry::{TableRegistry, TableResidency};
use super::PersistEvent;

#[derive(Debug, Default)]
struct SaveState {
    dirty: bool,
    save_in_progress: bool,
    save_starting: bool,
    pending_save: bool,
    pending_priority: bool,
    debounce_deadline: Option<Instant>,
    max_wait_deadline: Option<Instant>,
    last_saved_at: Option<Instant>,
    waiter_running: bool,
}

enum WaiterStep {
    Sleep(Instant),
    Fire,
    Done,
}

/// Schedules and serializes snapshot exports, one table at a time.
pub struct SaveScheduler {
    states: Mutex<HashMap<String, SaveState>>,
    snapshots: Arc<SnapshotStore>,
    changelog: Arc<ChangelogStore>,
    registry: Arc<TableRegistry>,
    options: Arc<EngineOptions>,
    events: broadcast::Sender<PersistEvent>,
    replaying: Arc<AtomicBool>,
    idle_notify: tokio::sync::Notify,
}

impl SaveScheduler {
    /// A scheduler over the given stores.
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        changelog: Arc<ChangelogStore>,
        registry: Arc<TableRegistry>,
        options: Arc<EngineOptions>,
        events: broadcast::Sender<PersistEvent>,
        replaying: Arc<AtomicBool>,
    ) -> Self {
        SaveScheduler {
            states: Mutex::new(HashMap::new()),
            snapshots,
            changelog,
            registry,
            options,
            events,
            replaying,
            idle_notify: tokio::sync::Notify::new(),
        }
    }

    /// Record a structural change. Non-priority changes wait out the
    /// debounce window; priority changes start saving immediately.
    /// Internal tables and replay-transient states are never saved.
    pub fn notify_structural_change(self: &Arc<Self>, table_id: &str, priority: bool) {
        if self.replaying.load(Ordering::SeqCst) {
            debug!(table_id, "structural change suppressed during replay");
            return;
        }
        let info = match self.registry.get(table_id) {
            Some(info) => info,
            None => return,
        };
        let storage_name = info.storage_name();
        if is_reserved_snapshot_id(&storage_name)
            || storage_name.starts_with(HOT_TABLE_PREFIX)
            || storage_name.starts_with(STAGING_TABLE_PREFIX)
        {
            return;
        }
        if priority {
            {
                let mut states = self.states.lock().expect("save state lock poisoned");
                states.entry(table_id.to_string()).or_default().dirty = true;
            }
            let this = Arc::clone(self);
            let table_id = table_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = this.save_now(&table_id, true).await {
                    warn!(%table_id, error = %err, "priority save failed");
                }
            });
            return;
        }
        let rows = info.row_count.unwrap_or(0);
        let now = Instant::now();
        let spawn_waiter = {
            let mut states = self.states.lock().expect("save state lock poisoned");
            let state = states.entry(table_id.to_string()).or_default();
            state.dirty = true;
            state.debounce_deadline = Some(now + self.options.debounce_for(rows));
            if state.max_wait_deadline.is_none() {
                state.max_wait_deadline = Some(now + self.options.max_wait_for(rows));
            }
            if state.waiter_running {
                false
            } else {
                state.waiter_running = true;
                true
            }
        };
        if spawn_waiter {
            self.spawn_waiter(table_id.to_string());
        }
    }

    /// Export a table's snapshot now, or fold the request into the save
    /// already in flight. With `priority`, the folded follow-up save is
    /// guaranteed to run even if the table looks clean by then.
    pub async fn save_now(&self, table_id: &str, priority: bool) -> Result<()> {
        if self.replaying.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut states = self.states.lock().expect("save state lock poisoned");
            let state = states.entry(table_id.to_string()).or_default();
            if state.save_in_progress || state.save_starting {
                state.pending_save = true;
                state.pending_priority |= priority;
                return Ok(());
            }
            // Reserved before the first await; a concurrent caller folds
            // into the pending bits instead of double-exporting.
            state.save_starting = true;
        }
        loop {
            {
                let mut states = self.states.lock().expect("save state lock poisoned");
                let state = states.entry(table_id.to_string()).or_default();
                state.save_starting = false;
                state.save_in_progress = true;
                state.dirty = false;
                state.debounce_deadline = None;
                state.max_wait_deadline = None;
            }
            let _ = self.events.send(PersistEvent::SaveStarted {
                table_id: table_id.to_string(),
            });
            let result = self.export_table(table_id).await;
            let run_again = {
                let mut states = self.states.lock().expect("save state lock poisoned");
                let state = states.entry(table_id.to_string()).or_default();
                state.save_in_progress = false;
                state.last_saved_at = Some(Instant::now());
                match &result {
                    Ok(rows) => {
                        let _ = self.events.send(PersistEvent::SaveCompleted {
                            table_id: table_id.to_string(),
                            rows: *rows,
                        });
                    }
                    Err(err) => {
                        state.dirty = true;
                        warn!(table_id, error = %err, "snapshot export failed; table stays dirty");
                        let _ = self.events.send(PersistEvent::SaveFailed {
                            table_id: table_id.to_string(),
                            message: err.to_string(),
                        });
                    }
                }
                let again = state.pending_save && (state.pending_priority || state.dirty);
                state.pending_save = false;
                state.pending_priority = false;
                if again {
                    state.save_starting = true;
                }
                again
            };
            self.idle_notify.notify_waiters();
            if !run_again {
                return result.map(|_| ());
            }
        }
    }

    /// Wait until this table has no save in flight and no unsaved
    /// structural changes, exporting if needed. Errors out instead of
    /// spinning when an export keeps failing.
    pub async fn flush(&self, table_id: &str) -> Result<()> {
        if self.replaying.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            let (busy, dirty) = {
                let states = self.states.lock().expect("save state lock poisoned");
                match states.get(table_id) {
                    Some(state) => (
                        state.save_in_progress || state.save_starting || state.pending_save,
                        state.dirty,
                    ),
                    None => (false, false),
                }
            };
            if busy {
                notified.await;
                continue;
            }
            if dirty {
                self.save_now(table_id, true).await?;
                continue;
            }
            return Ok(());
        }
    }

    /// Note that something else (compaction) just exported this table, so
    /// the imminent debounced save can be suppressed.
    pub fn note_saved(&self, table_id: &str) {
        let mut states = self.states.lock().expect("save state lock poisoned");
        let state = states.entry(table_id.to_string()).or_default();
        state.dirty = false;
        state.last_saved_at = Some(Instant::now());
    }

    /// Whether this table has unsaved structural changes.
    pub fn is_dirty(&self, table_id: &str) -> bool {
        self.states
            .lock()
            .expect("save state lock poisoned")
            .get(table_id)
            .map(|state| state.dirty)
            .unwrap_or(false)
    }

    /// Whether any table has unsaved structural changes.
    pub fn any_dirty(&self) -> bool {
        self.states
            .lock()
            .expect("save state lock poisoned")
            .values()
            .any(|state| state.dirty)
    }

    /// Whether any save is in flight or queued.
    pub fn any_save_active(&self) -> bool {
        self.states
            .lock()
            .expect("save state lock poisoned")
            .values()
            .any(|state| state.save_in_progress || state.save_starting || state.pending_save)
    }

    /// Whether a save for this table is in flight.
    pub fn save_in_progress(&self, table_id: &str) -> bool {
        self.states
            .lock()
            .expect("save state lock poisoned")
            .get(table_id)
            .map(|state| state.save_in_progress || state.save_starting)
            .unwrap_or(false)
    }

    fn recently_saved_window(&self, table_id: &str) -> Duration {
        let rows = self
            .registry
            .get(table_id)
            .and_then(|info| info.row_count)
            .unwrap_or(0);
        self.options.recently_saved_for(rows)
    }

    fn spawn_waiter(self: &Arc<Self>, table_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let step = {
                    let mut states = this.states.lock().expect("save state lock poisoned");
                    let state = states.entry(table_id.clone()).or_default();
                    if state.save_in_progress || state.save_starting {
                        // Fold into the save in flight; its completion
                        // runs the follow-up when the table is dirty.
                        if state.dirty {
                            state.pending_save = true;
                        }
                        state.waiter_running = false;
                        state.debounce_deadline = None;
                        state.max_wait_deadline = None;
                        WaiterStep::Done
                    } else if !state.dirty {
                        state.waiter_running = false;
                        state.debounce_deadline = None;
                        state.max_wait_deadline = None;
                        WaiterStep::Done
                    } else {
                        let deadline = match (state.debounce_deadline, state.max_wait_deadline) {
                            (Some(debounce), Some(max_wait)) => Some(debounce.min(max_wait)),
                            (Some(debounce), None) => Some(debounce),
                            (None, Some(max_wait)) => Some(max_wait),
                            (None, None) => None,
                        };
                        match deadline {
                            None => {
                                state.waiter_running = false;
                                WaiterStep::Done
                            }
                            Some(deadline) => {
                                let now = Instant::now();
                                if now < deadline {
                                    WaiterStep::Sleep(deadline)
                                } else {
                                    let window = this.recently_saved_window(&table_id);
                                    let max_wait_due = state
                                        .max_wait_deadline
                                        .map(|max_wait| now >= max_wait)
                                        .unwrap_or(false);
                                    match state.last_saved_at {
                                        Some(saved)
                                            if now.duration_since(saved) < window
                                                && !max_wait_due =>
                                        {
                                            // Saved moments ago; push the
                                            // debounced fire past the window.
                                            state.debounce_deadline = Some(saved + window);
                                            WaiterStep::Sleep(saved + window)
                                        }
                                        _ => {
                                            state.debounce_deadline = None;
                                            state.max_wait_deadline = None;
                                            state.waiter_running = false;
                                            WaiterStep::Fire
                                        }
                                    }
                                }
                            }
                        }
                    }
                };
                match step {
                    WaiterStep::Done => return,
                    WaiterStep::Sleep(deadline) => sleep_until(deadline).await,
                    WaiterStep::Fire => {
                        if let Err(err) = this.save_now(&table_id, false).await {
                            warn!(%table_id, error = %err, "debounced save failed");
                        }
                        return;
                    }
                }
            }
        });
    }

    async fn export_table(&self, table_id: &str) -> Result<u64> {
        let info = match self.registry.get(table_id) {
            // Deleted while the save was queued; nothing to do.
            None => return Ok(0),
            Some(info) => info,
        };
        if info.residency != TableResidency::Thawed {
            return Ok(0);
        }
        let storage_name = info.storage_name();
        let manifest = self
            .snapshots
            .export_table_to_snapshot(&storage_name, &storage_name, None)
            .await?;
        // The snapshot now contains every journaled edit.
        self.changelog.clear(table_id).await?;
        self.registry.set_row_count(table_id, Some(manifest.total_rows));
        Ok(manifest.total_rows)
    }
}
